//! OS virtual memory - the seam between area bookkeeping and the kernel
//!
//! Design: Every page-level operation the area code performs goes through
//! the `VirtualMemory` trait:
//! 1. Reserve / release address space (no access, no backing store)
//! 2. Commit / uncommit pages inside a reservation
//! 3. Protect / unprotect guard pages
//! 4. Map / unmap standalone stack memory
//!
//! `SystemMemory` is the real implementation (mmap/mprotect on Unix,
//! VirtualAlloc/VirtualProtect on Windows). Raw OS error codes stop here:
//! callers only see `OsError`, which they fold into `MemoryError`.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub mod paging;

#[cfg(all(test, unix))]
pub(crate) mod testing;

#[cfg(unix)]
pub use unix::SystemMemory;
#[cfg(windows)]
pub use windows::SystemMemory;

use core::fmt;

/// Page-level memory operations used by the area manager
///
/// Addresses and lengths are page-aligned by the caller.
pub trait VirtualMemory: Send + Sync {
    fn page_size(&self) -> usize;

    /// Reserve `len` bytes of inaccessible address space, preferably at `hint`
    fn reserve(&self, hint: Option<usize>, len: usize) -> Result<usize, OsError>;

    /// Return a whole reservation to the OS
    fn release(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Make reserved pages readable and writable
    fn commit(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Discard page contents and make them inaccessible again
    fn uncommit(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Remove all access (guard pages)
    fn protect(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Restore read/write access
    fn unprotect(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Map fresh readable and writable memory for a stack
    fn map_stack(&self, len: usize) -> Result<usize, OsError>;

    fn unmap_stack(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Raise the process stack limit toward `wanted`, returning the limit in effect
    fn raise_stack_limit(&self, wanted: usize) -> Result<usize, OsError>;
}

/// Failed OS memory call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsError {
    pub op: &'static str,
    pub code: i32,
}

impl OsError {
    /// Capture the calling thread's last OS error
    pub fn last(op: &'static str) -> Self {
        Self {
            op,
            code: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed: {}",
            self.op,
            std::io::Error::from_raw_os_error(self.code)
        )
    }
}

impl std::error::Error for OsError {}

/// Page size of the running system
pub fn page_size() -> usize {
    SystemMemory.page_size()
}
