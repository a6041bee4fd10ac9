//! mmap/mprotect backend

use super::{OsError, VirtualMemory};
use core::ptr;
use libc::{
    c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};

#[cfg(any(target_os = "linux", target_os = "android"))]
const RESERVE_FLAGS: libc::c_int = MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RESERVE_FLAGS: libc::c_int = MAP_PRIVATE | MAP_ANONYMOUS;

#[cfg(any(target_os = "linux", target_os = "android"))]
const STACK_FLAGS: libc::c_int = MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_STACK;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const STACK_FLAGS: libc::c_int = MAP_PRIVATE | MAP_ANONYMOUS;

/// Virtual memory through the host's mmap family
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl SystemMemory {
    fn mprotect(
        addr: usize,
        len: usize,
        prot: libc::c_int,
        op: &'static str,
    ) -> Result<(), OsError> {
        if len == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::mprotect(addr as *mut c_void, len, prot) };
        if rc == 0 {
            Ok(())
        } else {
            Err(OsError::last(op))
        }
    }
}

impl VirtualMemory for SystemMemory {
    fn page_size(&self) -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    fn reserve(&self, hint: Option<usize>, len: usize) -> Result<usize, OsError> {
        let want = hint.map_or(ptr::null_mut(), |addr| addr as *mut c_void);
        let start = unsafe { libc::mmap(want, len, PROT_NONE, RESERVE_FLAGS, -1, 0) };
        if start == MAP_FAILED {
            Err(OsError::last("mmap (reserve)"))
        } else {
            Ok(start as usize)
        }
    }

    fn release(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let rc = unsafe { libc::munmap(addr as *mut c_void, len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(OsError::last("munmap"))
        }
    }

    fn commit(&self, addr: usize, len: usize) -> Result<(), OsError> {
        Self::mprotect(addr, len, PROT_READ | PROT_WRITE, "mprotect (commit)")
    }

    fn uncommit(&self, addr: usize, len: usize) -> Result<(), OsError> {
        if len == 0 {
            return Ok(());
        }
        // Mapping fresh inaccessible pages over the range discards their contents
        let result = unsafe {
            libc::mmap(
                addr as *mut c_void,
                len,
                PROT_NONE,
                RESERVE_FLAGS | MAP_FIXED,
                -1,
                0,
            )
        };
        if result == MAP_FAILED || result as usize != addr {
            Err(OsError::last("mmap (uncommit)"))
        } else {
            Ok(())
        }
    }

    fn protect(&self, addr: usize, len: usize) -> Result<(), OsError> {
        Self::mprotect(addr, len, PROT_NONE, "mprotect (guard)")
    }

    fn unprotect(&self, addr: usize, len: usize) -> Result<(), OsError> {
        Self::mprotect(addr, len, PROT_READ | PROT_WRITE, "mprotect (unguard)")
    }

    fn map_stack(&self, len: usize) -> Result<usize, OsError> {
        let start = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                STACK_FLAGS,
                -1,
                0,
            )
        };
        if start == MAP_FAILED {
            Err(OsError::last("mmap (stack)"))
        } else {
            Ok(start as usize)
        }
    }

    fn unmap_stack(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.release(addr, len)
    }

    fn raise_stack_limit(&self, wanted: usize) -> Result<usize, OsError> {
        let mut limits = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limits) } != 0 {
            return Err(OsError::last("getrlimit"));
        }

        let mut wanted = wanted as libc::rlim_t;
        if limits.rlim_max != libc::RLIM_INFINITY && wanted > limits.rlim_max {
            wanted = limits.rlim_max;
        }
        if limits.rlim_cur != libc::RLIM_INFINITY && limits.rlim_cur < wanted {
            limits.rlim_cur = wanted;
            if unsafe { libc::setrlimit(libc::RLIMIT_STACK, &limits) } != 0 {
                return Err(OsError::last("setrlimit"));
            }
        }
        Ok(wanted as usize)
    }
}
