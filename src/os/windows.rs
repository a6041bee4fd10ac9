//! VirtualAlloc/VirtualProtect backend

use super::{OsError, VirtualMemory};
use core::ptr;
use winapi::shared::minwindef::{DWORD, LPVOID};
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
};

/// Virtual memory through the Win32 VirtualAlloc family
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl SystemMemory {
    fn set_protection(
        addr: usize,
        len: usize,
        prot: DWORD,
        op: &'static str,
    ) -> Result<(), OsError> {
        if len == 0 {
            return Ok(());
        }
        let mut old: DWORD = 0;
        let ok = unsafe { VirtualProtect(addr as LPVOID, len, prot, &mut old) };
        if ok != 0 {
            Ok(())
        } else {
            Err(OsError::last(op))
        }
    }
}

impl VirtualMemory for SystemMemory {
    fn page_size(&self) -> usize {
        let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    fn reserve(&self, hint: Option<usize>, len: usize) -> Result<usize, OsError> {
        let want = hint.map_or(ptr::null_mut(), |addr| addr as LPVOID);
        let mut start = unsafe { VirtualAlloc(want, len, MEM_RESERVE, PAGE_NOACCESS) };
        if start.is_null() && !want.is_null() {
            // The hint is advisory, as with mmap
            start = unsafe { VirtualAlloc(ptr::null_mut(), len, MEM_RESERVE, PAGE_NOACCESS) };
        }
        if start.is_null() {
            Err(OsError::last("VirtualAlloc (reserve)"))
        } else {
            Ok(start as usize)
        }
    }

    fn release(&self, addr: usize, _len: usize) -> Result<(), OsError> {
        let ok = unsafe { VirtualFree(addr as LPVOID, 0, MEM_RELEASE) };
        if ok != 0 {
            Ok(())
        } else {
            Err(OsError::last("VirtualFree (release)"))
        }
    }

    fn commit(&self, addr: usize, len: usize) -> Result<(), OsError> {
        if len == 0 {
            return Ok(());
        }
        let start = unsafe { VirtualAlloc(addr as LPVOID, len, MEM_COMMIT, PAGE_READWRITE) };
        if start.is_null() {
            Err(OsError::last("VirtualAlloc (commit)"))
        } else {
            Ok(())
        }
    }

    fn uncommit(&self, addr: usize, len: usize) -> Result<(), OsError> {
        if len == 0 {
            return Ok(());
        }
        let ok = unsafe { VirtualFree(addr as LPVOID, len, MEM_DECOMMIT) };
        if ok != 0 {
            Ok(())
        } else {
            Err(OsError::last("VirtualFree (decommit)"))
        }
    }

    fn protect(&self, addr: usize, len: usize) -> Result<(), OsError> {
        Self::set_protection(addr, len, PAGE_NOACCESS, "VirtualProtect (guard)")
    }

    fn unprotect(&self, addr: usize, len: usize) -> Result<(), OsError> {
        Self::set_protection(addr, len, PAGE_READWRITE, "VirtualProtect (unguard)")
    }

    fn map_stack(&self, len: usize) -> Result<usize, OsError> {
        let start = unsafe {
            VirtualAlloc(ptr::null_mut(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };
        if start.is_null() {
            Err(OsError::last("VirtualAlloc (stack)"))
        } else {
            Ok(start as usize)
        }
    }

    fn unmap_stack(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.release(addr, len)
    }

    fn raise_stack_limit(&self, wanted: usize) -> Result<usize, OsError> {
        // Thread stack sizes are fixed at link or thread-creation time
        Ok(wanted)
    }
}
