//! Failure-injecting memory backend for unwinding tests

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use super::{OsError, SystemMemory, VirtualMemory};

/// `SystemMemory` with switches that make individual calls fail
#[derive(Debug)]
pub(crate) struct FlakyMemory {
    inner: SystemMemory,
    /// Successful `protect` calls left before failures start; negative is unlimited
    pub protect_budget: AtomicIsize,
    pub fail_map: AtomicBool,
    pub fail_commit: AtomicBool,
    /// Commits starting at or above this address fail
    pub fail_commit_from: AtomicUsize,
    pub fail_reserve: AtomicBool,
    /// Stack mappings not yet unmapped
    pub live_stacks: AtomicUsize,
    /// Guard ranges currently protected
    pub live_guards: AtomicIsize,
}

impl FlakyMemory {
    pub fn new() -> Self {
        Self {
            inner: SystemMemory,
            protect_budget: AtomicIsize::new(-1),
            fail_map: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            fail_commit_from: AtomicUsize::new(usize::MAX),
            fail_reserve: AtomicBool::new(false),
            live_stacks: AtomicUsize::new(0),
            live_guards: AtomicIsize::new(0),
        }
    }

    pub fn fail_protect_after(&self, successes: isize) {
        self.protect_budget.store(successes, Ordering::SeqCst);
    }

    fn injected(op: &'static str) -> OsError {
        OsError { op, code: libc::ENOMEM }
    }
}

impl VirtualMemory for FlakyMemory {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn reserve(&self, hint: Option<usize>, len: usize) -> Result<usize, OsError> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(Self::injected("reserve"));
        }
        self.inner.reserve(hint, len)
    }

    fn release(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.inner.release(addr, len)
    }

    fn commit(&self, addr: usize, len: usize) -> Result<(), OsError> {
        if self.fail_commit.load(Ordering::SeqCst)
            || addr >= self.fail_commit_from.load(Ordering::SeqCst)
        {
            return Err(Self::injected("commit"));
        }
        self.inner.commit(addr, len)
    }

    fn uncommit(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.inner.uncommit(addr, len)
    }

    fn protect(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let budget = self.protect_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(Self::injected("protect"));
        }
        if budget > 0 {
            self.protect_budget.store(budget - 1, Ordering::SeqCst);
        }
        self.inner.protect(addr, len)?;
        self.live_guards.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unprotect(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.inner.unprotect(addr, len)?;
        self.live_guards.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn map_stack(&self, len: usize) -> Result<usize, OsError> {
        if self.fail_map.load(Ordering::SeqCst) {
            return Err(Self::injected("map_stack"));
        }
        let addr = self.inner.map_stack(len)?;
        self.live_stacks.fetch_add(1, Ordering::SeqCst);
        Ok(addr)
    }

    fn unmap_stack(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.inner.unmap_stack(addr, len)?;
        self.live_stacks.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn raise_stack_limit(&self, wanted: usize) -> Result<usize, OsError> {
        self.inner.raise_stack_limit(wanted)
    }
}
