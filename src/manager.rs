//! Memory manager - the single context owning every area
//!
//! Design: All mutable area state sits behind one `parking_lot::Mutex`
//! (the region lock). Mutating operations are methods on `AreaLock`, the
//! held-lock view, so a caller that needs several steps to be atomic takes
//! the lock once and calls them in sequence. `MemoryManager` offers
//! single-call wrappers that lock, delegate and unlock.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::area::{AreaId, Areas};
use crate::config::MemoryConfig;
use crate::error::{FatalError, FatalStep, Result};
use crate::fault::{FaultKind, FaultResponse};
use crate::generation::{GenerationThresholds, Generations};
use crate::logging::{info, warn};
use crate::os::{SystemMemory, VirtualMemory};
use crate::reserve::{GcTables, Reservation};
use crate::stack::{Guards, ThreadStackSizes, ThreadStacks};

/// Everything the region lock protects
#[derive(Debug, Default)]
pub(crate) struct AreaState {
    pub(crate) areas: Areas,
    pub(crate) guards: Guards,
    pub(crate) reservation: Option<Reservation>,
    pub(crate) tables: Option<GcTables>,
    pub(crate) dynamic: Option<AreaId>,
    pub(crate) generations: Option<Generations>,
    /// Bounds of the dynamic heap as last published
    pub(crate) heap_bounds: Option<(usize, usize)>,
}

/// Held region lock with access to the configuration and the OS seam
pub struct AreaLock<'a> {
    pub(crate) config: &'a MemoryConfig,
    pub(crate) os: &'a dyn VirtualMemory,
    pub(crate) state: MutexGuard<'a, AreaState>,
}

impl<'a> AreaLock<'a> {
    #[inline]
    pub fn config(&self) -> &MemoryConfig {
        self.config
    }

    #[inline]
    pub fn areas(&self) -> &Areas {
        &self.state.areas
    }

    #[inline]
    pub fn guards(&self) -> &Guards {
        &self.state.guards
    }

    #[inline]
    pub fn reservation(&self) -> Option<Reservation> {
        self.state.reservation
    }

    #[inline]
    pub fn tables(&self) -> Option<&GcTables> {
        self.state.tables.as_ref()
    }

    #[inline]
    pub fn dynamic_area(&self) -> Option<AreaId> {
        self.state.dynamic
    }

    #[inline]
    pub fn generations(&self) -> Option<Generations> {
        self.state.generations
    }

    /// `(low, high)` of the dynamic heap
    #[inline]
    pub fn heap_bounds(&self) -> Option<(usize, usize)> {
        self.state.heap_bounds
    }
}

/// Owner of the address-space reservation, every area and every guard
pub struct MemoryManager {
    config: MemoryConfig,
    os: Arc<dyn VirtualMemory>,
    state: Mutex<AreaState>,
}

impl MemoryManager {
    /// Manager backed by the host's virtual memory
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_os(config, Arc::new(SystemMemory))
    }

    pub fn with_os(config: MemoryConfig, os: Arc<dyn VirtualMemory>) -> Self {
        Self {
            config,
            os,
            state: Mutex::new(AreaState::default()),
        }
    }

    #[inline]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Take the region lock
    pub fn lock(&self) -> AreaLock<'_> {
        AreaLock {
            config: &self.config,
            os: &*self.os,
            state: self.state.lock(),
        }
    }

    /// Read the area table under the region lock
    pub fn with_areas<R>(&self, f: impl FnOnce(&Areas) -> R) -> R {
        f(&self.state.lock().areas)
    }

    pub fn create_reservation(&self, requested: usize) -> Result<Reservation> {
        self.lock().create_reservation(requested)
    }

    pub fn reserve_with_backoff(&self, requested: usize) -> Result<Reservation> {
        self.lock().reserve_with_backoff(requested)
    }

    pub fn allocate_dynamic_area(&self, initial: usize) -> Result<AreaId> {
        self.lock().allocate_dynamic_area(initial)
    }

    pub fn grow_dynamic_area(&self, delta: usize) -> Result<bool> {
        self.lock().grow_dynamic_area(delta)
    }

    pub fn shrink_dynamic_area(&self, delta: usize) -> Result<bool> {
        self.lock().shrink_dynamic_area(delta)
    }

    pub fn resize_dynamic_heap(&self, live_bytes: usize, free_target: usize) -> Result<bool> {
        self.lock().resize_dynamic_heap(live_bytes, free_target)
    }

    pub fn create_placeholder_generations(
        &self,
        thresholds: GenerationThresholds,
    ) -> Result<Generations> {
        self.lock().create_placeholder_generations(thresholds)
    }

    pub fn set_incremental_collection(&self, enable: bool) -> Result<bool> {
        self.lock().set_incremental_collection(enable)
    }

    pub fn allocate_thread_stacks(&self, sizes: ThreadStackSizes) -> Result<ThreadStacks> {
        self.lock().allocate_thread_stacks(sizes)
    }

    pub fn release_thread_stacks(&self, stacks: ThreadStacks) -> Result<()> {
        self.lock().release_thread_stacks(stacks)
    }

    pub fn register_native_stack(&self, bottom: usize, size: usize) -> Result<AreaId> {
        self.lock().register_native_stack(bottom, size)
    }

    pub fn classify_fault(&self, addr: usize) -> FaultKind {
        self.lock().classify_fault(addr)
    }

    pub fn handle_fault(&self, addr: usize) -> Result<FaultResponse> {
        self.lock().handle_fault(addr)
    }

    pub fn restore_soft_guard(&self, area: AreaId, sp: usize) -> Result<bool> {
        self.lock().restore_soft_guard(area, sp)
    }

    /// Raise the process stack limit so the initial thread can use
    /// `stack_size` bytes above its control stack guards
    pub fn ensure_stack_limit(&self, stack_size: usize) -> core::result::Result<usize, FatalError> {
        let guards = self.config.control_stack;
        let wanted = stack_size + guards.hard + guards.soft;
        let limit = self.os.raise_stack_limit(wanted).map_err(|err| {
            FatalError::new(
                FatalStep::StackLimit,
                format!("stack resource limit too small: {}", err),
            )
        })?;
        info!(event = "stack_limit", wanted, limit, "Stack resource limit checked");
        Ok(limit)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let os = &*self.os;
        let state = self.state.get_mut();

        let guard_ids: Vec<_> = state.guards.iter().map(|(id, _)| id).collect();
        for id in guard_ids {
            state.guards.remove(os, id);
        }

        for (_, area) in state.areas.records() {
            if let Some(mapping) = area.mapping() {
                if let Err(err) = os.unmap_stack(mapping.base, mapping.len) {
                    warn!(
                        event = "teardown",
                        kind = area.kind.name(),
                        error = %err,
                        "Stack unmap failed"
                    );
                }
            }
        }

        if let Some(reservation) = state.reservation.take() {
            if let Err(err) = os.release(reservation.base, reservation.size) {
                warn!(event = "teardown", error = %err, "Reservation release failed");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::area::AreaKind;
    use crate::os::testing::FlakyMemory;
    use std::sync::atomic::Ordering;

    #[test]
    fn drop_releases_stacks_and_guards() {
        let os = Arc::new(FlakyMemory::new());
        {
            let manager = MemoryManager::with_os(MemoryConfig::minimal(), os.clone());
            manager.create_reservation(0).unwrap();
            manager
                .allocate_thread_stacks(ThreadStackSizes::from_config(manager.config()))
                .unwrap();
            assert_eq!(os.live_stacks.load(Ordering::SeqCst), 3);
            assert!(os.live_guards.load(Ordering::SeqCst) > 0);
        }
        assert_eq!(os.live_stacks.load(Ordering::SeqCst), 0);
        assert_eq!(os.live_guards.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn with_areas_sees_registered_areas() {
        let manager = MemoryManager::new(MemoryConfig::minimal());
        manager.create_reservation(0).unwrap();
        let kinds: Vec<_> = manager.with_areas(|areas| areas.iter().map(|(_, a)| a.kind).collect());
        assert_eq!(kinds, vec![AreaKind::Void, AreaKind::Readonly, AreaKind::Static]);
    }

    #[test]
    fn lock_exposes_state() {
        let manager = MemoryManager::new(MemoryConfig::minimal());
        let lock = manager.lock();
        assert!(lock.reservation().is_none());
        assert!(lock.dynamic_area().is_none());
        assert!(lock.heap_bounds().is_none());
        assert!(lock.areas().is_empty());
        assert!(lock.guards().is_empty());
    }

    #[test]
    fn stack_limit_covers_guards() {
        let manager = MemoryManager::new(MemoryConfig::minimal());
        let limit = manager.ensure_stack_limit(1 << 20).unwrap();
        assert!(limit > 0);
    }
}
