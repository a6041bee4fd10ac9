//! Stack allocator tests
//!
//! Test suite organized by component:
//! - Layout: guard and usable span ordering
//! - Registration: per-kind minimums, native stacks
//! - Unwinding: injected OS failures leave nothing behind

#![cfg(unix)]

use super::*;
use crate::config::MemoryConfig;
use crate::manager::MemoryManager;
use crate::os::testing::FlakyMemory;
use crate::os::VirtualMemory;
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn flaky_manager() -> (MemoryManager, Arc<FlakyMemory>) {
    let os = Arc::new(FlakyMemory::new());
    let manager = MemoryManager::with_os(MemoryConfig::minimal(), os.clone());
    (manager, os)
}

// ===== Layout Tests =====

#[test]
fn layout_orders_guards_below_usable_span() {
    let manager = MemoryManager::new(MemoryConfig::minimal());
    let page = manager.config().page_size;
    let mut lock = manager.lock();
    let id = lock
        .allocate_stack(8 * page, 2 * page, page, AreaKind::ValueStack)
        .unwrap();

    let area = lock.areas().area(id).unwrap().clone();
    let hard = *lock.guards().get(area.hardprot.unwrap()).unwrap();
    let soft = *lock.guards().get(area.softprot.unwrap()).unwrap();

    assert!(area.low < hard.start);
    assert_eq!(hard.start % page, 0);
    assert_eq!(hard.end, area.hardlimit);
    assert_eq!(soft.start, area.hardlimit);
    assert_eq!(soft.end, area.softlimit);
    assert_eq!(area.high - area.softlimit, 8 * page);
    assert_eq!(area.active, area.high);
    assert_eq!(hard.kind, GuardKind::Hard);
    assert_eq!(soft.kind, GuardKind::Soft);
    assert_eq!(hard.owner, id);
    assert!(!area.is_registered());

    // Usable span is writable
    unsafe { core::ptr::write_bytes(area.softlimit as *mut u8, 0x5a, 8 * page) };
    lock.release_stack_area(id).unwrap();
}

#[test]
fn non_stack_kind_is_rejected() {
    let manager = MemoryManager::new(MemoryConfig::minimal());
    let mut lock = manager.lock();
    let err = lock.allocate_stack(4096, 0, 0, AreaKind::Dynamic).unwrap_err();
    assert!(matches!(err, MemoryError::WrongKind { found: AreaKind::Dynamic, .. }));
    assert!(lock.allocate_stack_area(AreaKind::Static, 4096).is_err());
}

#[test]
fn zero_guard_sizes_install_no_guards() {
    let manager = MemoryManager::new(MemoryConfig::minimal());
    let page = manager.config().page_size;
    let mut lock = manager.lock();
    let id = lock.allocate_stack(page, 0, 0, AreaKind::AuxStack).unwrap();
    let area = lock.areas().area(id).unwrap();
    assert!(area.hardprot.is_none());
    assert!(area.softprot.is_none());
    assert_eq!(area.softlimit, area.hardlimit);
    assert!(lock.guards().is_empty());
    lock.release_stack_area(id).unwrap();
}

// ===== Registration Tests =====

#[test]
fn stack_area_is_clamped_to_kind_minimum() {
    let manager = MemoryManager::new(MemoryConfig::minimal());
    let min = manager.config().control_stack.min_size;
    let mut lock = manager.lock();
    let id = lock.allocate_stack_area(AreaKind::ControlStack, 1).unwrap();
    let area = lock.areas().area(id).unwrap();
    assert!(area.is_registered());
    assert_eq!(area.high - area.softlimit, min);
    lock.release_stack_area(id).unwrap();
    assert!(lock.areas().is_empty());
    assert!(lock.guards().is_empty());
}

#[test]
fn thread_stacks_allocate_and_release_together() {
    let (manager, os) = flaky_manager();
    let stacks = manager
        .allocate_thread_stacks(ThreadStackSizes::from_config(manager.config()))
        .unwrap();

    manager.with_areas(|areas| {
        assert_eq!(areas.len(), 3);
        assert_eq!(areas.area(stacks.value).unwrap().kind, AreaKind::ValueStack);
        assert_eq!(areas.area(stacks.aux).unwrap().kind, AreaKind::AuxStack);
        assert_eq!(areas.area(stacks.control).unwrap().kind, AreaKind::ControlStack);
    });
    assert_eq!(manager.lock().guards().len(), 6);

    manager.release_thread_stacks(stacks).unwrap();
    assert_eq!(os.live_stacks.load(Ordering::SeqCst), 0);
    assert_eq!(os.live_guards.load(Ordering::SeqCst), 0);
    assert!(manager.with_areas(|areas| areas.is_empty()));
    assert!(manager.lock().areas().area(stacks.value).is_err());
}

#[test]
fn native_stack_gets_guards_but_keeps_its_memory() {
    let (manager, os) = flaky_manager();
    let page = manager.config().page_size;
    let size = 32 * page;
    let buffer = os.map_stack(size).unwrap();
    let bottom = buffer + size;

    let id = manager.register_native_stack(bottom, size).unwrap();
    {
        let lock = manager.lock();
        let area = lock.areas().area(id).unwrap();
        assert_eq!(area.low, buffer);
        assert_eq!(area.high, bottom);
        assert!(area.mapping().is_none());
        let cstack = lock.config().control_stack;
        assert_eq!(area.hardlimit, buffer + cstack.hard);
        assert_eq!(area.softlimit, area.hardlimit + cstack.soft);
        assert_eq!(lock.guards().len(), 2);
    }

    manager.lock().release_stack_area(id).unwrap();
    assert_eq!(os.live_guards.load(Ordering::SeqCst), 0);
    // Still mapped: releasing a native stack only lifts its guards
    assert_eq!(os.live_stacks.load(Ordering::SeqCst), 1);
    unsafe { core::ptr::write_bytes(buffer as *mut u8, 0, size) };
    os.unmap_stack(buffer, size).unwrap();
}

#[test]
fn native_stack_too_small_for_guards() {
    let manager = MemoryManager::new(MemoryConfig::minimal());
    let page = manager.config().page_size;
    let err = manager.register_native_stack(0x1000_0000, page).unwrap_err();
    assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    assert!(manager.with_areas(|areas| areas.is_empty()));
}

// ===== Unwinding Tests =====

#[test]
fn mapping_failure_is_out_of_memory() {
    let (manager, os) = flaky_manager();
    os.fail_map.store(true, Ordering::SeqCst);
    let err = manager
        .lock()
        .allocate_stack_area(AreaKind::ValueStack, 0)
        .unwrap_err();
    assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    assert!(manager.with_areas(|areas| areas.is_empty()));
}

#[test]
fn unrepresentable_stack_size_is_out_of_memory() {
    let (manager, os) = flaky_manager();
    let page = manager.config().page_size;
    let mut lock = manager.lock();
    for (usable, soft, hard) in [
        (usize::MAX - 10, page, page),
        (usize::MAX / 2, usize::MAX / 2, page),
        (page, page, usize::MAX - page),
    ] {
        let err = lock
            .allocate_stack(usable, soft, hard, AreaKind::ValueStack)
            .unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    }
    assert!(lock.areas().is_empty());
    assert!(lock.guards().is_empty());
    drop(lock);
    assert_eq!(os.live_stacks.load(Ordering::SeqCst), 0);
}

#[test]
fn soft_guard_failure_unwinds_hard_guard_and_mapping() {
    let (manager, os) = flaky_manager();
    os.fail_protect_after(1);
    let err = manager
        .lock()
        .allocate_stack_area(AreaKind::ValueStack, 0)
        .unwrap_err();
    assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    assert_eq!(os.live_guards.load(Ordering::SeqCst), 0);
    assert_eq!(os.live_stacks.load(Ordering::SeqCst), 0);
    assert!(manager.lock().guards().is_empty());
}

#[test]
fn late_thread_stack_failure_releases_earlier_stacks() {
    let (manager, os) = flaky_manager();
    // Value and aux stacks get both guards, the control stack none
    os.fail_protect_after(4);
    let err = manager
        .allocate_thread_stacks(ThreadStackSizes::from_config(manager.config()))
        .unwrap_err();
    assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    assert_eq!(os.live_stacks.load(Ordering::SeqCst), 0);
    assert_eq!(os.live_guards.load(Ordering::SeqCst), 0);
    assert!(manager.with_areas(|areas| areas.is_empty()));
}

// ===== Properties =====

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn layout_ordering_holds(usable in 1usize..16, soft in 1usize..4, hard in 1usize..4) {
        let manager = MemoryManager::new(MemoryConfig::minimal());
        let page = manager.config().page_size;
        let mut lock = manager.lock();
        let id = lock
            .allocate_stack(usable * page, soft * page, hard * page, AreaKind::ControlStack)
            .unwrap();
        let area = lock.areas().area(id).unwrap().clone();
        let hard_guard = *lock.guards().get(area.hardprot.unwrap()).unwrap();
        let soft_guard = *lock.guards().get(area.softprot.unwrap()).unwrap();

        prop_assert!(area.low < hard_guard.start);
        prop_assert!(hard_guard.start < hard_guard.end);
        prop_assert!(hard_guard.end <= soft_guard.start);
        prop_assert!(soft_guard.start < soft_guard.end);
        prop_assert!(soft_guard.end <= area.softlimit);
        prop_assert!(area.softlimit <= area.high);
        prop_assert_eq!(area.high - area.softlimit, usable * page);

        let mapping = area.mapping().unwrap();
        prop_assert!(area.high <= mapping.base + mapping.len);

        lock.release_stack_area(id).unwrap();
    }
}
