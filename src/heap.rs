//! Dynamic heap - the collected area that grows and shrinks in segments
//!
//! The dynamic area sits directly below the reservation pool: growing
//! moves its `high` and the pool's `low` up together, shrinking moves them
//! back down. Every change refreshes the published heap bounds and makes
//! sure the collector tables cover the new size.

use crate::area::{Area, AreaId, AreaKind};
use crate::config::{align_down, align_up, checked_align_up};
use crate::error::{FatalError, FatalStep, MemoryError, Result};
use crate::logging::{
    log_area_created, log_heap_resize, log_memory_warning, log_uncommit, perf, warn,
};
use crate::manager::AreaLock;
use crate::os::paging::{report_paging_delta, PagingInfo};

impl<'a> AreaLock<'a> {
    /// Carve the first dynamic area, `initial` bytes in use, from the pool
    ///
    /// The pool being too small is fatal: there is no heap to run without.
    pub fn allocate_dynamic_area(&mut self, initial: usize) -> Result<AreaId> {
        if self.state.dynamic.is_some() {
            return Err(MemoryError::DynamicAreaExists);
        }
        let reservation = self.state.reservation.ok_or(MemoryError::NoReservation)?;

        let total = checked_align_up(initial, self.config.heap_segment_size).ok_or_else(|| {
            FatalError::new(
                FatalStep::FirstHeapAllocation,
                format!("heap image of {} bytes does not fit the address space", initial),
            )
        })?;
        let start = self.allocate_from_reservation(total).ok_or_else(|| {
            FatalError::new(
                FatalStep::FirstHeapAllocation,
                "reserved area too small to load heap image",
            )
        })?;
        let end = start + total;
        if let Err(err) = self.os.commit(start, total) {
            return Err(FatalError::new(
                FatalStep::FirstHeapAllocation,
                format!("could not commit {} bytes: {}", total, err),
            )
            .into());
        }

        let mut area = Area::new(start, end, AreaKind::Dynamic, self.config.dnode_size);
        area.active = start + initial;
        area.threshold = self.config.thresholds.g0;

        let state = &mut *self.state;
        area.markbits = state.areas.area_mut(reservation.area)?.markbits.take();
        let id = state.areas.insert(area);
        state.areas.register(id)?;
        state.dynamic = Some(id);
        state.heap_bounds = Some((start, end));
        log_area_created(AreaKind::Dynamic.name(), start, end);

        self.ensure_tables_writable().map_err(|err| {
            MemoryError::from(FatalError::new(FatalStep::FirstHeapAllocation, err.to_string()))
        })?;
        Ok(id)
    }

    /// Extend the dynamic area by `delta` bytes (rounded up to segments)
    ///
    /// Returns `false` when the pool cannot supply them or the pages cannot
    /// be committed; the heap is unchanged in that case.
    pub fn grow_dynamic_area(&mut self, delta: usize) -> Result<bool> {
        let id = self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?;
        let reservation = self.state.reservation.ok_or(MemoryError::NoReservation)?;
        let pool = self.state.areas.area(reservation.area)?;
        let delta = match checked_align_up(delta, self.config.heap_segment_size) {
            Some(0) => return Ok(true),
            Some(delta) if delta <= pool.high - pool.low => delta,
            _ => return Ok(false),
        };
        let old_high = self.state.areas.area(id)?.high;
        debug_assert_eq!(old_high, pool.low, "dynamic area detached from pool");

        if let Err(err) = self.os.commit(old_high, delta) {
            log_memory_warning(&format!("heap growth by {} bytes: {}", delta, err));
            return Ok(false);
        }
        if self.allocate_from_reservation(delta).is_none() {
            self.discard_pages(old_high, delta);
            return Ok(false);
        }
        self.set_dynamic_high(id, old_high + delta)?;

        if let Err(err) = self.ensure_tables_writable() {
            log_memory_warning(&format!("collector tables for grown heap: {}", err));
            self.set_dynamic_high(id, old_high)?;
            self.discard_pages(old_high, delta);
            self.return_to_reservation(delta)?;
            return Ok(false);
        }

        log_heap_resize(true, delta, old_high + delta);
        Ok(true)
    }

    /// Return `delta` bytes (rounded down to segments) from the top of the
    /// dynamic area to the pool
    ///
    /// Refused (`false`) when that would cut into the in-use part.
    pub fn shrink_dynamic_area(&mut self, delta: usize) -> Result<bool> {
        let id = self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?;
        let delta = align_down(delta, self.config.heap_segment_size);
        if delta == 0 {
            return Ok(true);
        }

        let area = self.state.areas.area(id)?;
        let (low, high, active) = (area.low, area.high, area.active);
        if delta > high - low || high - delta < active {
            warn!(
                event = "heap_shrink_refused",
                delta_bytes = delta,
                in_use = active - low,
                "Shrink would cut into the in-use heap"
            );
            return Ok(false);
        }

        let new_high = high - delta;
        self.set_dynamic_high(id, new_high)?;
        self.state.areas.area_mut(id)?.hardlimit = new_high;
        self.discard_pages(new_high, delta);
        self.return_to_reservation(delta)?;

        log_heap_resize(false, delta, new_high);
        Ok(true)
    }

    /// Commit mark bits and relocation table for the current heap size
    pub fn ensure_tables_writable(&mut self) -> Result<()> {
        let id = self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?;
        let ndnodes = self.state.areas.area(id)?.ndnodes;
        let word = core::mem::size_of::<usize>();
        let state = &mut *self.state;
        let tables = state.tables.as_mut().ok_or(MemoryError::NoReservation)?;
        tables
            .ensure_writable(self.os, ndnodes, word)
            .map_err(|err| {
                log_memory_warning(&format!("collector table commit: {}", err));
                MemoryError::OutOfMemory {
                    requested: tables_requirement(ndnodes, word),
                }
            })
    }

    /// Resize the heap to leave `free_target` bytes above `live_bytes`
    ///
    /// Never shrinks below the in-use mark. Returns whether the heap now has
    /// the requested size.
    pub fn resize_dynamic_heap(&mut self, live_bytes: usize, free_target: usize) -> Result<bool> {
        let _perf = perf::track("resize_dynamic_heap");
        let id = self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?;
        let segment = self.config.heap_segment_size;
        let area = self.state.areas.area(id)?;
        let (low, high, active) = (area.low, area.high, area.active);

        // Segment multiples are counted from the heap's low end
        let target = live_bytes
            .checked_add(free_target)
            .and_then(|wanted| checked_align_up(wanted, segment))
            .map(|wanted| wanted.max(align_up(active - low, segment)).max(segment))
            .and_then(|span| low.checked_add(span));
        let Some(target) = target else {
            log_memory_warning(&format!(
                "heap of {} live bytes plus {} free does not fit the address space",
                live_bytes, free_target
            ));
            return Ok(false);
        };

        let start = PagingInfo::sample();
        let resized = if target > high {
            self.grow_dynamic_area(target - high)?
        } else if target < high {
            self.shrink_dynamic_area(high - target)?
        } else {
            true
        };

        report_paging_delta("resize_dynamic_heap", &start, &PagingInfo::sample());
        Ok(resized)
    }

    fn set_dynamic_high(&mut self, id: AreaId, high: usize) -> Result<()> {
        let dnode_size = self.config.dnode_size;
        let state = &mut *self.state;
        let area = state.areas.area_mut(id)?;
        area.high = high;
        area.ndnodes = (high - area.low) / dnode_size;
        state.heap_bounds = Some((area.low, high));
        Ok(())
    }

    /// Uncommit pages; failures are logged and otherwise ignored
    fn discard_pages(&self, addr: usize, len: usize) {
        match self.os.uncommit(addr, len) {
            Ok(()) => log_uncommit(addr, len),
            Err(err) => log_memory_warning(&format!("uncommit of {} bytes: {}", len, err)),
        }
    }
}

fn tables_requirement(ndnodes: usize, word: usize) -> usize {
    let sizes = crate::reserve::TableSizes::required(ndnodes, word);
    sizes.markbits + sizes.reloctab
}
