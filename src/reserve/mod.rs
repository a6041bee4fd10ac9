//! Address-space reservation - one inaccessible range carved into areas
//!
//! Layout, low to high:
//! 1. read-only area (committed on demand)
//! 2. static area (committed up front)
//! 3. general pool, the `Void` area; heaps are taken from its low end
//! 4. relocation table, then mark bits, each 1/64 of the reservation
//!
//! The `Void` area anchors the registry and hands out heap segments.

mod tables;

pub use tables::{GcTables, TableSizes};

use crate::area::{Area, AreaId, AreaKind};
use crate::config::{align_down, align_up, checked_align_up};
use crate::error::{FatalError, FatalStep, MemoryError, Result};
use crate::logging::{
    info, log_area_created, log_commit, log_memory_warning, log_reservation, perf, warn,
};
use crate::manager::AreaLock;

/// The process's reserved address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// The `Void` area the heap is carved from
    pub area: AreaId,
    pub readonly: AreaId,
    pub static_area: AreaId,
    /// Start and size of the whole OS reservation
    pub base: usize,
    pub size: usize,
    /// The request was below the minimum and was raised to it
    pub forced_minimum: bool,
}

impl<'a> AreaLock<'a> {
    /// Reserve `requested` bytes (rounded to heap segments) and lay out the
    /// read-only, static, pool and table sub-ranges
    pub fn create_reservation(&mut self, requested: usize) -> Result<Reservation> {
        if self.state.reservation.is_some() {
            return Err(MemoryError::ReservationExists);
        }

        let config = self.config;
        let segment = config.heap_segment_size;
        let page = config.page_size;
        let minimum = config.minimum_reservation();

        let mut size = checked_align_up(requested, segment)
            .filter(|size| *size <= config.max_mappable_memory)
            .ok_or(MemoryError::TooSmall { requested })?;
        let forced_minimum = size < minimum;
        if forced_minimum {
            log_memory_warning(&format!(
                "reservation of {} bytes raised to the minimum of {}",
                size, minimum
            ));
            size = minimum;
        }

        let base = match self.os.reserve(config.preferred_base, size) {
            Ok(base) => base,
            Err(err) if forced_minimum => {
                return Err(FatalError::new(
                    FatalStep::Reservation,
                    format!("minimal initial reservation of {} bytes: {}", size, err),
                )
                .into());
            }
            Err(_) => return Err(MemoryError::TooSmall { requested: size }),
        };

        let readonly_end = base + config.readonly_reserve;
        let static_end = readonly_end + config.static_reserve;
        if let Err(err) = self.os.commit(readonly_end, config.static_reserve) {
            warn!(event = "reservation", error = %err, "Static area commit failed");
            if let Err(err) = self.os.release(base, size) {
                warn!(event = "unwind", error = %err, "Reservation release failed");
            }
            return Err(MemoryError::OutOfMemory {
                requested: config.static_reserve,
            });
        }
        log_commit(readonly_end, config.static_reserve);

        let end = base + size;
        let table_size = (size + 63) >> 6;
        let markbits = align_down(end - table_size, page);
        let reloctab = align_down(markbits - table_size, page);

        let mut void = Area::new(static_end, reloctab, AreaKind::Void, config.dnode_size);
        void.markbits = Some(markbits);

        let state = &mut *self.state;
        let area = state.areas.insert(void);
        let readonly = state.areas.insert(Area::new(
            base,
            readonly_end,
            AreaKind::Readonly,
            config.dnode_size,
        ));
        let static_area = state.areas.insert(Area::new(
            readonly_end,
            static_end,
            AreaKind::Static,
            config.dnode_size,
        ));
        for id in [area, readonly, static_area] {
            state.areas.register(id)?;
        }
        state.areas.set_anchor(area)?;

        state.tables = Some(GcTables::new(markbits, reloctab, markbits - reloctab));
        let reservation = Reservation {
            area,
            readonly,
            static_area,
            base,
            size,
            forced_minimum,
        };
        state.reservation = Some(reservation);

        log_reservation(base, size, forced_minimum);
        log_area_created(AreaKind::Readonly.name(), base, readonly_end);
        log_area_created(AreaKind::Static.name(), readonly_end, static_end);
        log_area_created(AreaKind::Void.name(), static_end, reloctab);
        Ok(reservation)
    }

    /// Reserve as much as possible up to `requested`, backing off by 10%
    /// after each refusal until the minimum is forced
    ///
    /// The unrounded request shrinks on every retry, so the loop ends at the
    /// forced minimum at the latest.
    pub fn reserve_with_backoff(&mut self, requested: usize) -> Result<Reservation> {
        let _perf = perf::track("reserve_with_backoff");
        let mut size = requested.min(self.config.max_mappable_memory);
        loop {
            match self.create_reservation(size) {
                Err(MemoryError::TooSmall { .. }) => {
                    size = size / 10 * 9;
                    info!(
                        event = "reservation_backoff",
                        next_size = size,
                        "Reservation refused, retrying smaller"
                    );
                }
                result => return result,
            }
        }
    }

    /// Take `size` bytes (rounded to heap segments) from the low end of the pool
    pub fn allocate_from_reservation(&mut self, size: usize) -> Option<usize> {
        let size = checked_align_up(size, self.config.heap_segment_size)?;
        let dnode_size = self.config.dnode_size;
        let id = self.state.reservation?.area;
        let void = self.state.areas.get_mut(id)?;
        let low = void.low;
        if size > void.high - low {
            return None;
        }
        void.low += size;
        void.active = void.low;
        void.ndnodes -= size / dnode_size;
        Some(low)
    }

    /// Give `size` bytes back to the low end of the pool
    pub(crate) fn return_to_reservation(&mut self, size: usize) -> Result<()> {
        let dnode_size = self.config.dnode_size;
        let id = self
            .state
            .reservation
            .ok_or(MemoryError::NoReservation)?
            .area;
        let void = self.state.areas.area_mut(id)?;
        void.low -= size;
        void.active = void.low;
        void.ndnodes += size / dnode_size;
        Ok(())
    }

    pub fn find_readonly_area(&self) -> Option<AreaId> {
        self.state.areas.find_by_kind(AreaKind::Readonly)
    }

    /// Commit `more` bytes above the read-only area's in-use mark
    ///
    /// Returns `None` when the area would overflow or the commit fails.
    pub fn extend_readonly_area(&mut self, more: usize) -> Option<AreaId> {
        let page = self.config.page_size;
        let id = self.find_readonly_area()?;
        let area = self.state.areas.get(id)?;
        let active = area.active;
        if more > area.high - active {
            return None;
        }

        let start = align_down(active, page);
        let end = align_up(active + more, page);
        if let Err(err) = self.os.commit(start, end - start) {
            log_memory_warning(&format!("read-only area commit failed: {}", err));
            return None;
        }
        log_commit(start, end - start);

        self.state.areas.get_mut(id)?.active = active + more;
        Some(id)
    }
}
