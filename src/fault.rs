//! Fault classification - deciding what a protection fault means
//!
//! `classify_fault` is a pure lookup in the guard list, safe to call from
//! a fault handler. `handle_fault` performs the response for soft guards:
//! the guard is lifted so the stack owner can unwind, and a smaller soft
//! guard is re-armed below the faulting page so a runaway recursion still
//! stops before the hard guard.

use crate::area::AreaId;
use crate::config::align_down;
use crate::error::{MemoryError, Result};
use crate::logging::{info, log_guard_fault};
use crate::manager::AreaLock;
use crate::stack::{GuardId, GuardKind, Guards, ProtectedArea};

/// What a faulting address hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fatal for the owning stack
    HardGuard { area: AreaId, guard: GuardId },
    /// Recoverable once for this guard instance
    SoftGuard { area: AreaId, guard: GuardId },
    /// Not a guard page; someone else's fault
    Unrelated,
}

/// Outcome of `handle_fault`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResponse {
    /// Hard guard hit; the owner cannot continue
    Fatal { area: AreaId },
    /// Soft guard lifted; `rearmed` is the replacement below the faulting page
    Recovered {
        area: AreaId,
        rearmed: Option<GuardId>,
    },
    Unrelated,
}

/// Look `addr` up in the guard list
pub fn classify_fault(guards: &Guards, addr: usize) -> FaultKind {
    match guards.find(addr) {
        Some((guard, protected)) => match protected.kind {
            GuardKind::Hard => FaultKind::HardGuard {
                area: protected.owner,
                guard,
            },
            GuardKind::Soft => FaultKind::SoftGuard {
                area: protected.owner,
                guard,
            },
        },
        None => FaultKind::Unrelated,
    }
}

impl<'a> AreaLock<'a> {
    pub fn classify_fault(&self, addr: usize) -> FaultKind {
        classify_fault(&self.state.guards, addr)
    }

    /// Classify `addr` and respond to soft-guard hits
    pub fn handle_fault(&mut self, addr: usize) -> Result<FaultResponse> {
        match self.classify_fault(addr) {
            FaultKind::Unrelated => Ok(FaultResponse::Unrelated),
            FaultKind::HardGuard { area, .. } => {
                log_guard_fault(GuardKind::Hard.name(), addr);
                Ok(FaultResponse::Fatal { area })
            }
            FaultKind::SoftGuard { area, guard } => {
                log_guard_fault(GuardKind::Soft.name(), addr);
                let rearmed = self.lift_soft_guard(area, guard, addr)?;
                Ok(FaultResponse::Recovered { area, rearmed })
            }
        }
    }

    fn lift_soft_guard(
        &mut self,
        area_id: AreaId,
        guard_id: GuardId,
        addr: usize,
    ) -> Result<Option<GuardId>> {
        let page = self.config.page_size;
        let state = &mut *self.state;
        let lifted = state
            .guards
            .remove(self.os, guard_id)
            .ok_or(MemoryError::StaleHandle)?;

        let faulted_page = align_down(addr, page);
        let mut rearmed = None;
        if faulted_page > lifted.start {
            // Best effort: without the replacement the hard guard still stops the stack
            rearmed = state
                .guards
                .install(
                    self.os,
                    ProtectedArea {
                        start: lifted.start,
                        end: faulted_page,
                        kind: GuardKind::Soft,
                        owner: area_id,
                    },
                )
                .ok();
        }

        let area = state.areas.area_mut(area_id)?;
        area.softprot = rearmed;
        area.softlimit = if rearmed.is_some() {
            faulted_page
        } else {
            lifted.start
        };
        Ok(rearmed)
    }

    /// Put back the full soft guard of a stack that has unwound above it
    ///
    /// Returns `false` while `sp` is still inside the span the guard would
    /// cover.
    pub fn restore_soft_guard(&mut self, area_id: AreaId, sp: usize) -> Result<bool> {
        let state = &mut *self.state;
        let area = state.areas.area(area_id)?;
        if !area.kind.is_stack() {
            return Err(MemoryError::WrongKind {
                expected: "stack",
                found: area.kind,
            });
        }
        let start = area.hardlimit;
        let end = start + area.soft_reserve;
        if area.soft_reserve == 0 || sp < end {
            return Ok(false);
        }
        let current = area.softprot;

        if let Some(guard) = current {
            state.guards.remove(self.os, guard);
        }
        let installed = state.guards.install(
            self.os,
            ProtectedArea {
                start,
                end,
                kind: GuardKind::Soft,
                owner: area_id,
            },
        );

        let area = state.areas.area_mut(area_id)?;
        match installed {
            Ok(guard) => {
                area.softprot = Some(guard);
                area.softlimit = end;
                info!(event = "soft_guard_restored", area = %area_id, "Soft guard restored");
                Ok(true)
            }
            Err(_) => {
                area.softprot = None;
                area.softlimit = start;
                Err(MemoryError::OutOfMemory {
                    requested: end - start,
                })
            }
        }
    }
}
