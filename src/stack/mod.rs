//! Guarded stacks - downward-growing stacks with protected low ends
//!
//! Design: Each stack is one OS mapping laid out low to high as
//! 1. slack up to the first page boundary above the mapping start
//! 2. hard guard (fatal on touch)
//! 3. soft guard (recoverable on touch)
//! 4. usable span, filled downward from `high`
//!
//! A stack is built completely or not at all: any failure after the
//! mapping exists unwinds the guards, the area record and the mapping.

mod guard;

#[cfg(test)]
mod tests;

pub use guard::{GuardId, GuardKind, Guards, ProtectedArea};

use crate::area::{Area, AreaId, AreaKind, Mapping};
use crate::config::{align_up, checked_align_up, MemoryConfig};
use crate::error::{MemoryError, Result};
use crate::logging::{log_area_created, log_area_released, log_memory_warning, warn};
use crate::manager::AreaLock;
use crate::os::OsError;

/// Usable sizes for the three stacks of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStackSizes {
    pub value: usize,
    pub aux: usize,
    pub control: usize,
}

impl ThreadStackSizes {
    /// Per-kind minimums for the value and aux stacks, configured size for control
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            value: config.value_stack.min_size,
            aux: config.aux_stack.min_size,
            control: config.effective_thread_stack_size(),
        }
    }
}

/// The stack areas owned by one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStacks {
    pub value: AreaId,
    pub aux: AreaId,
    pub control: AreaId,
}

impl<'a> AreaLock<'a> {
    /// Map a stack with `usable` bytes above `soft` and `hard` guard bytes
    ///
    /// The returned area is not registered.
    pub fn allocate_stack(
        &mut self,
        usable: usize,
        soft: usize,
        hard: usize,
        kind: AreaKind,
    ) -> Result<AreaId> {
        if !kind.is_stack() {
            return Err(MemoryError::WrongKind {
                expected: "stack",
                found: kind,
            });
        }

        let page = self.config.page_size;
        let requested = usable.saturating_add(soft).saturating_add(hard);
        let sizes = checked_align_up(usable, page)
            .zip(checked_align_up(soft, page))
            .zip(checked_align_up(hard, page))
            .and_then(|((usable, soft), hard)| {
                let total = usable.checked_add(soft)?.checked_add(hard)?;
                Some((soft, hard, total, total.checked_add(page)?))
            });
        let Some((soft, hard, total, len)) = sizes else {
            log_memory_warning(&format!("{} of {} bytes cannot be mapped", kind, requested));
            return Err(MemoryError::OutOfMemory { requested });
        };

        let raw = self.os.map_stack(len).map_err(|err| {
            log_memory_warning(&format!("{} mapping failed: {}", kind, err));
            MemoryError::OutOfMemory { requested: len }
        })?;

        let base = align_up(raw + 1, page);
        let hardlimit = base + hard;
        let softlimit = hardlimit + soft;
        let high = base + total;

        let mut area = Area::new(raw, high, kind, self.config.dnode_size);
        area.hardlimit = hardlimit;
        area.softlimit = softlimit;
        area.soft_reserve = soft;
        area.mapping = Some(Mapping { base: raw, len });

        let id = self.state.areas.insert(area);
        if let Err(err) = self.install_stack_guards(id, base, hardlimit, softlimit) {
            log_memory_warning(&format!("{} guard setup failed: {}", kind, err));
            let _ = self.state.areas.remove(id);
            if let Err(err) = self.os.unmap_stack(raw, len) {
                warn!(event = "unwind", error = %err, "Stack unmap failed");
            }
            return Err(MemoryError::OutOfMemory { requested: len });
        }

        log_area_created(kind.name(), raw, high);
        Ok(id)
    }

    /// Allocate and register a stack of `kind`, using its configured guards
    /// and raising `usable` to the kind's minimum
    pub fn allocate_stack_area(&mut self, kind: AreaKind, usable: usize) -> Result<AreaId> {
        let guards = self.config.stack_guards(kind).ok_or(MemoryError::WrongKind {
            expected: "stack",
            found: kind,
        })?;
        let usable = usable.max(guards.min_size);
        let id = self.allocate_stack(usable, guards.soft, guards.hard, kind)?;
        if let Err(err) = self.state.areas.register(id) {
            self.discard_stack(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Register the already-mapped stack of the initial thread
    ///
    /// `bottom` is the high end; the stack spans `[bottom - size, bottom)`.
    /// Only guard protection is installed; nothing is unmapped on release.
    pub fn register_native_stack(&mut self, bottom: usize, size: usize) -> Result<AreaId> {
        let page = self.config.page_size;
        let guards = self.config.control_stack;
        let low = bottom
            .checked_sub(size)
            .ok_or(MemoryError::OutOfMemory { requested: size })?;
        let limits = checked_align_up(low, page).and_then(|lowlimit| {
            let hardlimit = lowlimit.checked_add(checked_align_up(guards.hard, page)?)?;
            let softlimit = hardlimit.checked_add(checked_align_up(guards.soft, page)?)?;
            Some((lowlimit, hardlimit, softlimit))
        });
        let (lowlimit, hardlimit, softlimit) = match limits {
            Some(limits) if limits.2 <= bottom => limits,
            Some((_, _, softlimit)) => {
                return Err(MemoryError::OutOfMemory {
                    requested: softlimit - low,
                })
            }
            None => return Err(MemoryError::OutOfMemory { requested: size }),
        };

        let mut area = Area::new(low, bottom, AreaKind::ControlStack, self.config.dnode_size);
        area.hardlimit = hardlimit;
        area.softlimit = softlimit;
        area.soft_reserve = softlimit - hardlimit;

        let id = self.state.areas.insert(area);
        if let Err(err) = self.install_stack_guards(id, lowlimit, hardlimit, softlimit) {
            log_memory_warning(&format!("native stack guard setup failed: {}", err));
            let _ = self.state.areas.remove(id);
            return Err(MemoryError::OutOfMemory {
                requested: softlimit - lowlimit,
            });
        }
        self.state.areas.register(id)?;
        log_area_created("native control stack", low, bottom);
        Ok(id)
    }

    /// Protect `[base, hardlimit)` as the hard guard and `[hardlimit, softlimit)`
    /// as the soft guard of `id`; empty ranges get no guard
    ///
    /// On failure nothing stays protected.
    fn install_stack_guards(
        &mut self,
        id: AreaId,
        base: usize,
        hardlimit: usize,
        softlimit: usize,
    ) -> core::result::Result<(), OsError> {
        let state = &mut *self.state;
        let mut hard = None;
        if hardlimit > base {
            hard = Some(state.guards.install(
                self.os,
                ProtectedArea {
                    start: base,
                    end: hardlimit,
                    kind: GuardKind::Hard,
                    owner: id,
                },
            )?);
        }
        let mut soft = None;
        if softlimit > hardlimit {
            let installed = state.guards.install(
                self.os,
                ProtectedArea {
                    start: hardlimit,
                    end: softlimit,
                    kind: GuardKind::Soft,
                    owner: id,
                },
            );
            match installed {
                Ok(guard) => soft = Some(guard),
                Err(err) => {
                    if let Some(guard) = hard {
                        state.guards.remove(self.os, guard);
                    }
                    return Err(err);
                }
            }
        }
        if let Some(area) = state.areas.get_mut(id) {
            area.hardprot = hard;
            area.softprot = soft;
        }
        Ok(())
    }

    /// Allocate value, aux and control stacks together
    pub fn allocate_thread_stacks(&mut self, sizes: ThreadStackSizes) -> Result<ThreadStacks> {
        let value = self.allocate_stack_area(AreaKind::ValueStack, sizes.value)?;
        let aux = match self.allocate_stack_area(AreaKind::AuxStack, sizes.aux) {
            Ok(id) => id,
            Err(err) => {
                self.release_stack_area(value)?;
                return Err(err);
            }
        };
        let control = match self.allocate_stack_area(AreaKind::ControlStack, sizes.control) {
            Ok(id) => id,
            Err(err) => {
                self.release_stack_area(aux)?;
                self.release_stack_area(value)?;
                return Err(err);
            }
        };
        Ok(ThreadStacks {
            value,
            aux,
            control,
        })
    }

    pub fn release_thread_stacks(&mut self, stacks: ThreadStacks) -> Result<()> {
        self.release_stack_area(stacks.control)?;
        self.release_stack_area(stacks.aux)?;
        self.release_stack_area(stacks.value)
    }

    /// Unregister a stack area, drop its guards and unmap memory it owns
    pub fn release_stack_area(&mut self, id: AreaId) -> Result<()> {
        let area = self.state.areas.area(id)?;
        if !area.kind.is_stack() {
            return Err(MemoryError::WrongKind {
                expected: "stack",
                found: area.kind,
            });
        }
        if area.is_registered() {
            self.state.areas.unregister(id)?;
        }
        self.discard_stack(id);
        Ok(())
    }

    /// Drop an unregistered stack record with its guards and mapping
    fn discard_stack(&mut self, id: AreaId) {
        let state = &mut *self.state;
        let Ok(area) = state.areas.remove(id) else {
            return;
        };
        for guard in [area.softprot, area.hardprot].into_iter().flatten() {
            state.guards.remove(self.os, guard);
        }
        if let Some(mapping) = area.mapping {
            if let Err(err) = self.os.unmap_stack(mapping.base, mapping.len) {
                warn!(
                    event = "release",
                    kind = area.kind.name(),
                    error = %err,
                    "Stack unmap failed"
                );
            }
        }
        log_area_released(area.kind.name(), area.low, area.high);
    }
}
