//! Generations - the chain of heap areas an incremental collector walks
//!
//! Design: The chain runs `dynamic -> g1 -> g2 -> tenured` through the
//! `older`/`younger` links of the area records. The three elder areas start
//! as zero-length placeholders at the heap's low end; the collector moves
//! their boundaries as it promotes. Incremental collection is switched on
//! by linking `dynamic.older` to g1 and off by clearing that link.

use serde::{Deserialize, Serialize};

use crate::area::{Area, AreaId, AreaKind};
use crate::error::{MemoryError, Result};
use crate::logging::{debug, info};
use crate::manager::AreaLock;

/// Allocation volume that makes each generation due for collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationThresholds {
    pub g0: usize,
    pub g1: usize,
    pub g2: usize,
}

#[cfg(target_pointer_width = "64")]
impl Default for GenerationThresholds {
    fn default() -> Self {
        Self {
            g0: 2 << 20,
            g1: 4 << 20,
            g2: 8 << 20,
        }
    }
}

#[cfg(not(target_pointer_width = "64"))]
impl Default for GenerationThresholds {
    fn default() -> Self {
        Self {
            g0: 1 << 20,
            g1: 2 << 20,
            g2: 4 << 20,
        }
    }
}

/// The elder generations, youngest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generations {
    pub g1: AreaId,
    pub g2: AreaId,
    pub tenured: AreaId,
}

impl<'a> AreaLock<'a> {
    /// Create g1, g2 and tenured as empty areas chained above the dynamic area
    ///
    /// The dynamic area is not linked to them until incremental collection
    /// is enabled.
    pub fn create_placeholder_generations(
        &mut self,
        thresholds: GenerationThresholds,
    ) -> Result<Generations> {
        if self.state.generations.is_some() {
            return Err(MemoryError::GenerationsExist);
        }
        let dynamic = self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?;
        let dnode_size = self.config.dnode_size;
        let state = &mut *self.state;

        let (low, markbits, static_dnodes, static_used) = {
            let area = state.areas.area_mut(dynamic)?;
            area.threshold = thresholds.g0;
            let moved = (area.low, area.markbits, area.static_dnodes, area.static_used);
            area.static_dnodes = 0;
            area.static_used = 0;
            moved
        };

        // Created static, relabelled once registered
        let placeholder = || Area::new(low, low, AreaKind::Static, dnode_size);
        let mut g1 = placeholder();
        let mut g2 = placeholder();
        let mut tenured = placeholder();
        g1.threshold = thresholds.g1;
        g2.threshold = thresholds.g2;
        tenured.refbits = markbits;
        tenured.static_dnodes = static_dnodes;
        tenured.static_used = static_used;

        let tenured = state.areas.insert(tenured);
        let g2 = state.areas.insert(g2);
        let g1 = state.areas.insert(g1);
        for id in [tenured, g2, g1] {
            state.areas.register(id)?;
        }
        for id in [tenured, g2, g1] {
            state.areas.area_mut(id)?.kind = AreaKind::Dynamic;
        }

        {
            let area = state.areas.area_mut(g1)?;
            area.younger = Some(dynamic);
            area.older = Some(g2);
        }
        {
            let area = state.areas.area_mut(g2)?;
            area.younger = Some(g1);
            area.older = Some(tenured);
        }
        state.areas.area_mut(tenured)?.younger = Some(g2);

        let generations = Generations { g1, g2, tenured };
        state.generations = Some(generations);
        info!(
            event = "generations_created",
            g0 = thresholds.g0,
            g1 = thresholds.g1,
            g2 = thresholds.g2,
            "Generation placeholders created"
        );
        Ok(generations)
    }

    /// Link or unlink the dynamic area from g1, returning the previous state
    pub fn set_incremental_collection(&mut self, enable: bool) -> Result<bool> {
        let dynamic = self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?;
        let generations = self.state.generations;
        let area = self.state.areas.area_mut(dynamic)?;
        let was_enabled = area.older.is_some();

        match (enable, generations) {
            (true, Some(generations)) => area.older = Some(generations.g1),
            (true, None) => return Err(MemoryError::NoGenerations),
            (false, _) => area.older = None,
        }
        if was_enabled != enable {
            info!(
                event = "incremental_collection",
                enabled = enable,
                "Incremental collection toggled"
            );
        }
        Ok(was_enabled)
    }

    /// Turn incremental collection on; calling it again changes nothing
    pub fn enable_incremental_collection(&mut self) -> Result<bool> {
        self.set_incremental_collection(true)
    }

    pub fn incremental_collection_enabled(&self) -> bool {
        self.state
            .dynamic
            .and_then(|id| self.state.areas.get(id))
            .map_or(false, |area| area.older.is_some())
    }

    /// Areas reachable from the dynamic area through `older` links
    ///
    /// Bounded by the registry size, so a corrupted link cannot loop forever.
    pub fn chain(&self) -> Result<Vec<AreaId>> {
        let mut next = Some(self.state.dynamic.ok_or(MemoryError::NoDynamicArea)?);
        let limit = self.state.areas.len();
        let mut chain = Vec::new();
        while let Some(id) = next {
            if chain.len() == limit {
                break;
            }
            chain.push(id);
            next = self.state.areas.area(id)?.older;
        }
        Ok(chain)
    }

    /// Count `bytes` allocated into `id` since its last collection
    pub fn record_allocation(&mut self, id: AreaId, bytes: usize) -> Result<()> {
        let area = self.state.areas.area_mut(id)?;
        area.allocated_since_gc = area.allocated_since_gc.saturating_add(bytes);
        Ok(())
    }

    /// Reset the allocation count of `id` after collecting it
    pub fn record_collection(&mut self, id: AreaId) -> Result<()> {
        let area = self.state.areas.area_mut(id)?;
        debug!(
            event = "collection",
            area = %id,
            allocated_bytes = area.allocated_since_gc,
            "Generation collected"
        );
        area.allocated_since_gc = 0;
        Ok(())
    }

    pub fn is_due(&self, id: AreaId) -> Result<bool> {
        Ok(self.state.areas.area(id)?.is_due())
    }

    /// Due generations along the chain, youngest first
    pub fn due_generations(&self) -> Result<Vec<AreaId>> {
        let mut due = Vec::new();
        for id in self.chain()? {
            if self.state.areas.area(id)?.is_due() {
                due.push(id);
            }
        }
        Ok(due)
    }
}
