//! Area registry - circular catalog of every live area
//!
//! Links are `AreaId`s stored in the area records themselves, so insertion
//! and removal are O(1). The registry is a set: insertion position carries
//! no meaning. Walks start at the anchor (the reservation, once it exists).

use super::{Area, AreaId, AreaKind, Areas};
use crate::error::{MemoryError, Result};

impl Areas {
    /// Link an area into the registry
    pub fn register(&mut self, id: AreaId) -> Result<()> {
        if self.area(id)?.is_registered() {
            return Err(MemoryError::AlreadyRegistered(id));
        }

        match self.anchor {
            None => {
                let area = self.area_mut(id)?;
                area.registry_prev = Some(id);
                area.registry_next = Some(id);
                self.anchor = Some(id);
            }
            Some(anchor) => {
                // Insert just before the anchor, i.e. at the tail of a walk
                let tail = self
                    .area(anchor)?
                    .registry_prev
                    .ok_or(MemoryError::NotRegistered(anchor))?;
                self.area_mut(tail)?.registry_next = Some(id);
                self.area_mut(anchor)?.registry_prev = Some(id);
                let area = self.area_mut(id)?;
                area.registry_prev = Some(tail);
                area.registry_next = Some(anchor);
            }
        }

        self.registered += 1;
        Ok(())
    }

    /// Unlink an area from the registry
    pub fn unregister(&mut self, id: AreaId) -> Result<()> {
        let (prev, next) = {
            let area = self.area(id)?;
            match (area.registry_prev, area.registry_next) {
                (Some(prev), Some(next)) => (prev, next),
                _ => return Err(MemoryError::NotRegistered(id)),
            }
        };

        if next == id {
            self.anchor = None;
        } else {
            self.area_mut(prev)?.registry_next = Some(next);
            self.area_mut(next)?.registry_prev = Some(prev);
            if self.anchor == Some(id) {
                self.anchor = Some(next);
            }
        }

        let area = self.area_mut(id)?;
        area.registry_prev = None;
        area.registry_next = None;
        self.registered -= 1;
        Ok(())
    }

    /// Make `id` the starting point of registry walks
    pub(crate) fn set_anchor(&mut self, id: AreaId) -> Result<()> {
        if !self.area(id)?.is_registered() {
            return Err(MemoryError::NotRegistered(id));
        }
        self.anchor = Some(id);
        Ok(())
    }

    /// Walk every registered area once, starting at the anchor
    pub fn iter(&self) -> RegistryIter<'_> {
        RegistryIter {
            areas: self,
            next: self.anchor,
            remaining: self.registered,
        }
    }

    /// First registered area of the given kind
    pub fn find_by_kind(&self, kind: AreaKind) -> Option<AreaId> {
        self.iter()
            .find(|(_, area)| area.kind == kind)
            .map(|(id, _)| id)
    }

    /// Registered area whose range contains `addr`
    ///
    /// Zero-length areas never match.
    pub fn area_containing(&self, addr: usize) -> Option<AreaId> {
        self.iter()
            .find(|(_, area)| area.contains(addr))
            .map(|(id, _)| id)
    }
}

/// Registry walk; yields each registered area exactly once
pub struct RegistryIter<'a> {
    areas: &'a Areas,
    next: Option<AreaId>,
    remaining: usize,
}

impl<'a> Iterator for RegistryIter<'a> {
    type Item = (AreaId, &'a Area);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.next?;
        let area = self.areas.get(id)?;
        self.remaining -= 1;
        self.next = area.registry_next;
        Some((id, area))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
