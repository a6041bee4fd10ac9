//! Areas - typed spans of address space and the table that owns them
//!
//! Design: Area records live in a slab and are addressed by `AreaId`
//! handles instead of pointers:
//! 1. Registry links (`registry_prev`/`registry_next`) form a circular list
//! 2. Generation links (`older`/`younger`) form an acyclic chain
//! 3. Freed slots bump their generation, so stale handles resolve to nothing

mod registry;
mod slab;


pub use registry::RegistryIter;
pub(crate) use slab::Slab;

use core::fmt;

use crate::error::{MemoryError, Result};
use crate::stack::GuardId;

/// What an area holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaKind {
    /// Reserved, uncommitted address space
    Void,
    Readonly,
    Static,
    Dynamic,
    ValueStack,
    AuxStack,
    ControlStack,
}

impl AreaKind {
    #[inline]
    pub fn is_stack(self) -> bool {
        matches!(self, Self::ValueStack | Self::AuxStack | Self::ControlStack)
    }

    #[inline]
    pub fn is_heap(self) -> bool {
        matches!(self, Self::Dynamic | Self::Static)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Readonly => "readonly",
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::ValueStack => "value stack",
            Self::AuxStack => "aux stack",
            Self::ControlStack => "control stack",
        }
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable handle to an area record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaId {
    index: u32,
    generation: u32,
}

impl AreaId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Raw OS allocation backing a stack area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub base: usize,
    pub len: usize,
}

/// One contiguous span `[low, high)` of a single kind
#[derive(Debug, Clone)]
pub struct Area {
    pub kind: AreaKind,
    pub low: usize,
    pub high: usize,
    /// In-use watermark: heaps fill upward from `low`, stacks downward from `high`
    pub active: usize,
    pub softlimit: usize,
    pub hardlimit: usize,
    /// Bytes allocated since the last collection that make this generation due
    pub threshold: usize,
    pub allocated_since_gc: usize,
    pub ndnodes: usize,
    pub static_dnodes: usize,
    pub static_used: usize,
    /// Address of the mark-bit vector this area uses
    pub markbits: Option<usize>,
    /// Address of the reference bits (tenured generation only)
    pub refbits: Option<usize>,
    pub older: Option<AreaId>,
    pub younger: Option<AreaId>,
    pub softprot: Option<GuardId>,
    pub hardprot: Option<GuardId>,
    /// Bytes of soft guard the stack was created with
    pub soft_reserve: usize,
    pub(crate) mapping: Option<Mapping>,
    pub(crate) registry_prev: Option<AreaId>,
    pub(crate) registry_next: Option<AreaId>,
}

impl Area {
    pub fn new(low: usize, high: usize, kind: AreaKind, dnode_size: usize) -> Self {
        debug_assert!(low <= high, "inverted area bounds");
        let active = if kind.is_stack() { high } else { low };
        Self {
            kind,
            low,
            high,
            active,
            softlimit: low,
            hardlimit: low,
            threshold: 0,
            allocated_since_gc: 0,
            ndnodes: (high - low) / dnode_size,
            static_dnodes: 0,
            static_used: 0,
            markbits: None,
            refbits: None,
            older: None,
            younger: None,
            softprot: None,
            hardprot: None,
            soft_reserve: 0,
            mapping: None,
            registry_prev: None,
            registry_next: None,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.high - self.low
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.low && addr < self.high
    }

    /// OS allocation owned by this area, if any
    #[inline]
    pub fn mapping(&self) -> Option<Mapping> {
        self.mapping
    }

    /// Whether allocation since the last collection exceeds the threshold
    #[inline]
    pub fn is_due(&self) -> bool {
        self.allocated_since_gc > self.threshold
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registry_next.is_some()
    }
}

/// Slab of area records plus the circular registry anchored in it
#[derive(Debug, Default)]
pub struct Areas {
    slab: Slab<Area>,
    anchor: Option<AreaId>,
    registered: usize,
}

impl Areas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an area record; it is not registered yet
    pub(crate) fn insert(&mut self, area: Area) -> AreaId {
        let (index, generation) = self.slab.insert(area);
        AreaId::new(index, generation)
    }

    /// Drop an unregistered area record
    pub(crate) fn remove(&mut self, id: AreaId) -> Result<Area> {
        if self.area(id)?.is_registered() {
            return Err(MemoryError::AlreadyRegistered(id));
        }
        self.slab
            .remove(id.index, id.generation)
            .ok_or(MemoryError::StaleHandle)
    }

    #[inline]
    pub fn get(&self, id: AreaId) -> Option<&Area> {
        self.slab.get(id.index, id.generation)
    }

    #[inline]
    pub fn get_mut(&mut self, id: AreaId) -> Option<&mut Area> {
        self.slab.get_mut(id.index, id.generation)
    }

    /// Like `get`, for callers that propagate errors
    pub fn area(&self, id: AreaId) -> Result<&Area> {
        self.get(id).ok_or(MemoryError::StaleHandle)
    }

    pub(crate) fn area_mut(&mut self, id: AreaId) -> Result<&mut Area> {
        self.get_mut(id).ok_or(MemoryError::StaleHandle)
    }

    /// Number of registered areas
    #[inline]
    pub fn len(&self) -> usize {
        self.registered
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    /// The area every registry walk starts from
    #[inline]
    pub fn anchor(&self) -> Option<AreaId> {
        self.anchor
    }

    /// Every stored record, registered or not
    pub(crate) fn records(&self) -> impl Iterator<Item = (AreaId, &Area)> {
        self.slab
            .iter()
            .map(|(index, generation, area)| (AreaId::new(index, generation), area))
    }
}
