//! Guard descriptors - protected page ranges at the low end of stacks

use core::fmt;

use crate::area::{AreaId, Slab};
use crate::logging::warn;
use crate::os::{OsError, VirtualMemory};

/// How a hit on a guard is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    /// Recoverable once: lifted so the owner can unwind
    Soft,
    /// Fatal for the owning thread
    Hard,
}

impl GuardKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

/// Stable handle to a guard descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardId {
    index: u32,
    generation: u32,
}

impl fmt::Display for GuardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guard#{}.{}", self.index, self.generation)
    }
}

/// Page range `[start, end)` held inaccessible on behalf of a stack area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedArea {
    pub start: usize,
    pub end: usize,
    pub kind: GuardKind,
    pub owner: AreaId,
}

impl ProtectedArea {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Process-wide list of installed guards
///
/// A descriptor exists exactly while its pages are protected: `install`
/// protects before recording, `remove` forgets and unprotects.
#[derive(Debug, Default)]
pub struct Guards {
    slab: Slab<ProtectedArea>,
}

impl Guards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect the guard's pages and record it
    pub(crate) fn install(
        &mut self,
        os: &dyn VirtualMemory,
        guard: ProtectedArea,
    ) -> Result<GuardId, OsError> {
        os.protect(guard.start, guard.len())?;
        let (index, generation) = self.slab.insert(guard);
        Ok(GuardId { index, generation })
    }

    /// Forget a guard and restore access to its pages
    pub(crate) fn remove(&mut self, os: &dyn VirtualMemory, id: GuardId) -> Option<ProtectedArea> {
        let guard = self.slab.remove(id.index, id.generation)?;
        if let Err(err) = os.unprotect(guard.start, guard.len()) {
            warn!(
                event = "unprotect_failed",
                guard = guard.kind.name(),
                error = %err,
                "Could not lift guard protection"
            );
        }
        Some(guard)
    }

    #[inline]
    pub fn get(&self, id: GuardId) -> Option<&ProtectedArea> {
        self.slab.get(id.index, id.generation)
    }

    /// Guard covering `addr`, if any
    pub fn find(&self, addr: usize) -> Option<(GuardId, &ProtectedArea)> {
        self.iter().find(|(_, guard)| guard.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = (GuardId, &ProtectedArea)> {
        self.slab
            .iter()
            .map(|(index, generation, guard)| (GuardId { index, generation }, guard))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slab.len() == 0
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::area::AreaId;
    use crate::os::SystemMemory;

    #[test]
    fn install_find_remove() {
        let os = SystemMemory;
        let page = os.page_size();
        let base = os.map_stack(4 * page).unwrap();
        let owner = AreaId::new(0, 0);

        let mut guards = Guards::new();
        let id = guards
            .install(
                &os,
                ProtectedArea {
                    start: base + page,
                    end: base + 2 * page,
                    kind: GuardKind::Soft,
                    owner,
                },
            )
            .unwrap();

        assert_eq!(guards.len(), 1);
        assert_eq!(guards.find(base + page + 8).map(|(g, _)| g), Some(id));
        assert!(guards.find(base).is_none());
        assert!(guards.find(base + 2 * page).is_none());

        let removed = guards.remove(&os, id).unwrap();
        assert_eq!(removed.kind, GuardKind::Soft);
        assert!(guards.is_empty());
        assert!(guards.get(id).is_none());
        assert!(guards.remove(&os, id).is_none());

        // Pages are writable again
        unsafe { core::ptr::write_bytes((base + page) as *mut u8, 0, page) };
        os.unmap_stack(base, 4 * page).unwrap();
    }
}
