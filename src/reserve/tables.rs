//! Collector tables - mark bits and relocation table at the top of the reservation
//!
//! Both tables are carved from the reservation once, sized for the whole
//! reservation, and committed lazily as the heap grows.

use crate::config::align_up;
use crate::logging::log_commit;
use crate::os::{OsError, VirtualMemory};

/// Bytes each table needs for a heap of `ndnodes` dnodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSizes {
    pub markbits: usize,
    pub reloctab: usize,
}

impl TableSizes {
    /// One mark bit per dnode plus three header words; one relocation word
    /// per 64 dnodes plus one
    pub fn required(ndnodes: usize, word: usize) -> Self {
        Self {
            markbits: 3 * word + (ndnodes + 7) / 8,
            reloctab: word * (((ndnodes + 63) >> 6) + 1),
        }
    }
}

/// Location and committed extent of the collector tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcTables {
    pub markbits: usize,
    pub reloctab: usize,
    /// Bytes reserved for each table
    pub capacity: usize,
    markbits_committed: usize,
    reloctab_committed: usize,
}

impl GcTables {
    pub(crate) fn new(markbits: usize, reloctab: usize, capacity: usize) -> Self {
        Self {
            markbits,
            reloctab,
            capacity,
            markbits_committed: 0,
            reloctab_committed: 0,
        }
    }

    /// Table bytes currently readable and writable
    pub fn committed(&self) -> TableSizes {
        TableSizes {
            markbits: self.markbits_committed,
            reloctab: self.reloctab_committed,
        }
    }

    /// Commit whichever table is too small for `ndnodes`
    ///
    /// Committed extents only ever grow.
    pub(crate) fn ensure_writable(
        &mut self,
        os: &dyn VirtualMemory,
        ndnodes: usize,
        word: usize,
    ) -> Result<(), OsError> {
        let page = os.page_size();
        let required = TableSizes::required(ndnodes, word);

        if required.reloctab > self.reloctab_committed {
            let len = align_up(required.reloctab, page).min(self.capacity);
            os.commit(self.reloctab, len)?;
            os.unprotect(self.reloctab, len)?;
            log_commit(self.reloctab, len);
            self.reloctab_committed = len;
        }

        if required.markbits > self.markbits_committed {
            let len = align_up(required.markbits, page).min(self.capacity);
            os.commit(self.markbits, len)?;
            os.unprotect(self.markbits, len)?;
            log_commit(self.markbits, len);
            self.markbits_committed = len;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_sizes_for_empty_heap() {
        let sizes = TableSizes::required(0, 8);
        assert_eq!(sizes.markbits, 24);
        assert_eq!(sizes.reloctab, 8);
    }

    #[test]
    fn required_sizes_round_up_partial_units() {
        let sizes = TableSizes::required(65, 8);
        assert_eq!(sizes.markbits, 24 + 9);
        assert_eq!(sizes.reloctab, 8 * 3);
    }

    #[cfg(unix)]
    #[test]
    fn commit_tracks_high_water_mark() {
        use crate::os::SystemMemory;

        let os = SystemMemory;
        let page = os.page_size();
        let capacity = 16 * page;
        let base = os.reserve(None, 2 * capacity).unwrap();
        let mut tables = GcTables::new(base + capacity, base, capacity);

        tables.ensure_writable(&os, 1024, 8).unwrap();
        let first = tables.committed();
        assert!(first.markbits >= TableSizes::required(1024, 8).markbits);
        assert_eq!(first.markbits % page, 0);

        // Shrinking the heap never uncommits
        tables.ensure_writable(&os, 16, 8).unwrap();
        assert_eq!(tables.committed(), first);

        let ndnodes = 8 * page * 8;
        tables.ensure_writable(&os, ndnodes, 8).unwrap();
        let grown = tables.committed();
        assert!(grown.markbits >= TableSizes::required(ndnodes, 8).markbits);
        assert!(grown.reloctab >= TableSizes::required(ndnodes, 8).reloctab);
        unsafe { core::ptr::write_bytes(tables.markbits as *mut u8, 0, grown.markbits) };

        os.release(base, 2 * capacity).unwrap();
    }
}
