//! Paging statistics - fault counts sampled around expensive operations

use crate::logging::info;

/// Snapshot of the process's paging counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingInfo {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub swaps: u64,
}

impl PagingInfo {
    #[cfg(unix)]
    pub fn sample() -> Self {
        let mut usage: libc::rusage = unsafe { core::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
            return Self::default();
        }
        Self {
            minor_faults: usage.ru_minflt as u64,
            major_faults: usage.ru_majflt as u64,
            swaps: usage.ru_nswap as u64,
        }
    }

    #[cfg(not(unix))]
    pub fn sample() -> Self {
        Self::default()
    }

    /// Counters accumulated since `start`
    pub fn since(&self, start: &PagingInfo) -> PagingInfo {
        PagingInfo {
            minor_faults: self.minor_faults.saturating_sub(start.minor_faults),
            major_faults: self.major_faults.saturating_sub(start.major_faults),
            swaps: self.swaps.saturating_sub(start.swaps),
        }
    }
}

/// Log the paging activity between two samples
pub fn report_paging_delta(operation: &str, start: &PagingInfo, stop: &PagingInfo) {
    let delta = stop.since(start);
    info!(
        event = "paging",
        operation,
        soft_faults = delta.minor_faults,
        faults = delta.major_faults,
        pageins = delta.swaps,
        "Paging activity"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_saturates() {
        let start = PagingInfo {
            minor_faults: 10,
            major_faults: 2,
            swaps: 0,
        };
        let stop = PagingInfo {
            minor_faults: 15,
            major_faults: 1,
            swaps: 0,
        };
        let delta = stop.since(&start);
        assert_eq!(delta.minor_faults, 5);
        assert_eq!(delta.major_faults, 0);
    }

    #[cfg(unix)]
    #[test]
    fn touching_pages_counts_faults() {
        let start = PagingInfo::sample();
        let buffer = vec![1u8; 1 << 20];
        let stop = PagingInfo::sample();
        assert_eq!(buffer.iter().map(|&b| b as usize).sum::<usize>(), 1 << 20);
        assert!(stop.minor_faults >= start.minor_faults);
        report_paging_delta("test", &start, &stop);
    }
}
