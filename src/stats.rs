//! Usage counters shared between a manager and the handles it creates.

use portable_atomic::{AtomicU64, Ordering};

/// Snapshot of a manager's counters.
///
/// `acquires - releases` is the number of leases handed out by the manager
/// that are still held, across every generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Leases handed to callers (including `replace_and_acquire`)
    pub acquires: u64,
    /// Caller leases released
    pub releases: u64,
    /// Successful replacements
    pub replacements: u64,
    /// Resources handed to their free function
    pub frees: u64,
    /// CAS attempts that lost a race and were retried
    pub contended_retries: u64,
}

impl ManagerStats {
    pub fn outstanding(&self) -> u64 {
        self.acquires.saturating_sub(self.releases)
    }
}

pub(crate) struct StatsCounters {
    enabled: bool,
    acquires: AtomicU64,
    releases: AtomicU64,
    replacements: AtomicU64,
    frees: AtomicU64,
    contended_retries: AtomicU64,
}

impl StatsCounters {
    pub(crate) const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            contended_retries: AtomicU64::new(0),
        }
    }

    #[inline]
    fn bump(&self, counter: &AtomicU64) {
        if self.enabled {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn record_acquire(&self) {
        self.bump(&self.acquires);
    }

    pub(crate) fn record_release(&self) {
        self.bump(&self.releases);
    }

    pub(crate) fn record_replacement(&self) {
        self.bump(&self.replacements);
    }

    pub(crate) fn record_free(&self) {
        self.bump(&self.frees);
    }

    pub(crate) fn record_retry(&self) {
        self.bump(&self.contended_retries);
    }

    pub(crate) fn snapshot(&self) -> ManagerStats {
        // Releases are read before acquires so a snapshot never reports more
        // releases than acquires.
        let releases = self.releases.load(Ordering::Acquire);
        let frees = self.frees.load(Ordering::Acquire);
        ManagerStats {
            acquires: self.acquires.load(Ordering::Acquire),
            releases,
            replacements: self.replacements.load(Ordering::Acquire),
            frees,
            contended_retries: self.contended_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_counters_stay_zero() {
        let counters = StatsCounters::new(false);
        counters.record_acquire();
        counters.record_free();

        assert_eq!(counters.snapshot(), ManagerStats::default());
    }

    #[test]
    fn test_outstanding() {
        let counters = StatsCounters::new(true);
        counters.record_acquire();
        counters.record_acquire();
        counters.record_release();

        let stats = counters.snapshot();
        assert_eq!(stats.acquires, 2);
        assert_eq!(stats.outstanding(), 1);
    }
}
