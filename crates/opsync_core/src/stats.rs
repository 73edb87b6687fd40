//! Operation log statistics.
//!
//! Counters are atomic and can be read while calls are in progress. The
//! per-user summaries are point-in-time snapshots used by inspection tools.

use opsync_protocol::{DeviceId, UserId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Call counters of an operation log.
#[derive(Debug, Default)]
pub struct OplogStats {
    pushes: AtomicU64,
    pulls: AtomicU64,
    confirms: AtomicU64,
    gets: AtomicU64,
    searches: AtomicU64,
    appended: AtomicU64,
    duplicates: AtomicU64,
    pruned: AtomicU64,
    commits: AtomicU64,
    errors: AtomicU64,
}

impl OplogStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_push(&self, appended: usize, duplicates: usize) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        self.appended.fetch_add(appended as u64, Ordering::Relaxed);
        self.duplicates.fetch_add(duplicates as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_shared(&self, appended: usize) {
        self.appended.fetch_add(appended as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_pull(&self) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_confirm(&self) {
        self.confirms.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pruned(&self, count: usize) {
        self.pruned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of push calls.
    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Returns the number of pull calls.
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    /// Returns the number of confirm calls.
    pub fn confirms(&self) -> u64 {
        self.confirms.load(Ordering::Relaxed)
    }

    /// Returns the number of get calls.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Returns the number of search calls.
    pub fn searches(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    /// Returns the number of operations appended, fan-out copies included.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Returns the number of pushed operations that were already present.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Returns the number of operations removed by retention.
    pub fn pruned(&self) -> u64 {
        self.pruned.load(Ordering::Relaxed)
    }

    /// Returns the number of journal commit groups written.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of calls that failed.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pushes: self.pushes(),
            pulls: self.pulls(),
            confirms: self.confirms(),
            gets: self.gets(),
            searches: self.searches(),
            appended: self.appended(),
            duplicates: self.duplicates(),
            pruned: self.pruned(),
            commits: self.commits(),
            errors: self.errors(),
        }
    }
}

/// Point-in-time copy of [`OplogStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Push calls.
    pub pushes: u64,
    /// Pull calls.
    pub pulls: u64,
    /// Confirm calls.
    pub confirms: u64,
    /// Get calls.
    pub gets: u64,
    /// Search calls.
    pub searches: u64,
    /// Operations appended.
    pub appended: u64,
    /// Duplicate pushes.
    pub duplicates: u64,
    /// Operations pruned.
    pub pruned: u64,
    /// Journal commit groups.
    pub commits: u64,
    /// Failed calls.
    pub errors: u64,
}

/// Delivery state of one device, as reported by inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    /// The device.
    pub device: DeviceId,
    /// Contiguous confirmation watermark.
    pub confirmed_through: u64,
    /// Live operations the device has not confirmed.
    pub pending: usize,
    /// Highest sequence delivered.
    pub last_pulled: u64,
    /// Wall time of the last activity.
    pub last_seen_ms: u64,
    /// The device may have missed pruned operations.
    pub history_gap: bool,
}

/// Log state of one user, as reported by inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    /// The user.
    pub user: UserId,
    /// Highest sequence assigned.
    pub head: u64,
    /// Live operations.
    pub live_operations: usize,
    /// Operations pruned so far.
    pub pruned_total: u64,
    /// Devices ordered by id.
    pub devices: Vec<DeviceSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = OplogStats::new();
        stats.record_push(3, 1);
        stats.record_push(0, 2);
        stats.record_pruned(2);
        stats.record_commit();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pushes, 2);
        assert_eq!(snapshot.appended, 3);
        assert_eq!(snapshot.duplicates, 3);
        assert_eq!(snapshot.pruned, 2);
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.errors, 0);
    }
}
