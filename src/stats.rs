//! Store statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by a store and its dispatch queue.
///
/// Fields mean the same as in [`StoreStatsSnapshot`].
pub struct StoreStats {
    /// See [`StoreStatsSnapshot::inserts`]
    pub inserts: AtomicU64,
    /// See [`StoreStatsSnapshot::updates`]
    pub updates: AtomicU64,
    /// See [`StoreStatsSnapshot::conflicts`]
    pub conflicts: AtomicU64,
    /// See [`StoreStatsSnapshot::gets`]
    pub gets: AtomicU64,
    /// See [`StoreStatsSnapshot::removals`]
    pub removals: AtomicU64,
    /// See [`StoreStatsSnapshot::scans`]
    pub scans: AtomicU64,
    /// See [`StoreStatsSnapshot::commands_queued`]
    pub commands_queued: AtomicU64,
    /// See [`StoreStatsSnapshot::commands_acknowledged`]
    pub commands_acknowledged: AtomicU64,
}

impl StoreStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            commands_queued: AtomicU64::new(0),
            commands_acknowledged: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter. Counters are read one by one, not atomically as a set.
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            commands_queued: self.commands_queued.load(Ordering::Relaxed),
            commands_acknowledged: self.commands_acknowledged.load(Ordering::Relaxed),
        }
    }
}

impl Default for StoreStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`StoreStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    /// Sagas written for the first time
    pub inserts: u64,
    /// Successful versioned saves
    pub updates: u64,
    /// Saves rejected because of a version or existence conflict
    pub conflicts: u64,
    /// Point lookups
    pub gets: u64,
    /// Removals, including of unknown ids
    pub removals: u64,
    /// Timeout and staleness queries
    pub scans: u64,
    /// Distinct command ids added to a saga's pending set
    pub commands_queued: u64,
    /// Commands removed by an acknowledgement
    pub commands_acknowledged: u64,
}
