//! Cache Metrics System
//!
//! Counters are kept in atomics shared by every shard and by the memory
//! monitor, so recording a hit never takes a lock. [`CacheMetrics`] turns a
//! snapshot of them into a `BTreeMap`.
//!
//! # Why BTreeMap over HashMap?
//!
//! BTreeMap keeps the metric keys in a stable order, which keeps log lines,
//! CSV exports and test assertions reproducible. With a couple dozen keys the
//! lookup cost is irrelevant.

use crate::entry::RemovedReason;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;

/// Live counters shared by the shards and the monitor.
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    removed: AtomicU64,
    expired: AtomicU64,
    underused: AtomicU64,
    dependency_changed: AtomicU64,
    trim_passes: AtomicU64,
    insert_block_waits: AtomicU64,
    insert_block_timeouts: AtomicU64,
    monitor_passes: AtomicU64,
    skipped_passes: AtomicU64,
    forced_reclaims: AtomicU64,
    ineffective_reclaims: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        bump(&self.hits);
    }

    pub(crate) fn record_miss(&self) {
        bump(&self.misses);
    }

    pub(crate) fn record_insert(&self) {
        bump(&self.inserts);
    }

    pub(crate) fn record_removal(&self, reason: RemovedReason) {
        bump(match reason {
            RemovedReason::Removed => &self.removed,
            RemovedReason::Expired => &self.expired,
            RemovedReason::Underused => &self.underused,
            RemovedReason::DependencyChanged => &self.dependency_changed,
        });
    }

    pub(crate) fn record_trim_pass(&self) {
        bump(&self.trim_passes);
    }

    pub(crate) fn record_insert_block(&self, timed_out: bool) {
        bump(&self.insert_block_waits);
        if timed_out {
            bump(&self.insert_block_timeouts);
        }
    }

    pub(crate) fn record_monitor_pass(&self) {
        bump(&self.monitor_passes);
    }

    pub(crate) fn record_skipped_pass(&self) {
        bump(&self.skipped_passes);
    }

    pub(crate) fn record_reclaim(&self, effective: bool) {
        bump(&self.forced_reclaims);
        if !effective {
            bump(&self.ineffective_reclaims);
        }
    }

    pub(crate) fn snapshot(&self) -> CoreCacheMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CoreCacheMetrics {
            hits: load(&self.hits),
            misses: load(&self.misses),
            inserts: load(&self.inserts),
            removed: load(&self.removed),
            expired: load(&self.expired),
            underused: load(&self.underused),
            dependency_changed: load(&self.dependency_changed),
            trim_passes: load(&self.trim_passes),
            insert_block_waits: load(&self.insert_block_waits),
            insert_block_timeouts: load(&self.insert_block_timeouts),
            monitor_passes: load(&self.monitor_passes),
            skipped_passes: load(&self.skipped_passes),
            forced_reclaims: load(&self.forced_reclaims),
            ineffective_reclaims: load(&self.ineffective_reclaims),
            ..CoreCacheMetrics::default()
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CoreCacheMetrics {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing, or only an expired entry
    pub misses: u64,
    /// Entries linked into a shard
    pub inserts: u64,
    /// Entries removed or replaced by callers, or turned away on insert
    pub removed: u64,
    /// Entries that expired
    pub expired: u64,
    /// Entries evicted to relieve memory pressure
    pub underused: u64,
    /// Entries invalidated by their dependency
    pub dependency_changed: u64,
    /// Trim passes that removed at least one entry
    pub trim_passes: u64,
    /// Inserts that had to wait on the insert gate
    pub insert_block_waits: u64,
    /// Insert gate waits that gave up after the timeout
    pub insert_block_timeouts: u64,
    /// Completed memory monitor passes
    pub monitor_passes: u64,
    /// Monitor ticks skipped because a pass was already running
    pub skipped_passes: u64,
    /// Calls into the memory reclaimer
    pub forced_reclaims: u64,
    /// Reclaims that freed less than 1% of the private bytes limit
    pub ineffective_reclaims: u64,
    /// Public entries at snapshot time
    pub public_entries: u64,
    /// All entries, internal ones included, at snapshot time
    pub total_entries: u64,
}

impl CoreCacheMetrics {
    /// Total lookups.
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hits over lookups, or 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.requests();
        if requests > 0 {
            self.hits as f64 / requests as f64
        } else {
            0.0
        }
    }

    /// Entries that left the cache for any reason.
    pub fn total_removals(&self) -> u64 {
        self.removed + self.expired + self.underused + self.dependency_changed
    }

    /// Convert core metrics to BTreeMap for reporting
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();

        // Lookups
        metrics.insert("hits".to_string(), self.hits as f64);
        metrics.insert("misses".to_string(), self.misses as f64);
        metrics.insert("requests".to_string(), self.requests() as f64);
        metrics.insert("hit_rate".to_string(), self.hit_rate());

        // Population
        metrics.insert("inserts".to_string(), self.inserts as f64);
        metrics.insert("public_entries".to_string(), self.public_entries as f64);
        metrics.insert("total_entries".to_string(), self.total_entries as f64);

        // Removals by reason
        metrics.insert("removed".to_string(), self.removed as f64);
        metrics.insert("expired".to_string(), self.expired as f64);
        metrics.insert("underused".to_string(), self.underused as f64);
        metrics.insert(
            "dependency_changed".to_string(),
            self.dependency_changed as f64,
        );
        metrics.insert("total_removals".to_string(), self.total_removals() as f64);

        // Memory pressure
        metrics.insert("trim_passes".to_string(), self.trim_passes as f64);
        metrics.insert(
            "insert_block_waits".to_string(),
            self.insert_block_waits as f64,
        );
        metrics.insert(
            "insert_block_timeouts".to_string(),
            self.insert_block_timeouts as f64,
        );
        metrics.insert("monitor_passes".to_string(), self.monitor_passes as f64);
        metrics.insert("skipped_passes".to_string(), self.skipped_passes as f64);
        metrics.insert("forced_reclaims".to_string(), self.forced_reclaims as f64);
        metrics.insert(
            "ineffective_reclaims".to_string(),
            self.ineffective_reclaims as f64,
        );

        metrics
    }
}

/// Uniform metrics reporting.
///
/// The simulator and the demos read every cache through this trait. Keys are
/// sorted alphabetically by the `BTreeMap`.
pub trait CacheMetrics {
    /// Returns all metrics as key-value pairs in deterministic order
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Short name identifying the cache implementation
    fn algorithm_name(&self) -> &'static str;
}
