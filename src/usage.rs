//! Usage index.
//!
//! Tracks the entries of a shard that may be evicted to relieve memory
//! pressure, bucketed by [`CacheItemPriority`](crate::CacheItemPriority).
//! `NotRemovable` entries have no bucket and are therefore never selected.
//!
//! Recency is not kept in a list. A touch stores the current tick in the
//! entry's `last_usage` atomic (see `UsageTarget`), which readers can do
//! without any lock and across shards. Only a flush pays for ordering: it
//! snapshots a bucket and selects the least recently used candidates, which
//! makes eviction approximate by design.

use crate::clock::TICKS_PER_SECOND;
use crate::entry::{CacheEntry, UsageTarget};
use crate::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::Arc;

/// Entries younger than this survive the first flush pass.
pub(crate) const NEWADD_INTERVAL: u64 = 10 * TICKS_PER_SECOND;

const BUCKETS: usize = 5;

/// Outcome of [`UsageIndex::flush_under_used_items`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushCount {
    pub(crate) flushed: usize,
    pub(crate) public_flushed: usize,
}

type Bucket<V> = Mutex<HashMap<usize, Arc<CacheEntry<V>>>>;

/// Removable entries of one shard, grouped by priority.
pub(crate) struct UsageIndex<V> {
    buckets: [Bucket<V>; BUCKETS],
}

impl<V: Send + Sync> UsageIndex<V> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub(crate) fn add(&self, entry: &Arc<CacheEntry<V>>) {
        if let Some(bucket) = entry.priority().usage_bucket() {
            self.buckets[bucket]
                .lock()
                .insert(entry.addr(), Arc::clone(entry));
        }
    }

    pub(crate) fn remove(&self, entry: &CacheEntry<V>) -> bool {
        match entry.priority().usage_bucket() {
            Some(bucket) => self.buckets[bucket].lock().remove(&entry.addr()).is_some(),
            None => false,
        }
    }

    /// Records a read of `entry` and of everything it depends on.
    pub(crate) fn update(&self, entry: &CacheEntry<V>, now: u64) {
        let mut visited = HashSet::new();
        entry.update_usage_recursive(now, &mut visited);
    }

    /// Evicts up to `needed` entries, lowest priority and least recently used
    /// first. Entries added within [`NEWADD_INTERVAL`] are only taken on a
    /// second pass when the first one fell short.
    pub(crate) fn flush_under_used_items<F>(&self, needed: usize, now: u64, mut remove: F) -> FlushCount
    where
        F: FnMut(&Arc<CacheEntry<V>>) -> bool,
    {
        let mut count = FlushCount::default();
        for force in [false, true] {
            for bucket in &self.buckets {
                if count.flushed >= needed {
                    return count;
                }
                let wanted = needed - count.flushed;
                for entry in Self::select_victims(bucket, wanted, now, force) {
                    if remove(&entry) {
                        count.flushed += 1;
                        if entry.is_public() {
                            count.public_flushed += 1;
                        }
                    }
                }
            }
        }
        count
    }

    fn select_victims(bucket: &Bucket<V>, wanted: usize, now: u64, force: bool) -> Vec<Arc<CacheEntry<V>>> {
        let mut candidates: Vec<(u64, Arc<CacheEntry<V>>)> = bucket
            .lock()
            .values()
            .filter(|e| force || now.saturating_sub(e.created()) >= NEWADD_INTERVAL)
            .map(|e| (e.last_usage(), Arc::clone(e)))
            .collect();

        if candidates.len() > wanted {
            candidates.select_nth_unstable_by_key(wanted, |(last, _)| *last);
            candidates.truncate(wanted);
        }
        candidates.sort_unstable_by_key(|(last, _)| *last);
        candidates.into_iter().map(|(_, e)| e).collect()
    }
}
