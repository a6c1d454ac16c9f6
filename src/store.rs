//! The seam between the facade and the storage layout.
//!
//! A cache with a single shard talks to that [`Shard`](crate::shard::Shard)
//! directly; otherwise a [`ShardRouter`](crate::router::ShardRouter) fans each
//! call out by key hash. Both implement [`CacheStore`], and the choice is made
//! once in [`Cache::init`](crate::Cache::init).

use crate::entry::{CacheEntry, RemovedReason};
use crate::key::CacheKey;
use crate::memory::PressureSnapshot;
use std::sync::Arc;

/// Outcome of one run of the update protocol.
pub(crate) struct UpdateResult<V> {
    /// For a get, the entry found. For an add, the entry that blocked it. For
    /// an insert, the entry now stored.
    pub(crate) entry: Option<Arc<CacheEntry<V>>>,
    /// The entry that was unlinked, if any.
    pub(crate) old_entry: Option<Arc<CacheEntry<V>>>,
}

#[cfg(test)]
impl<V> UpdateResult<V> {
    pub(crate) fn none() -> Self {
        Self {
            entry: None,
            old_entry: None,
        }
    }
}

impl<V: Clone> UpdateResult<V> {
    pub(crate) fn value(&self) -> Option<V> {
        self.entry.as_ref().map(|e| e.value().clone())
    }

    pub(crate) fn old_value(&self) -> Option<V> {
        self.old_entry.as_ref().map(|e| e.value().clone())
    }
}

/// Operations the facade and the background timers need from the storage.
pub(crate) trait CacheStore<V>: Send + Sync {
    /// Runs the get / insert / add / remove protocol for `key`.
    ///
    /// | `new_entry` | `replace` | operation |
    /// |-------------|-----------|-----------|
    /// | `None`      | `false`   | get       |
    /// | `Some`      | `false`   | add       |
    /// | `Some`      | `true`    | insert    |
    /// | `None`      | `true`    | remove    |
    fn update_cache(
        &self,
        key: &CacheKey,
        new_entry: Option<Arc<CacheEntry<V>>>,
        replace: bool,
        reason: RemovedReason,
    ) -> UpdateResult<V>;

    /// Recomputes capacity from `pressure` and trims if needed. Returns the
    /// number of entries removed.
    fn review_memory_stats(&self, pressure: &PressureSnapshot) -> usize;

    fn enable_expiration_timer(&self, enable: bool);

    /// Removes every expired entry. With `use_insert_block`, inserts of
    /// removable entries wait while the flush runs.
    fn flush_expired_items(&self, use_insert_block: bool) -> usize;

    /// Flushes expired entries, then `percent` of the entries through the
    /// usage index.
    fn trim(&self, percent: u32) -> usize;

    fn block_insert_if_needed(&self, pressure: &PressureSnapshot);

    fn unblock_insert(&self);

    /// Public entries.
    fn count(&self) -> usize;

    /// All entries, internal ones included.
    fn total_count(&self) -> usize;

    /// Live entries, one shard snapshot at a time.
    fn enumerate(&self) -> Box<dyn Iterator<Item = Arc<CacheEntry<V>>> + '_>;

    fn shard_count(&self) -> usize;
}
