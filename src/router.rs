//! Multi-shard fan-out.
//!
//! ```text
//!            hash(key) & (N - 1)
//!                    │
//!      ┌─────────────┼──────────────┐
//!      ▼             ▼              ▼
//!  ┌────────┐    ┌────────┐     ┌──────────┐
//!  │ Shard 0│    │ Shard 1│ ... │ Shard N-1│
//!  └────────┘    └────────┘     └──────────┘
//! ```
//!
//! The shard array is fixed at construction and its length is a power of two,
//! so picking a shard is a mask of the key hash. Keyed operations touch
//! exactly one shard; reviews, flushes and counts visit every shard in turn.
//! Eviction order is per shard, never global.

use crate::clock::{Clock, TimeBase};
use crate::entry::{CacheEntry, RemovedReason};
use crate::key::CacheKey;
use crate::memory::PressureSnapshot;
use crate::metrics::CacheStats;
use crate::shard::{Shard, ShardSettings};
use crate::store::{CacheStore, UpdateResult};
use crate::DefaultHashBuilder;
use core::hash::BuildHasher;
use std::sync::Arc;

/// Routes each key to one of `2^k` shards.
pub(crate) struct ShardRouter<V> {
    shards: Box<[Arc<Shard<V>>]>,
    mask: usize,
    hash_builder: DefaultHashBuilder,
}

impl<V: Clone + Send + Sync + 'static> ShardRouter<V> {
    /// `shard_count` must be a power of two.
    pub(crate) fn new(
        shard_count: usize,
        settings: ShardSettings,
        clock: Arc<dyn Clock>,
        time: TimeBase,
        stats: Arc<CacheStats>,
    ) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        let shards: Vec<_> = (0..shard_count)
            .map(|id| Shard::new(id, settings, Arc::clone(&clock), time, Arc::clone(&stats)))
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            mask: shard_count - 1,
            hash_builder: DefaultHashBuilder::default(),
        }
    }

    #[inline]
    fn shard_index(&self, key: &CacheKey) -> usize {
        (self.hash_builder.hash_one(key) as usize) & self.mask
    }

    #[inline]
    fn shard_for(&self, key: &CacheKey) -> &Shard<V> {
        &self.shards[self.shard_index(key)]
    }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> for ShardRouter<V> {
    fn update_cache(
        &self,
        key: &CacheKey,
        new_entry: Option<Arc<CacheEntry<V>>>,
        replace: bool,
        reason: RemovedReason,
    ) -> UpdateResult<V> {
        self.shard_for(key)
            .update_cache(key, new_entry, replace, reason)
    }

    fn review_memory_stats(&self, pressure: &PressureSnapshot) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.review_memory_stats(pressure))
            .sum()
    }

    fn enable_expiration_timer(&self, enable: bool) {
        for shard in self.shards.iter() {
            shard.enable_expiration_timer(enable);
        }
    }

    fn flush_expired_items(&self, use_insert_block: bool) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.flush_expired_items(use_insert_block))
            .sum()
    }

    fn trim(&self, percent: u32) -> usize {
        self.shards.iter().map(|shard| shard.trim(percent)).sum()
    }

    fn block_insert_if_needed(&self, pressure: &PressureSnapshot) {
        for shard in self.shards.iter() {
            shard.block_insert_if_needed(pressure);
        }
    }

    fn unblock_insert(&self) {
        for shard in self.shards.iter() {
            shard.unblock_insert();
        }
    }

    fn count(&self) -> usize {
        self.shards.iter().map(|shard| shard.count()).sum()
    }

    fn total_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.total_count()).sum()
    }

    fn enumerate(&self) -> Box<dyn Iterator<Item = Arc<CacheEntry<V>>> + '_> {
        Box::new(self.shards.iter().flat_map(|shard| shard.enumerate()))
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::EntryOptions;

    fn router(shards: usize) -> (ShardRouter<u32>, TimeBase) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let time = TimeBase::new(clock.now());
        let settings = ShardSettings {
            min_count: 10,
            absolute_max_count: 100_000,
            expiration_enabled: true,
        };
        (
            ShardRouter::new(shards, settings, clock, time, Arc::new(CacheStats::default())),
            time,
        )
    }

    fn insert(router: &ShardRouter<u32>, time: &TimeBase, key: CacheKey, value: u32) {
        let entry = Arc::new(CacheEntry::new(key.clone(), value, EntryOptions::new(), time, 0));
        router.update_cache(&key, Some(entry), true, RemovedReason::Removed);
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let (router, time) = router(8);
        for i in 0..1000 {
            insert(&router, &time, CacheKey::public(format!("key-{i}")), i);
        }

        assert_eq!(router.shard_count(), 8);
        let per_shard: Vec<usize> = router.shards.iter().map(|s| s.count()).collect();
        assert!(per_shard.iter().all(|&n| n > 50), "uneven spread: {per_shard:?}");
        assert_eq!(router.count(), per_shard.iter().sum::<usize>());
        assert_eq!(router.count(), 1000);
    }

    #[test]
    fn test_same_key_always_same_shard() {
        let (router, _) = router(16);
        let key = CacheKey::public("stable");
        let first = router.shard_index(&key);
        for _ in 0..10 {
            assert_eq!(router.shard_index(&key), first);
        }
    }

    #[test]
    fn test_internal_keys_count_separately() {
        let (router, time) = router(4);
        insert(&router, &time, CacheKey::public("a"), 1);
        insert(&router, &time, CacheKey::internal("a"), 2);
        insert(&router, &time, CacheKey::internal("b"), 3);

        assert_eq!(router.count(), 1);
        assert_eq!(router.total_count(), 3);
        assert_eq!(router.enumerate().count(), 3);
    }

    #[test]
    fn test_trim_visits_every_shard() {
        let (router, time) = router(4);
        for i in 0..400 {
            insert(&router, &time, CacheKey::public(format!("key-{i}")), i);
        }
        let trimmed = router.trim(50);
        assert!(trimmed >= 190 && trimmed <= 200, "trimmed {trimmed}");
        assert_eq!(router.count(), 400 - trimmed);
    }
}
