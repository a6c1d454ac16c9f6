//! The cache facade.
//!
//! [`Cache`] wires the storage (one [`Shard`] or a [`ShardRouter`]) to its two
//! background timers and exposes the public operations. Every keyed call is a
//! thin wrapper around the shard update protocol.
//!
//! ```text
//!   get / insert / add / remove
//!             │
//!             ▼
//!   ┌───────────────────┐      ┌──────────────────────────┐
//!   │       Cache       │─────►│ CacheStore (Shard|Router) │
//!   └───────────────────┘      └──────────────────────────┘
//!        │          │                  ▲            ▲
//!        │          │   flush expired  │            │ review / trim
//!        │    ┌─────▼──────────┐       │   ┌────────┴──────────────┐
//!        │    │ expiration     │───────┘   │ MemoryPressureMonitor │
//!        │    │ timer (20s)    │           └────────▲──────────────┘
//!        │    └────────────────┘                    │
//!        └──────────────────────────────────► memory timer (30s / 5s)
//! ```

use crate::clock::{Clock, SystemClock, TimeBase};
use crate::config::CacheConfig;
use crate::dependency::KeyDependency;
use crate::entry::{CacheEntry, EntryOptions, RemovedReason};
use crate::error::Result;
use crate::key::CacheKey;
use crate::memory::{
    MemoryPressureMonitor, MemoryReclaimer, MemoryStatsSource, NoopReclaimer, PassOutcome,
    PressureSnapshot, SysinfoMemoryStats,
};
use crate::metrics::{CacheMetrics, CacheStats};
use crate::router::ShardRouter;
use crate::shard::Shard;
use crate::store::CacheStore;
use crate::timer::PeriodicTimer;
use core::fmt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// The services a cache consumes from its environment.
///
/// [`Collaborators::system`] uses the operating system: `sysinfo` for memory
/// statistics, the monotonic clock, and no reclaimer. Tests and simulations
/// swap in scripted implementations.
pub struct Collaborators {
    memory_stats: Arc<dyn MemoryStatsSource>,
    reclaimer: Arc<dyn MemoryReclaimer>,
    clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Operating system collaborators.
    pub fn system() -> Result<Self> {
        Ok(Self::new(Arc::new(SysinfoMemoryStats::new()?)))
    }

    /// Uses `memory_stats`, the system clock and no reclaimer.
    pub fn new(memory_stats: Arc<dyn MemoryStatsSource>) -> Self {
        Self {
            memory_stats,
            reclaimer: Arc::new(NoopReclaimer),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the reclaimer.
    #[must_use]
    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn MemoryReclaimer>) -> Self {
        self.reclaimer = reclaimer;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Timers {
    expiration: Option<PeriodicTimer>,
    memory: Option<PeriodicTimer>,
}

/// An in-process object cache that shrinks itself under memory pressure.
///
/// Values are cloned out on reads, so wrap large values in an `Arc`.
///
/// # Examples
///
/// ```
/// use adaptive_cache::{Cache, CacheConfig, EntryOptions};
/// use std::time::Duration;
///
/// let cache: Cache<String> = Cache::init(CacheConfig::new()).unwrap();
/// cache.insert("greeting", "hello".to_string());
/// assert_eq!(cache.get("greeting").as_deref(), Some("hello"));
///
/// cache
///     .insert_with(
///         "session",
///         "token".to_string(),
///         EntryOptions::new().with_sliding_expiration(Duration::from_secs(60)),
///     )
///     .unwrap();
/// assert_eq!(cache.count(), 2);
/// assert_eq!(cache.remove("greeting").as_deref(), Some("hello"));
/// ```
pub struct Cache<V> {
    store: Arc<dyn CacheStore<V>>,
    monitor: Arc<MemoryPressureMonitor>,
    stats: Arc<CacheStats>,
    clock: Arc<dyn Clock>,
    time: TimeBase,
    config: CacheConfig,
    timers: Mutex<Timers>,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Creates a cache that reads memory statistics from the operating
    /// system.
    pub fn init(config: CacheConfig) -> Result<Self> {
        Self::init_with(config, Collaborators::system()?)
    }

    /// Creates a cache with explicit collaborators.
    pub fn init_with(config: CacheConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            memory_stats,
            reclaimer,
            clock,
        } = collaborators;

        let stats = Arc::new(CacheStats::default());
        let time = TimeBase::new(clock.now());
        let store: Arc<dyn CacheStore<V>> = match config.shards() {
            1 => Shard::new(
                0,
                config.shard_settings(),
                Arc::clone(&clock),
                time,
                Arc::clone(&stats),
            ),
            shards => Arc::new(ShardRouter::new(
                shards,
                config.shard_settings(),
                Arc::clone(&clock),
                time,
                Arc::clone(&stats),
            )),
        };
        let monitor = Arc::new(MemoryPressureMonitor::new(
            config.monitor_settings(),
            memory_stats,
            reclaimer,
            Arc::clone(&clock),
            Arc::clone(&stats),
        ));

        let cache = Self {
            store,
            monitor,
            stats,
            clock,
            time,
            config,
            timers: Mutex::new(Timers::default()),
        };
        cache.set_expiration_enabled(config.expiration_enabled())?;
        cache.set_memory_collection(config.memory_collection_enabled())?;

        info!(
            shards = cache.store.shard_count(),
            expiration = config.expiration_enabled(),
            memory_collection = config.memory_collection_enabled(),
            private_bytes_limit = cache.monitor.private_bytes_limit(),
            "cache initialized"
        );
        Ok(cache)
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_key(&CacheKey::public(key))
    }

    /// Stores `value` under `key` with default options, replacing any
    /// previous entry. Returns the previous value.
    pub fn insert(&self, key: &str, value: V) -> Option<V> {
        let entry = self.new_entry(CacheKey::public(key), value, EntryOptions::new());
        self.insert_entry(entry)
    }

    /// Stores `value` under `key`, replacing any previous entry. Returns the
    /// previous value.
    pub fn insert_with(&self, key: &str, value: V, options: EntryOptions<V>) -> Result<Option<V>> {
        self.insert_key(CacheKey::public(key), value, options)
    }

    /// Stores `value` under `key` unless a live entry already exists. Returns
    /// the existing value when the add lost.
    pub fn add(&self, key: &str, value: V) -> Option<V> {
        let entry = self.new_entry(CacheKey::public(key), value, EntryOptions::new());
        self.add_entry(entry)
    }

    /// [`add`](Self::add) with per-entry options.
    pub fn add_with(&self, key: &str, value: V, options: EntryOptions<V>) -> Result<Option<V>> {
        self.add_key(CacheKey::public(key), value, options)
    }

    /// Removes the entry stored under `key` and returns its value.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.remove_key(&CacheKey::public(key))
    }

    /// Looks up a key in either key space.
    pub fn get_key(&self, key: &CacheKey) -> Option<V> {
        self.store
            .update_cache(key, None, false, RemovedReason::Removed)
            .value()
    }

    /// Inserts under a key in either key space.
    pub fn insert_key(&self, key: CacheKey, value: V, options: EntryOptions<V>) -> Result<Option<V>> {
        options.validate()?;
        Ok(self.insert_entry(self.new_entry(key, value, options)))
    }

    /// Adds under a key in either key space.
    pub fn add_key(&self, key: CacheKey, value: V, options: EntryOptions<V>) -> Result<Option<V>> {
        options.validate()?;
        Ok(self.add_entry(self.new_entry(key, value, options)))
    }

    /// Removes a key from either key space.
    pub fn remove_key(&self, key: &CacheKey) -> Option<V> {
        self.store
            .update_cache(key, None, true, RemovedReason::Removed)
            .old_value()
    }

    /// Number of public entries.
    pub fn count(&self) -> usize {
        self.store.count()
    }

    /// Number of entries in both key spaces.
    pub fn total_count(&self) -> usize {
        self.store.total_count()
    }

    /// Iterates over public entries.
    ///
    /// Each shard is snapshotted when the iterator reaches it, so entries
    /// added or removed concurrently may or may not be seen. Expired entries
    /// are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (String, V)> + '_ {
        self.store
            .enumerate()
            .filter(|entry| entry.is_public())
            .map(|entry| (entry.key().text().to_string(), entry.value().clone()))
    }

    /// Builds a dependency on the current public entries for `keys`.
    ///
    /// The dependency changes as soon as any of them leaves the cache, and
    /// starts out changed if one is missing.
    pub fn key_dependency(&self, keys: &[&str]) -> Arc<KeyDependency> {
        self.key_dependency_on(keys.iter().map(|k| CacheKey::public(*k)).collect())
    }

    /// Builds a dependency on keys in either key space.
    pub fn key_dependency_on(&self, keys: Vec<CacheKey>) -> Arc<KeyDependency> {
        Arc::new(KeyDependency::resolve(keys, |key| {
            self.store
                .update_cache(key, None, false, RemovedReason::Removed)
                .entry
        }))
    }

    /// Removes expired entries, then `percent` of each shard's entries,
    /// least valuable first. Returns how many entries were removed.
    pub fn trim(&self, percent: u32) -> usize {
        self.store.trim(percent)
    }

    /// Removes every expired entry now instead of waiting for the timer.
    pub fn flush_expired(&self) -> usize {
        self.store.flush_expired_items(false)
    }

    /// Runs one memory monitor pass now. Returns `None` if a pass was already
    /// running or sampling is suspended.
    pub fn review_memory_stats(&self) -> Option<PressureSnapshot> {
        match self.monitor.run_pass(&*self.store) {
            PassOutcome::Completed { snapshot, .. } => Some(snapshot),
            PassOutcome::Busy | PassOutcome::Suspended => None,
        }
    }

    /// The pressure seen by the last completed monitor pass.
    pub fn memory_pressure(&self) -> Option<PressureSnapshot> {
        self.monitor.last_snapshot()
    }

    /// Effective private bytes limit, after automatic derivation.
    pub fn private_bytes_limit(&self) -> u64 {
        self.monitor.private_bytes_limit()
    }

    /// Turns expiration on or off for every shard, starting or stopping the
    /// flush timer.
    pub fn set_expiration_enabled(&self, enabled: bool) -> Result<()> {
        let mut timers = self.timers.lock();
        self.store.enable_expiration_timer(enabled);
        if enabled {
            if timers.expiration.is_none() {
                let store = Arc::clone(&self.store);
                timers.expiration = Some(PeriodicTimer::start(
                    "expiration",
                    self.config.expiration_interval(),
                    move || {
                        store.flush_expired_items(true);
                        None
                    },
                )?);
            }
        } else if let Some(mut timer) = timers.expiration.take() {
            timer.stop();
        }
        Ok(())
    }

    /// Starts or stops memory monitoring. Stopping waits for an in-flight
    /// pass to finish.
    pub fn set_memory_collection(&self, enabled: bool) -> Result<()> {
        let mut timers = self.timers.lock();
        if enabled {
            if timers.memory.is_none() {
                let store = Arc::clone(&self.store);
                let monitor = Arc::clone(&self.monitor);
                timers.memory = Some(PeriodicTimer::start(
                    "memory-monitor",
                    self.config.poll_interval(),
                    move || match monitor.run_pass(&*store) {
                        PassOutcome::Completed { snapshot, .. } => {
                            Some(monitor.next_interval(&snapshot))
                        }
                        PassOutcome::Busy | PassOutcome::Suspended => None,
                    },
                )?);
            }
        } else {
            if let Some(mut timer) = timers.memory.take() {
                timer.stop();
            }
            self.monitor.wait_idle();
        }
        Ok(())
    }

    /// The configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.store.shard_count()
    }

    fn new_entry(&self, key: CacheKey, value: V, options: EntryOptions<V>) -> Arc<CacheEntry<V>> {
        let now = self.time.ticks(self.clock.now());
        Arc::new(CacheEntry::new(key, value, options, &self.time, now))
    }

    fn insert_entry(&self, entry: Arc<CacheEntry<V>>) -> Option<V> {
        let key = entry.key().clone();
        self.store
            .update_cache(&key, Some(entry), true, RemovedReason::Removed)
            .old_value()
    }

    fn add_entry(&self, entry: Arc<CacheEntry<V>>) -> Option<V> {
        let key = entry.key().clone();
        self.store
            .update_cache(&key, Some(entry), false, RemovedReason::Removed)
            .value()
    }
}

impl<V> CacheMetrics for Cache<V> {
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut snapshot = self.stats.snapshot();
        snapshot.public_entries = self.store.count() as u64;
        snapshot.total_entries = self.store.total_count() as u64;
        let mut metrics = snapshot.to_btreemap();
        metrics.insert("shards".to_string(), self.store.shard_count() as f64);
        if let Some(pressure) = self.monitor.last_snapshot() {
            metrics.insert(
                "private_bytes_percent".to_string(),
                f64::from(pressure.private_bytes.last),
            );
            metrics.insert(
                "physical_memory_percent".to_string(),
                f64::from(pressure.physical.last),
            );
        }
        metrics
    }

    fn algorithm_name(&self) -> &'static str {
        "Adaptive"
    }
}

impl<V> Drop for Cache<V> {
    fn drop(&mut self) {
        let mut timers = self.timers.lock();
        if let Some(mut timer) = timers.memory.take() {
            timer.stop();
        }
        if let Some(mut timer) = timers.expiration.take() {
            timer.stop();
        }
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("shards", &self.store.shard_count())
            .field("count", &self.store.count())
            .field("total_count", &self.store.total_count())
            .field("config", &self.config)
            .finish()
    }
}
