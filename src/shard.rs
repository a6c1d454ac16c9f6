//! A single independently locked partition of the cache.
//!
//! # How It Works
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                               Shard                               │
//! │                                                                   │
//! │   update lock (writers only)        insert gate (memory pressure) │
//! │          │                                                        │
//! │          ▼                                                        │
//! │   ┌───────────────────────────┐                                   │
//! │   │ RwLock<HashMap<key, Arc>> │ ◄── get: brief read lock only     │
//! │   └─────────────┬─────────────┘                                   │
//! │                 │ Arc<CacheEntry>                                 │
//! │        ┌────────┴─────────┐                                       │
//! │        ▼                  ▼                                       │
//! │  ExpirationIndex      UsageIndex                                  │
//! │  (ordered expiry)     (priority buckets, last usage)              │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every get, insert, add and remove goes through one protocol
//! (`update_cache`). Writers serialize on the update lock while they change
//! the table; index maintenance, removal callbacks and dependency monitoring
//! all run after the lock is released, so user code never runs under it.
//!
//! Removals requested by the indices, by dependencies or by a trim are
//! identity based: they only unlink the exact entry they were given, never a
//! newer entry stored under the same key.

use crate::clock::{Clock, TimeBase, NEVER, TICKS_PER_SECOND};
use crate::dependency::ChangeNotifier;
use crate::entry::{CacheEntry, EntryState, RemovedReason};
use crate::expires::ExpirationIndex;
use crate::key::CacheKey;
use crate::memory::{PressureLevel, PressureSnapshot};
use crate::metrics::CacheStats;
use crate::store::{CacheStore, UpdateResult};
use crate::usage::UsageIndex;
use crate::HashMap;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Headroom above `max_count` before a shard trims regardless of pressure.
pub(crate) const OVERLOAD_DELTA: usize = 50;

/// Longest an insert waits on an armed insert gate.
pub(crate) const INSERT_BLOCK_WAIT: Duration = Duration::from_secs(10);

/// Sliding expirations are only re-indexed when they move at least this far.
const MIN_UPDATE_DELTA: u64 = TICKS_PER_SECOND;

/// Pause after a trim round that could not reach its target.
const TRIM_REST: u64 = TICKS_PER_SECOND;

const MAX_TRIM_ROUNDS: usize = 8;

/// Per-shard limits derived from [`CacheConfig`](crate::CacheConfig).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShardSettings {
    pub(crate) min_count: usize,
    pub(crate) absolute_max_count: usize,
    pub(crate) expiration_enabled: bool,
}

/// Blocks inserts of removable entries while held.
///
/// Holders are counted, so the monitor and an expiration flush can hold it at
/// the same time.
struct InsertGate {
    holders: Mutex<usize>,
    released: Condvar,
    armed: AtomicBool,
}

impl InsertGate {
    fn new() -> Self {
        Self {
            holders: Mutex::new(0),
            released: Condvar::new(),
            armed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn block(&self) {
        let mut holders = self.holders.lock();
        *holders += 1;
        self.armed.store(true, Ordering::Release);
    }

    fn unblock(&self) {
        let mut holders = self.holders.lock();
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            self.armed.store(false, Ordering::Release);
            self.released.notify_all();
        }
    }

    /// Returns `false` if the gate was still held after `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let mut holders = self.holders.lock();
        if *holders == 0 {
            return true;
        }
        !self
            .released
            .wait_while_for(&mut holders, |h| *h > 0, timeout)
            .timed_out()
    }
}

#[derive(Debug, Default)]
struct TrimState {
    last_attempt: u64,
    under_flushed: bool,
}

/// One partition: hash table, expiration index, usage index and capacity.
pub(crate) struct Shard<V> {
    id: usize,
    me: Weak<Shard<V>>,
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry<V>>>>,
    update_lock: Mutex<()>,
    expires: ExpirationIndex<V>,
    usage: UsageIndex<V>,
    total_count: AtomicUsize,
    public_count: AtomicUsize,
    max_count: AtomicUsize,
    overload_count: AtomicUsize,
    insert_gate: InsertGate,
    gate_held_for_pressure: AtomicBool,
    trim_state: Mutex<TrimState>,
    settings: ShardSettings,
    clock: Arc<dyn Clock>,
    time: TimeBase,
    stats: Arc<CacheStats>,
}

impl<V: Clone + Send + Sync + 'static> Shard<V> {
    pub(crate) fn new(
        id: usize,
        settings: ShardSettings,
        clock: Arc<dyn Clock>,
        time: TimeBase,
        stats: Arc<CacheStats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            entries: RwLock::new(HashMap::new()),
            update_lock: Mutex::new(()),
            expires: ExpirationIndex::new(settings.expiration_enabled),
            usage: UsageIndex::new(),
            total_count: AtomicUsize::new(0),
            public_count: AtomicUsize::new(0),
            max_count: AtomicUsize::new(settings.absolute_max_count),
            overload_count: AtomicUsize::new(
                settings.absolute_max_count.saturating_add(OVERLOAD_DELTA),
            ),
            insert_gate: InsertGate::new(),
            gate_held_for_pressure: AtomicBool::new(false),
            trim_state: Mutex::new(TrimState::default()),
            settings,
            clock,
            time,
            stats,
        })
    }

    #[cfg(test)]
    pub(crate) fn max_count(&self) -> usize {
        self.max_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn overload_count(&self) -> usize {
        self.overload_count.load(Ordering::Relaxed)
    }

    #[inline]
    fn now(&self) -> u64 {
        self.time.ticks(self.clock.now())
    }

    #[inline]
    fn expiration_enabled(&self) -> bool {
        self.expires.is_timer_enabled()
    }

    /// Unlinks `entry` if, and only if, it is still the entry stored under its
    /// key.
    pub(crate) fn remove_entry(&self, entry: &Arc<CacheEntry<V>>, reason: RemovedReason) -> bool {
        self.update_cache_impl(entry.key(), None, true, reason, Some(entry))
            .old_entry
            .is_some()
    }

    fn update_cache_impl(
        &self,
        key: &CacheKey,
        new_entry: Option<Arc<CacheEntry<V>>>,
        replace: bool,
        removed_reason: RemovedReason,
        only: Option<&Arc<CacheEntry<V>>>,
    ) -> UpdateResult<V> {
        let is_get = !replace && new_entry.is_none();
        let is_add = !replace && new_entry.is_some();

        loop {
            let now = self.now();
            let mut replace = replace;
            let mut reason = removed_reason;
            let mut cache_entry: Option<Arc<CacheEntry<V>>>;
            let mut old_entry: Option<Arc<CacheEntry<V>>> = None;
            let mut expired_on_get: Option<Arc<CacheEntry<V>>> = None;
            let mut linked = false;
            let mut rejected = false;

            if let Some(new) = &new_entry {
                if new.has_usage() && self.insert_gate.is_armed() {
                    self.wait_for_insert_gate();
                }
            }
            // Dependencies are user code; ask before anything is unlinked
            let dependency_changed = new_entry.as_ref().is_some_and(|new| new.dependency_changed());

            {
                let _update = (!is_get).then(|| self.update_lock.lock());

                cache_entry = self.entries.read().get(key).cloned();
                if let Some(only) = only {
                    if cache_entry
                        .as_ref()
                        .is_some_and(|current| !Arc::ptr_eq(current, only))
                    {
                        cache_entry = None;
                    }
                }

                let expired_state = cache_entry
                    .as_ref()
                    .filter(|e| self.expiration_enabled() && e.is_expired(now))
                    .map(|e| e.state());
                match expired_state {
                    Some(_) if !is_get => {
                        replace = true;
                        reason = RemovedReason::Expired;
                    }
                    Some(EntryState::AddedToCache) => expired_on_get = cache_entry.take(),
                    Some(_) => cache_entry = None,
                    None => {}
                }

                if replace {
                    let removable = cache_entry
                        .as_ref()
                        .is_some_and(|current| current.state() != EntryState::AddingToCache);
                    if removable {
                        if let Some(current) = &cache_entry {
                            current.set_state(EntryState::RemovingFromCache);
                            self.entries.write().remove(key);
                            old_entry = Some(Arc::clone(current));
                        }
                    } else if new_entry.is_none() {
                        cache_entry = None;
                    }
                }

                if let Some(new) = &new_entry {
                    let blocked = cache_entry.is_some() && old_entry.is_none();
                    if blocked || dependency_changed {
                        rejected = true;
                        if !(is_add && blocked) {
                            cache_entry = None;
                        }
                    } else {
                        new.set_state(EntryState::AddingToCache);
                        self.entries.write().insert(key.clone(), Arc::clone(new));
                        linked = true;
                        cache_entry = if is_add { None } else { Some(Arc::clone(new)) };
                    }
                }
            }

            if let Some(expired) = expired_on_get {
                self.update_cache_impl(key, None, true, RemovedReason::Expired, Some(&expired));
                continue;
            }

            if let Some(old) = &old_entry {
                self.expires.remove(old);
                self.usage.remove(old);
                self.adjust_counts(old, false);
            }
            if let Some(new) = new_entry.as_ref().filter(|_| linked) {
                if new.has_expiration() {
                    self.expires.add(new);
                }
                if new.qualifies_for_usage(now) {
                    self.usage.add(new);
                }
                self.adjust_counts(new, true);
                self.stats.record_insert();
                new.set_state(EntryState::AddedToCache);
            }

            if let Some(old) = &old_entry {
                old.close(reason);
                self.stats.record_removal(reason);
            }

            if let Some(new) = new_entry.as_ref().filter(|_| linked) {
                if new.dependency().is_some() {
                    let monitored = new.monitor_dependency_changes(self.dependency_notifier(new));
                    if !monitored || new.dependency_changed() {
                        self.remove_entry(new, RemovedReason::DependencyChanged);
                    }
                }
            }
            if let Some(new) = new_entry.as_ref().filter(|_| rejected) {
                new.close(RemovedReason::Removed);
                self.stats.record_removal(RemovedReason::Removed);
            }

            if is_get {
                match &cache_entry {
                    Some(entry) => {
                        self.touch(entry, now);
                        self.stats.record_hit();
                    }
                    None => self.stats.record_miss(),
                }
            }

            return UpdateResult {
                entry: cache_entry,
                old_entry,
            };
        }
    }

    fn adjust_counts(&self, entry: &CacheEntry<V>, added: bool) {
        if added {
            self.total_count.fetch_add(1, Ordering::AcqRel);
            if entry.is_public() {
                self.public_count.fetch_add(1, Ordering::AcqRel);
            }
        } else {
            self.total_count.fetch_sub(1, Ordering::AcqRel);
            if entry.is_public() {
                self.public_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Slides the expiration of a read entry and records the use.
    fn touch(&self, entry: &CacheEntry<V>, now: u64) {
        if self.expiration_enabled() && entry.sliding() > 0 {
            let new_expires = now.saturating_add(entry.sliding()).min(NEVER - 1);
            let current = entry.expires();
            if new_expires < current || new_expires - current >= MIN_UPDATE_DELTA {
                self.expires.utc_update(entry, new_expires);
            }
        }
        self.usage.update(entry, now);
    }

    fn dependency_notifier(&self, entry: &Arc<CacheEntry<V>>) -> ChangeNotifier {
        let shard = self.me.clone();
        let entry = Arc::downgrade(entry);
        Box::new(move || {
            if let (Some(shard), Some(entry)) = (shard.upgrade(), entry.upgrade()) {
                shard.remove_entry(&entry, RemovedReason::DependencyChanged);
            }
        })
    }

    fn wait_for_insert_gate(&self) {
        let released = self.insert_gate.wait(INSERT_BLOCK_WAIT);
        self.stats.record_insert_block(!released);
        if !released {
            warn!(
                shard = self.id,
                waited_secs = INSERT_BLOCK_WAIT.as_secs(),
                "insert still blocked by memory pressure; proceeding"
            );
        }
    }

    fn flush_expired(&self, now: u64, use_insert_block: bool) -> usize {
        if !self.expiration_enabled() {
            return 0;
        }
        if use_insert_block {
            self.insert_gate.block();
        }
        let flushed = self
            .expires
            .flush_expired_items(now, |e| self.remove_entry(e, RemovedReason::Expired));
        if use_insert_block {
            self.insert_gate.unblock();
        }
        if flushed > 0 {
            debug!(shard = self.id, flushed, "flushed expired entries");
        }
        flushed
    }

    fn flush_under_used(&self, needed: usize, now: u64) -> usize {
        let count = self.usage.flush_under_used_items(needed, now, |e| {
            self.remove_entry(e, RemovedReason::Underused)
        });
        debug!(
            shard = self.id,
            needed,
            flushed = count.flushed,
            public = count.public_flushed,
            "flushed under used entries"
        );
        count.flushed
    }

    /// Removes entries until at most `target` remain, expired ones first.
    fn trim_to(&self, target: usize) -> usize {
        let Some(mut trim) = self.trim_state.try_lock() else {
            return 0;
        };

        let mut trimmed = 0;
        for _ in 0..MAX_TRIM_ROUNDS {
            let total = self.total_count.load(Ordering::Acquire);
            if total <= target {
                break;
            }
            let now = self.now();
            if trim.under_flushed && now.saturating_sub(trim.last_attempt) < TRIM_REST {
                debug!(shard = self.id, total, target, "previous trim fell short; resting");
                break;
            }

            let needed = total - target;
            let mut flushed = self.flush_expired(now, false);
            if flushed < needed {
                flushed += self.flush_under_used(needed - flushed, now);
            }
            trim.last_attempt = now;
            trim.under_flushed = flushed < needed;
            trimmed += flushed;
        }

        if trimmed > 0 {
            self.stats.record_trim_pass();
            debug!(shard = self.id, trimmed, target, "trimmed shard");
        }
        trimmed
    }

    /// Live entries at the time of the call.
    fn snapshot(&self) -> impl Iterator<Item = Arc<CacheEntry<V>>> {
        let entries: Vec<Arc<CacheEntry<V>>> = self.entries.read().values().cloned().collect();
        let now = self.now();
        let check_expiry = self.expiration_enabled();
        entries.into_iter().filter(move |e| {
            e.state() == EntryState::AddedToCache && !(check_expiry && e.is_expired(now))
        })
    }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> for Shard<V> {
    fn update_cache(
        &self,
        key: &CacheKey,
        new_entry: Option<Arc<CacheEntry<V>>>,
        replace: bool,
        reason: RemovedReason,
    ) -> UpdateResult<V> {
        self.update_cache_impl(key, new_entry, replace, reason, None)
    }

    fn review_memory_stats(&self, pressure: &PressureSnapshot) -> usize {
        let total = self.total_count.load(Ordering::Acquire);
        let max = pressure
            .calc_max_count(total, self.settings.absolute_max_count)
            .max(self.settings.min_count)
            .min(self.settings.absolute_max_count);
        let overload = max.saturating_add(OVERLOAD_DELTA);
        let previous = self.max_count.swap(max, Ordering::Relaxed);
        self.overload_count.store(overload, Ordering::Relaxed);
        if previous != max {
            debug!(shard = self.id, total, previous, max, overload, "capacity changed");
        }

        if total > overload || (total > max && pressure.level() >= PressureLevel::Medium) {
            self.trim_to(max)
        } else {
            0
        }
    }

    fn enable_expiration_timer(&self, enable: bool) {
        self.expires.enable_expiration_timer(enable);
    }

    fn flush_expired_items(&self, use_insert_block: bool) -> usize {
        self.flush_expired(self.now(), use_insert_block)
    }

    fn trim(&self, percent: u32) -> usize {
        let now = self.now();
        let mut trimmed = self.flush_expired(now, false);
        let needed = self.total_count.load(Ordering::Acquire) * percent.min(100) as usize / 100;
        if needed > 0 {
            trimmed += self.flush_under_used(needed, now);
        }
        if trimmed > 0 {
            self.stats.record_trim_pass();
            debug!(shard = self.id, trimmed, percent, "explicit trim");
        }
        trimmed
    }

    fn block_insert_if_needed(&self, pressure: &PressureSnapshot) {
        if pressure.level() == PressureLevel::High
            && !self.gate_held_for_pressure.swap(true, Ordering::AcqRel)
        {
            self.insert_gate.block();
        }
    }

    fn unblock_insert(&self) {
        if self.gate_held_for_pressure.swap(false, Ordering::AcqRel) {
            self.insert_gate.unblock();
        }
    }

    fn count(&self) -> usize {
        self.public_count.load(Ordering::Acquire)
    }

    fn total_count(&self) -> usize {
        self.total_count.load(Ordering::Acquire)
    }

    fn enumerate(&self) -> Box<dyn Iterator<Item = Arc<CacheEntry<V>>> + '_> {
        Box::new(self.snapshot())
    }

    fn shard_count(&self) -> usize {
        1
    }
}
