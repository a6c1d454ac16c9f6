//! Cache entries and their lifecycle.
//!
//! A [`CacheEntry`] is created by the facade from a key, a value and a set of
//! [`EntryOptions`], and is then owned jointly (through `Arc`) by its shard's
//! hash table and by whichever indices it qualifies for. The entry itself never
//! decides when it leaves the cache; every transition of its state machine is
//! driven by the owning shard:
//!
//! ```text
//! NotInCache -> AddingToCache -> AddedToCache -> RemovingFromCache -> RemovedFromCache
//! ```
//!
//! Reaching `RemovedFromCache` is followed by [`CacheEntry::close`], which
//! runs the removal callback exactly once.
//!
//! # Timestamps
//!
//! Expiry and last-usage timestamps are stored as ticks (nanoseconds since the
//! cache was created) in atomics, so lock-free readers can slide an expiration
//! or record a touch without taking the shard lock.

use crate::clock::{duration_to_nanos, TimeBase, NEVER, TICKS_PER_SECOND};
use crate::dependency::{CacheDependency, ChangeNotifier, KeyDependencyState};
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::HashSet;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::error;

/// Longest sliding expiration accepted by [`EntryOptions::validate`].
pub const MAX_SLIDING_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Entries whose absolute expiration is closer than this are not worth
/// tracking for usage based eviction; expiration will reclaim them first.
pub(crate) const MIN_LIFETIME_FOR_USAGE: u64 = 10 * TICKS_PER_SECOND;

/// Relative importance of an entry when memory must be reclaimed.
///
/// Lower priorities are evicted first. `NotRemovable` entries are never
/// chosen for usage based eviction, although they still expire and can still
/// be removed explicitly or through a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CacheItemPriority {
    /// First to go under pressure
    Low,
    /// Evicted after `Low`
    BelowNormal,
    /// The default priority
    #[default]
    Normal,
    /// Evicted after `Normal`
    AboveNormal,
    /// Last removable priority to be evicted
    High,
    /// Never evicted to relieve memory pressure
    NotRemovable,
}

impl CacheItemPriority {
    /// Index of the usage bucket for removable priorities.
    pub(crate) fn usage_bucket(self) -> Option<usize> {
        match self {
            Self::Low => Some(0),
            Self::BelowNormal => Some(1),
            Self::Normal => Some(2),
            Self::AboveNormal => Some(3),
            Self::High => Some(4),
            Self::NotRemovable => None,
        }
    }
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovedReason {
    /// Removed or replaced by a caller, or lost an insertion race
    Removed,
    /// Its absolute or sliding expiration passed
    Expired,
    /// Evicted by the usage index to relieve memory pressure
    Underused,
    /// Its dependency reported a change
    DependencyChanged,
}

/// Callback fired once when an entry leaves the cache.
pub type RemovedCallback<V> = Box<dyn FnOnce(&CacheKey, &V, RemovedReason) + Send>;

/// Lifecycle state of a [`CacheEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// Created but not yet offered to a shard
    NotInCache = 0,
    /// Linked into the hash table, indices not yet attached
    AddingToCache = 1,
    /// Fully visible
    AddedToCache = 2,
    /// Unlinked from the hash table, indices not yet detached
    RemovingFromCache = 3,
    /// Gone; the removal callback has been or is being fired
    RemovedFromCache = 4,
}

impl EntryState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::AddingToCache,
            2 => Self::AddedToCache,
            3 => Self::RemovingFromCache,
            4 => Self::RemovedFromCache,
            _ => Self::NotInCache,
        }
    }
}

/// Per-entry settings for [`Cache::insert_with`](crate::Cache::insert_with)
/// and [`Cache::add_with`](crate::Cache::add_with).
///
/// # Examples
///
/// ```
/// use adaptive_cache::{CacheItemPriority, EntryOptions};
/// use std::time::Duration;
///
/// let options: EntryOptions<String> = EntryOptions::new()
///     .with_sliding_expiration(Duration::from_secs(30))
///     .with_priority(CacheItemPriority::High);
/// assert!(options.validate().is_ok());
/// ```
pub struct EntryOptions<V> {
    pub(crate) dependency: Option<Arc<dyn CacheDependency>>,
    pub(crate) absolute_expiration: Option<Instant>,
    pub(crate) sliding_expiration: Duration,
    pub(crate) priority: CacheItemPriority,
    pub(crate) on_removed: Option<RemovedCallback<V>>,
}

impl<V> EntryOptions<V> {
    /// Options with no expiration, no dependency, `Normal` priority and no
    /// callback.
    pub fn new() -> Self {
        Self {
            dependency: None,
            absolute_expiration: None,
            sliding_expiration: Duration::ZERO,
            priority: CacheItemPriority::Normal,
            on_removed: None,
        }
    }

    /// Invalidates the entry when `dependency` changes.
    #[must_use]
    pub fn with_dependency(mut self, dependency: Arc<dyn CacheDependency>) -> Self {
        self.dependency = Some(dependency);
        self
    }

    /// Expires the entry at a fixed instant.
    #[must_use]
    pub fn with_absolute_expiration(mut self, at: Instant) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    /// Expires the entry once it has not been read for `window`.
    #[must_use]
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = window;
        self
    }

    /// Sets the eviction priority.
    #[must_use]
    pub fn with_priority(mut self, priority: CacheItemPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Registers a callback fired once when the entry leaves the cache.
    #[must_use]
    pub fn with_removed_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CacheKey, &V, RemovedReason) + Send + 'static,
    {
        self.on_removed = Some(Box::new(callback));
        self
    }

    /// Checks the options for combinations the cache rejects.
    pub fn validate(&self) -> Result<()> {
        if self.absolute_expiration.is_some() && !self.sliding_expiration.is_zero() {
            return Err(CacheError::ConflictingExpiration);
        }
        if self.sliding_expiration > MAX_SLIDING_EXPIRATION {
            return Err(CacheError::SlidingExpirationTooLong(self.sliding_expiration));
        }
        Ok(())
    }
}

impl<V> Default for EntryOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for EntryOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryOptions")
            .field("has_dependency", &self.dependency.is_some())
            .field("absolute_expiration", &self.absolute_expiration)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("priority", &self.priority)
            .field("has_callback", &self.on_removed.is_some())
            .finish()
    }
}

/// Something whose usage can be recorded, possibly cascading to the entries
/// it depends on. Lets key dependencies touch entries of any value type.
pub(crate) trait UsageTarget: Send + Sync {
    fn update_usage_recursive(&self, now: u64, visited: &mut HashSet<usize>);
}

/// A stored record.
pub struct CacheEntry<V> {
    key: CacheKey,
    value: V,
    dependency: Option<Arc<dyn CacheDependency>>,
    on_removed: Mutex<Option<RemovedCallback<V>>>,
    priority: CacheItemPriority,
    sliding: u64,
    expires: AtomicU64,
    last_usage: AtomicU64,
    created: u64,
    state: AtomicU8,
    closed: AtomicBool,
    dependents: Mutex<Vec<Weak<KeyDependencyState>>>,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(
        key: CacheKey,
        value: V,
        options: EntryOptions<V>,
        time: &TimeBase,
        now: u64,
    ) -> Self {
        let sliding = duration_to_nanos(options.sliding_expiration);
        let expires = match options.absolute_expiration {
            Some(at) => time.ticks(at),
            None if sliding > 0 => now.saturating_add(sliding).min(NEVER - 1),
            None => NEVER,
        };
        Self {
            key,
            value,
            dependency: options.dependency,
            on_removed: Mutex::new(options.on_removed),
            priority: options.priority,
            sliding,
            expires: AtomicU64::new(expires),
            last_usage: AtomicU64::new(now),
            created: now,
            state: AtomicU8::new(EntryState::NotInCache as u8),
            closed: AtomicBool::new(false),
            dependents: Mutex::new(Vec::new()),
        }
    }

    /// The entry's key.
    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The cached value.
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The eviction priority.
    #[inline]
    pub fn priority(&self) -> CacheItemPriority {
        self.priority
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_public(&self) -> bool {
        self.key.is_public()
    }

    #[inline]
    pub(crate) fn dependency(&self) -> Option<&Arc<dyn CacheDependency>> {
        self.dependency.as_ref()
    }

    #[inline]
    pub(crate) fn has_expiration(&self) -> bool {
        self.expires.load(Ordering::Acquire) != NEVER
    }

    #[inline]
    pub(crate) fn expires(&self) -> u64 {
        self.expires.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_expires(&self, ticks: u64) {
        self.expires.store(ticks, Ordering::Release);
    }

    #[inline]
    pub(crate) fn sliding(&self) -> u64 {
        self.sliding
    }

    #[inline]
    pub(crate) fn is_expired(&self, now: u64) -> bool {
        let expires = self.expires();
        expires != NEVER && expires <= now
    }

    #[inline]
    pub(crate) fn has_usage(&self) -> bool {
        self.priority != CacheItemPriority::NotRemovable
    }

    /// Whether the usage index should track this entry at all.
    pub(crate) fn qualifies_for_usage(&self, now: u64) -> bool {
        self.has_usage()
            && (!self.has_expiration()
                || self.sliding > 0
                || self.expires().saturating_sub(now) >= MIN_LIFETIME_FOR_USAGE)
    }

    #[inline]
    pub(crate) fn last_usage(&self) -> u64 {
        self.last_usage.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn created(&self) -> u64 {
        self.created
    }

    /// Stable identity for index bookkeeping and cycle detection.
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self as *const Self as *const () as usize
    }

    /// Registers a key dependency that must hear about this entry's removal.
    /// Returns `false` if the entry is already closed.
    pub(crate) fn add_dependent(&self, dependent: Weak<KeyDependencyState>) -> bool {
        let mut dependents = self.dependents.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        dependents.push(dependent);
        true
    }

    /// Whether the dependency reports a change. A panicking dependency
    /// counts as changed.
    pub(crate) fn dependency_changed(&self) -> bool {
        let Some(dependency) = &self.dependency else {
            return false;
        };
        catch_unwind(AssertUnwindSafe(|| dependency.has_changed())).unwrap_or_else(|_| {
            error!(key = %self.key, "dependency panicked while checking for changes");
            true
        })
    }

    /// Returns `false` if the dependency panicked while starting to watch.
    pub(crate) fn monitor_dependency_changes(&self, notifier: ChangeNotifier) -> bool {
        let Some(dependency) = &self.dependency else {
            return true;
        };
        let started = catch_unwind(AssertUnwindSafe(|| dependency.start_monitoring(notifier)));
        if started.is_err() {
            error!(key = %self.key, "dependency panicked while starting to monitor");
        }
        started.is_ok()
    }

    /// Fires removal side effects exactly once: dependents are told, the
    /// callback runs, the dependency is released.
    ///
    /// Must be called without holding any shard lock; callbacks are user code.
    pub(crate) fn close(&self, reason: RemovedReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(EntryState::RemovedFromCache);

        let dependents = core::mem::take(&mut *self.dependents.lock());
        for dependent in dependents {
            if let Some(dependent) = dependent.upgrade() {
                dependent.notify_changed();
            }
        }

        if let Some(callback) = self.on_removed.lock().take() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                callback(&self.key, &self.value, reason)
            }));
            if outcome.is_err() {
                error!(key = %self.key, ?reason, "removal callback panicked");
            }
        }

        if let Some(dependency) = &self.dependency {
            if catch_unwind(AssertUnwindSafe(|| dependency.dispose())).is_err() {
                error!(key = %self.key, "dependency panicked while being disposed");
            }
        }
    }
}

impl<V: Send + Sync> UsageTarget for CacheEntry<V> {
    fn update_usage_recursive(&self, now: u64, visited: &mut HashSet<usize>) {
        if !visited.insert(self.addr()) {
            return;
        }
        let last = self.last_usage.load(Ordering::Relaxed);
        if now.saturating_sub(last) < TICKS_PER_SECOND {
            return;
        }
        self.last_usage.store(now, Ordering::Relaxed);

        if let Some(keys) = self.dependency.as_ref().and_then(|d| d.as_key_dependency()) {
            keys.update_usage_recursive(now, visited);
        }
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("expires", &self.expires())
            .field("sliding", &self.sliding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::atomic::AtomicUsize;

    fn entry_with(options: EntryOptions<u32>) -> (ManualClock, TimeBase, CacheEntry<u32>) {
        let clock = ManualClock::new();
        let time = TimeBase::new(clock.now());
        let now = time.ticks(clock.now());
        let entry = CacheEntry::new(CacheKey::public("k"), 7, options, &time, now);
        (clock, time, entry)
    }

    #[test]
    fn test_options_reject_conflicting_expirations() {
        let options: EntryOptions<u32> = EntryOptions::new()
            .with_absolute_expiration(Instant::now())
            .with_sliding_expiration(Duration::from_secs(1));
        assert_eq!(options.validate(), Err(CacheError::ConflictingExpiration));

        let options: EntryOptions<u32> =
            EntryOptions::new().with_sliding_expiration(MAX_SLIDING_EXPIRATION * 2);
        assert!(matches!(
            options.validate(),
            Err(CacheError::SlidingExpirationTooLong(_))
        ));
    }

    #[test]
    fn test_sliding_entry_expires_after_window() {
        let (clock, time, entry) =
            entry_with(EntryOptions::new().with_sliding_expiration(Duration::from_secs(5)));
        assert!(entry.has_expiration());
        clock.advance(Duration::from_secs(4));
        assert!(!entry.is_expired(time.ticks(clock.now())));
        clock.advance(Duration::from_secs(1));
        assert!(entry.is_expired(time.ticks(clock.now())));
    }

    #[test]
    fn test_usage_qualification() {
        let (_, _, plain) = entry_with(EntryOptions::new());
        assert!(plain.qualifies_for_usage(0));

        let (_, _, pinned) =
            entry_with(EntryOptions::new().with_priority(CacheItemPriority::NotRemovable));
        assert!(!pinned.qualifies_for_usage(0));

        let clock = ManualClock::new();
        let time = TimeBase::new(clock.now());
        let soon = CacheEntry::new(
            CacheKey::public("soon"),
            1u32,
            EntryOptions::new().with_absolute_expiration(clock.now() + Duration::from_secs(2)),
            &time,
            0,
        );
        assert!(!soon.qualifies_for_usage(0));

        let later = CacheEntry::new(
            CacheKey::public("later"),
            1u32,
            EntryOptions::new().with_absolute_expiration(clock.now() + Duration::from_secs(60)),
            &time,
            0,
        );
        assert!(later.qualifies_for_usage(0));
    }

    #[test]
    fn test_close_fires_callback_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let (_, _, entry) = entry_with(EntryOptions::new().with_removed_callback(
            move |key: &CacheKey, value: &u32, reason| {
                assert_eq!(key.text(), "k");
                assert_eq!(*value, 7);
                assert_eq!(reason, RemovedReason::Expired);
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        entry.close(RemovedReason::Expired);
        entry.close(RemovedReason::Removed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(entry.state(), EntryState::RemovedFromCache);
    }

    #[test]
    fn test_close_survives_panicking_callback() {
        let (_, _, entry) = entry_with(
            EntryOptions::new().with_removed_callback(|_: &CacheKey, _: &u32, _| panic!("boom")),
        );
        entry.close(RemovedReason::Removed);
        assert_eq!(entry.state(), EntryState::RemovedFromCache);
    }

    #[test]
    fn test_usage_touch_is_throttled() {
        let (_, _, entry) = entry_with(EntryOptions::new());
        let mut visited = HashSet::new();
        entry.update_usage_recursive(TICKS_PER_SECOND / 2, &mut visited);
        assert_eq!(entry.last_usage(), 0);

        let mut visited = HashSet::new();
        entry.update_usage_recursive(2 * TICKS_PER_SECOND, &mut visited);
        assert_eq!(entry.last_usage(), 2 * TICKS_PER_SECOND);
    }
}
