//! Dependency based invalidation.
//!
//! An entry inserted with a [`CacheDependency`] is removed with
//! [`RemovedReason::DependencyChanged`](crate::RemovedReason::DependencyChanged)
//! as soon as the dependency reports a change. The cache only needs two
//! capabilities from a dependency: "has it changed already?" and "tell me when
//! it does". What the dependency watches (files, configuration, another
//! process) is up to the implementor.
//!
//! Two implementations ship with the crate:
//!
//! - [`ManualDependency`]: changes when [`ManualDependency::notify_changed`]
//!   is called. Useful as a building block for external watchers.
//! - [`KeyDependency`]: changes when any of a set of cache entries leaves the
//!   cache. Built with [`Cache::key_dependency`](crate::Cache::key_dependency).
//!
//! A dependency instance belongs to a single entry; attach a fresh one to each
//! entry you insert.

use crate::entry::{CacheEntry, UsageTarget};
use crate::key::CacheKey;
use crate::HashSet;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// One-shot notification handed to a dependency when monitoring starts.
pub type ChangeNotifier = Box<dyn FnOnce() + Send>;

/// A condition an entry's validity depends on.
pub trait CacheDependency: Send + Sync {
    /// Returns `true` once the dependency has changed. Must stay `true`.
    fn has_changed(&self) -> bool;

    /// Starts watching for changes.
    ///
    /// The notifier must be invoked at most once, after the change is visible
    /// through [`has_changed`](Self::has_changed). If the dependency changed
    /// before this call, it may simply drop the notifier: the cache re-checks
    /// `has_changed` after monitoring starts.
    fn start_monitoring(&self, notifier: ChangeNotifier);

    /// Called once the owning entry has left the cache.
    fn dispose(&self) {}

    /// Downcast hook used to propagate usage through key dependencies.
    #[doc(hidden)]
    fn as_key_dependency(&self) -> Option<&KeyDependency> {
        None
    }
}

/// Shared "changed" flag plus the pending notifier.
#[derive(Default)]
struct ChangeState {
    changed: AtomicBool,
    notifier: Mutex<Option<ChangeNotifier>>,
}

impl ChangeState {
    fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    fn start_monitoring(&self, notifier: ChangeNotifier) {
        let mut slot = self.notifier.lock();
        if !self.has_changed() {
            *slot = Some(notifier);
        }
    }

    fn notify_changed(&self) {
        self.changed.store(true, Ordering::Release);
        let notifier = self.notifier.lock().take();
        if let Some(notifier) = notifier {
            notifier();
        }
    }

    fn dispose(&self) {
        self.notifier.lock().take();
    }
}

/// A dependency that changes when told to.
///
/// # Examples
///
/// ```
/// use adaptive_cache::{Cache, CacheConfig, EntryOptions, ManualDependency};
/// use std::sync::Arc;
///
/// let cache: Cache<String> = Cache::init(CacheConfig::new().with_memory_collection(false)).unwrap();
/// let config_file = Arc::new(ManualDependency::new());
/// cache
///     .insert_with(
///         "settings",
///         "v1".to_string(),
///         EntryOptions::new().with_dependency(config_file.clone()),
///     )
///     .unwrap();
/// assert!(cache.get("settings").is_some());
///
/// config_file.notify_changed();
/// assert!(cache.get("settings").is_none());
/// ```
#[derive(Default)]
pub struct ManualDependency {
    state: ChangeState,
}

impl ManualDependency {
    /// Creates an unchanged dependency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the dependency changed and notifies the owning entry.
    pub fn notify_changed(&self) {
        self.state.notify_changed();
    }
}

impl CacheDependency for ManualDependency {
    fn has_changed(&self) -> bool {
        self.state.has_changed()
    }

    fn start_monitoring(&self, notifier: ChangeNotifier) {
        self.state.start_monitoring(notifier);
    }

    fn dispose(&self) {
        self.state.dispose();
    }
}

impl fmt::Debug for ManualDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualDependency")
            .field("changed", &self.has_changed())
            .finish()
    }
}

pub(crate) struct KeyDependencyState {
    change: ChangeState,
    keys: Vec<CacheKey>,
    targets: Vec<Weak<dyn UsageTarget>>,
}

impl KeyDependencyState {
    pub(crate) fn notify_changed(&self) {
        self.change.notify_changed();
    }
}

/// A dependency on other cache entries.
///
/// It changes as soon as any of the entries it was resolved against is
/// removed, replaced, expires or is evicted. A key that was absent when the
/// dependency was built makes it changed from the start.
///
/// Reading the dependent entry also counts as a use of the entries it depends
/// on, so they are kept alive by the usage index for as long as the dependent
/// is popular.
pub struct KeyDependency {
    state: Arc<KeyDependencyState>,
}

impl KeyDependency {
    /// Builds a dependency from the current entries for `keys`, as returned by
    /// `lookup`.
    pub(crate) fn resolve<V, F>(keys: Vec<CacheKey>, mut lookup: F) -> Self
    where
        V: Send + Sync + 'static,
        F: FnMut(&CacheKey) -> Option<Arc<CacheEntry<V>>>,
    {
        let mut missing = false;
        let mut entries = Vec::with_capacity(keys.len());
        for key in &keys {
            match lookup(key) {
                Some(entry) => entries.push(entry),
                None => missing = true,
            }
        }

        let targets = entries
            .iter()
            .map(|entry| {
                let target: Arc<dyn UsageTarget> = entry.clone();
                Arc::downgrade(&target)
            })
            .collect();
        let state = Arc::new(KeyDependencyState {
            change: ChangeState::default(),
            keys,
            targets,
        });

        for entry in &entries {
            if !entry.add_dependent(Arc::downgrade(&state)) {
                missing = true;
            }
        }
        if missing {
            state.change.changed.store(true, Ordering::Release);
        }
        Self { state }
    }

    /// The keys this dependency watches.
    pub fn keys(&self) -> &[CacheKey] {
        &self.state.keys
    }

    pub(crate) fn update_usage_recursive(&self, now: u64, visited: &mut HashSet<usize>) {
        for target in &self.state.targets {
            if let Some(target) = target.upgrade() {
                target.update_usage_recursive(now, visited);
            }
        }
    }
}

impl CacheDependency for KeyDependency {
    fn has_changed(&self) -> bool {
        self.state.change.has_changed()
    }

    fn start_monitoring(&self, notifier: ChangeNotifier) {
        self.state.change.start_monitoring(notifier);
    }

    fn dispose(&self) {
        self.state.change.dispose();
    }

    fn as_key_dependency(&self) -> Option<&KeyDependency> {
        Some(self)
    }
}

impl fmt::Debug for KeyDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDependency")
            .field("keys", &self.state.keys)
            .field("changed", &self.has_changed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeBase;
    use crate::entry::{EntryOptions, RemovedReason};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn entry(text: &str) -> Arc<CacheEntry<u32>> {
        let time = TimeBase::new(Instant::now());
        Arc::new(CacheEntry::new(
            CacheKey::public(text),
            1,
            EntryOptions::new(),
            &time,
            0,
        ))
    }

    #[test]
    fn test_manual_dependency_notifies_once() {
        let dependency = ManualDependency::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dependency.start_monitoring(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!dependency.has_changed());

        dependency.notify_changed();
        dependency.notify_changed();
        assert!(dependency.has_changed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_dependency_changed_before_monitoring() {
        let dependency = ManualDependency::new();
        dependency.notify_changed();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dependency.start_monitoring(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(dependency.has_changed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_key_dependency_changes_when_target_closes() {
        let parent = entry("parent");
        let dependency = KeyDependency::resolve(vec![CacheKey::public("parent")], |_| {
            Some(Arc::clone(&parent))
        });
        assert!(!dependency.has_changed());
        assert_eq!(dependency.keys(), &[CacheKey::public("parent")]);

        parent.close(RemovedReason::Removed);
        assert!(dependency.has_changed());
    }

    #[test]
    fn test_key_dependency_on_missing_key_starts_changed() {
        let dependency =
            KeyDependency::resolve::<u32, _>(vec![CacheKey::public("absent")], |_| None);
        assert!(dependency.has_changed());
    }

    #[test]
    fn test_key_dependency_on_closed_entry_starts_changed() {
        let parent = entry("parent");
        parent.close(RemovedReason::Expired);
        let dependency = KeyDependency::resolve(vec![CacheKey::public("parent")], |_| {
            Some(Arc::clone(&parent))
        });
        assert!(dependency.has_changed());
    }
}
