//! Expiration index.
//!
//! Keeps every entry of a shard that carries an expiration, ordered by expiry
//! so that "everything expired as of now" is a prefix scan. Lazy expiration on
//! read (see [`Shard`](crate::shard::Shard)) covers entries that are looked
//! at; this index lets the periodic flush reclaim entries nobody reads.
//!
//! The index never removes entries from the cache on its own. A flush takes a
//! snapshot of the expired prefix and hands each entry back to the shard,
//! whose update protocol detaches it from the index.

use crate::clock::NEVER;
use crate::entry::CacheEntry;
use crate::HashMap;
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

struct ExpiresInner<V> {
    order: BTreeSet<(u64, usize)>,
    entries: HashMap<usize, (u64, Arc<CacheEntry<V>>)>,
}

/// Entries of one shard ordered by expiry.
pub(crate) struct ExpirationIndex<V> {
    inner: Mutex<ExpiresInner<V>>,
    timer_enabled: AtomicBool,
}

impl<V> ExpirationIndex<V> {
    pub(crate) fn new(timer_enabled: bool) -> Self {
        Self {
            inner: Mutex::new(ExpiresInner {
                order: BTreeSet::new(),
                entries: HashMap::new(),
            }),
            timer_enabled: AtomicBool::new(timer_enabled),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub(crate) fn enable_expiration_timer(&self, enable: bool) {
        self.timer_enabled.store(enable, Ordering::Release);
    }

    pub(crate) fn is_timer_enabled(&self) -> bool {
        self.timer_enabled.load(Ordering::Acquire)
    }

    /// Starts tracking `entry` at its current expiry.
    pub(crate) fn add(&self, entry: &Arc<CacheEntry<V>>) {
        let expires = entry.expires();
        if expires == NEVER {
            return;
        }
        let addr = entry.addr();
        let mut inner = self.inner.lock();
        if let Some((old, _)) = inner.entries.insert(addr, (expires, Arc::clone(entry))) {
            inner.order.remove(&(old, addr));
        }
        inner.order.insert((expires, addr));
    }

    /// Stops tracking `entry`. Returns `false` if it was not tracked.
    pub(crate) fn remove(&self, entry: &CacheEntry<V>) -> bool {
        let addr = entry.addr();
        let mut inner = self.inner.lock();
        match inner.entries.remove(&addr) {
            Some((expires, _)) => {
                inner.order.remove(&(expires, addr));
                true
            }
            None => false,
        }
    }

    /// Moves `entry` to a new expiry, typically after a sliding read.
    pub(crate) fn utc_update(&self, entry: &CacheEntry<V>, new_expires: u64) {
        entry.set_expires(new_expires);
        let addr = entry.addr();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some((expires, _)) = inner.entries.get_mut(&addr) {
            inner.order.remove(&(*expires, addr));
            *expires = new_expires;
            inner.order.insert((new_expires, addr));
        }
    }

    /// Hands every entry expired at `now` to `remove`, which routes it through
    /// the owning shard and reports whether it actually left the cache.
    pub(crate) fn flush_expired_items<F>(&self, now: u64, mut remove: F) -> usize
    where
        F: FnMut(&Arc<CacheEntry<V>>) -> bool,
    {
        let expired: Vec<Arc<CacheEntry<V>>> = {
            let inner = self.inner.lock();
            inner
                .order
                .iter()
                .take_while(|(expires, _)| *expires <= now)
                .filter_map(|(_, addr)| inner.entries.get(addr).map(|(_, e)| Arc::clone(e)))
                .collect()
        };

        expired
            .iter()
            .filter(|entry| entry.is_expired(now))
            .filter(|entry| remove(entry))
            .count()
    }
}
