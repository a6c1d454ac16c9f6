#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Code Reference
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Cache<V>                               │
//! │                                                                      │
//! │   ┌────────────┐   hash(key) & (N-1)   ┌───────┐ ┌───────┐ ┌───────┐ │
//! │   │ CacheKey   │──────────────────────►│Shard 0│ │Shard 1│ │  ...  │ │
//! │   └────────────┘                       └───┬───┘ └───────┘ └───────┘ │
//! │                                            │                         │
//! │              ┌─────────────────────────────┼──────────────────┐      │
//! │              ▼                             ▼                  ▼      │
//! │     ┌─────────────────┐         ┌──────────────────┐  ┌────────────┐ │
//! │     │ entry table     │         │ expiration index │  │ usage index│ │
//! │     │ key -> entry    │         │ by expiry time   │  │ by priority│ │
//! │     └─────────────────┘         └──────────────────┘  └────────────┘ │
//! │                                                                      │
//! │   expiration timer ──► flush expired entries                         │
//! │   memory monitor   ──► sample pressure ─► shrink max count ─► trim   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every keyed operation goes to exactly one shard. A shard keeps its entries
//! in a hash table and indexes them twice: by expiration time for the
//! expiration timer, and by priority and last use for pressure-driven
//! eviction. Entries with [`CacheItemPriority::NotRemovable`] never enter the
//! usage index and are only removed explicitly, by expiration, or when their
//! dependency changes.
//!
//! ## Removal reasons
//!
//! | Reason | Cause |
//! |--------|-------|
//! | [`RemovedReason::Removed`] | `remove`, or replaced by `insert` |
//! | [`RemovedReason::Expired`] | absolute or sliding expiration passed |
//! | [`RemovedReason::Underused`] | evicted to relieve memory pressure |
//! | [`RemovedReason::DependencyChanged`] | the entry's dependency changed |
//!
//! ## Expiration and dependencies
//!
//! ```rust
//! use adaptive_cache::{Cache, CacheConfig, EntryOptions, RemovedReason};
//! use std::sync::{Arc, Mutex};
//!
//! let cache: Cache<u32> = Cache::init(CacheConfig::new().with_memory_collection(false)).unwrap();
//! cache.insert("config", 1);
//!
//! let removed = Arc::new(Mutex::new(Vec::new()));
//! let log = removed.clone();
//! let options = EntryOptions::new()
//!     .with_dependency(cache.key_dependency(&["config"]))
//!     .with_removed_callback(move |key, _value, reason| {
//!         log.lock().unwrap().push((key.to_string(), reason));
//!     });
//! cache.insert_with("derived", 2, options).unwrap();
//!
//! // Replacing the dependency target invalidates the dependent entry
//! cache.insert("config", 3);
//! assert_eq!(cache.get("derived"), None);
//! assert_eq!(
//!     removed.lock().unwrap().as_slice(),
//!     &[("derived".to_string(), RemovedReason::DependencyChanged)]
//! );
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Cache configuration
//! - [`clock`]: Time sources, including a manual clock for tests
//! - [`memory`]: Memory statistics, pressure readings and reclamation hooks
//! - [`metrics`]: Counters and the metrics reporting trait

#[cfg(test)]
extern crate scoped_threadpool;

#[cfg(feature = "hashbrown")]
pub(crate) use hashbrown::{DefaultHashBuilder, HashMap, HashSet};

#[cfg(not(feature = "hashbrown"))]
pub(crate) use std::collections::{
    hash_map::RandomState as DefaultHashBuilder, HashMap, HashSet,
};

/// The public cache type and its collaborators.
mod cache;

/// Time sources.
///
/// Provides the [`clock::Clock`] trait, the operating system clock and a
/// manually advanced clock for deterministic tests.
pub mod clock;

/// Cache configuration.
pub mod config;

/// Invalidation by external signal or by other cache entries.
mod dependency;

/// Cache entries, their options and lifecycle.
mod entry;

/// Error types.
mod error;

/// Per-shard expiration index.
mod expires;

/// Cache keys in the public and internal key spaces.
mod key;

/// Memory statistics and the memory pressure monitor.
///
/// Exposes the pressure readings and the traits used to plug in custom
/// memory statistics and reclamation.
pub mod memory;

/// Cache metrics system.
///
/// Lock-free counters updated on the hot path, snapshotted for reporting
/// through the [`metrics::CacheMetrics`] trait.
pub mod metrics;

/// Fan-out over several shards.
mod router;

/// A single shard: entry table, indexes and the update protocol.
mod shard;

/// The storage interface shared by a shard and the router.
mod store;

/// Background periodic timers.
mod timer;

/// Per-shard usage index for pressure-driven eviction.
mod usage;

// Re-export the cache
pub use cache::{Cache, Collaborators};

// Re-export configuration
pub use config::CacheConfig;

// Re-export entry types
pub use dependency::{CacheDependency, ChangeNotifier, KeyDependency, ManualDependency};
pub use entry::{CacheEntry, CacheItemPriority, EntryOptions, EntryState, RemovedReason};
pub use key::CacheKey;

// Re-export errors
pub use error::{CacheError, Result};

// Re-export memory types
pub use memory::{
    MemoryReclaimer, MemoryStatsSource, NoopReclaimer, PhysicalMemory, PressureLevel,
    PressureReading, PressureSnapshot, SysinfoMemoryStats,
};

// Re-export metrics
pub use metrics::{CacheMetrics, CoreCacheMetrics};
