//! Cache Configuration Module
//!
//! [`CacheConfig`] is the single entry point for configuring a
//! [`Cache`](crate::Cache). Every setting has a default; builder methods
//! override them and [`CacheConfig::validate`] (run by
//! [`Cache::init`](crate::Cache::init)) rejects inconsistent combinations.
//!
//! # Memory limits
//!
//! Two independent limits drive trimming:
//!
//! - **`private_bytes_limit`**: how much memory this process may hold, in
//!   bytes. `0` derives a limit from installed memory (60% of it).
//! - **`physical_memory_percent`**: how full the machine may get. `0` picks a
//!   high mark between 95% and 99% depending on installed memory.
//!
//! # Capacity bounds
//!
//! `min_count` and `absolute_max_count` bound the capacity computed for each
//! shard. Under pressure a shard never shrinks below `min_count`; without
//! pressure it may grow up to `absolute_max_count`.
//!
//! # Examples
//!
//! ```
//! use adaptive_cache::CacheConfig;
//! use std::time::Duration;
//!
//! let config = CacheConfig::new()
//!     .with_shards(8)
//!     .with_private_bytes_limit(512 * 1024 * 1024)
//!     .with_poll_interval(Duration::from_secs(10));
//! assert!(config.validate().is_ok());
//! assert_eq!(config.shards(), 8);
//! ```

use crate::error::{CacheError, Result};
use crate::memory::{MonitorSettings, MAX_RECLAIM_BACKOFF};
use crate::shard::ShardSettings;
use core::fmt;
use core::time::Duration;

/// Default period of the expiration flush timer.
pub const DEFAULT_EXPIRATION_INTERVAL: Duration = Duration::from_secs(20);

/// Default memory poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default memory poll period while pressure is high.
pub const DEFAULT_HIGH_PRESSURE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default wait after a reclaim that did not relieve pressure.
pub const DEFAULT_RECLAIM_BACKOFF: Duration = Duration::from_secs(30);

/// Default lower bound for a shard's capacity.
pub const DEFAULT_MIN_COUNT: usize = 10;

/// Returns the default number of shards: the smallest power of two that is
/// at least the number of logical CPUs.
fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|p: std::num::NonZeroUsize| p.get())
        .unwrap_or(1)
        .next_power_of_two()
}

/// Configuration for a [`Cache`](crate::Cache).
#[derive(Clone, Copy)]
pub struct CacheConfig {
    shards: usize,
    expiration_enabled: bool,
    expiration_interval: Duration,
    memory_collection_enabled: bool,
    private_bytes_limit: u64,
    physical_memory_percent: u8,
    poll_interval: Duration,
    high_pressure_poll_interval: Duration,
    reclaim_backoff: Duration,
    min_count: usize,
    absolute_max_count: usize,
}

impl CacheConfig {
    /// Creates a configuration with every setting at its default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: default_shard_count(),
            expiration_enabled: true,
            expiration_interval: DEFAULT_EXPIRATION_INTERVAL,
            memory_collection_enabled: true,
            private_bytes_limit: 0,
            physical_memory_percent: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            high_pressure_poll_interval: DEFAULT_HIGH_PRESSURE_POLL_INTERVAL,
            reclaim_backoff: DEFAULT_RECLAIM_BACKOFF,
            min_count: DEFAULT_MIN_COUNT,
            absolute_max_count: usize::MAX,
        }
    }

    /// Sets the number of shards. Must be a power of two; `1` stores
    /// everything in a single shard with no routing.
    #[must_use]
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Turns expiration on or off. While off, entries never expire and the
    /// flush timer does not run.
    #[must_use]
    pub fn with_expiration(mut self, enabled: bool) -> Self {
        self.expiration_enabled = enabled;
        self
    }

    /// Sets how often expired entries are flushed proactively.
    #[must_use]
    pub fn with_expiration_interval(mut self, interval: Duration) -> Self {
        self.expiration_interval = interval;
        self
    }

    /// Turns memory monitoring (and therefore pressure driven trimming) on or
    /// off.
    #[must_use]
    pub fn with_memory_collection(mut self, enabled: bool) -> Self {
        self.memory_collection_enabled = enabled;
        self
    }

    /// Sets the private bytes limit in bytes. `0` derives it from physical
    /// memory.
    #[must_use]
    pub fn with_private_bytes_limit(mut self, bytes: u64) -> Self {
        self.private_bytes_limit = bytes;
        self
    }

    /// Sets the physical memory high mark in percent. `0` picks one from the
    /// amount of installed memory.
    #[must_use]
    pub fn with_physical_memory_percent(mut self, percent: u8) -> Self {
        self.physical_memory_percent = percent;
        self
    }

    /// Sets the nominal memory poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the memory poll interval used while pressure is high.
    #[must_use]
    pub fn with_high_pressure_poll_interval(mut self, interval: Duration) -> Self {
        self.high_pressure_poll_interval = interval;
        self
    }

    /// Sets the initial wait after a reclaim that did not relieve pressure.
    /// Capped at 60 seconds.
    #[must_use]
    pub fn with_reclaim_backoff(mut self, backoff: Duration) -> Self {
        self.reclaim_backoff = backoff.min(MAX_RECLAIM_BACKOFF);
        self
    }

    /// Sets the smallest capacity pressure may shrink a shard to.
    #[must_use]
    pub fn with_min_count(mut self, min_count: usize) -> Self {
        self.min_count = min_count;
        self
    }

    /// Sets the largest capacity a shard may grow to.
    #[must_use]
    pub fn with_absolute_max_count(mut self, max_count: usize) -> Self {
        self.absolute_max_count = max_count;
        self
    }

    /// Returns the number of shards.
    #[inline]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Returns whether expiration is enabled.
    #[inline]
    pub fn expiration_enabled(&self) -> bool {
        self.expiration_enabled
    }

    /// Returns the expiration flush interval.
    #[inline]
    pub fn expiration_interval(&self) -> Duration {
        self.expiration_interval
    }

    /// Returns whether memory monitoring is enabled.
    #[inline]
    pub fn memory_collection_enabled(&self) -> bool {
        self.memory_collection_enabled
    }

    /// Returns the configured private bytes limit (`0` = automatic).
    #[inline]
    pub fn private_bytes_limit(&self) -> u64 {
        self.private_bytes_limit
    }

    /// Returns the configured physical memory percentage (`0` = automatic).
    #[inline]
    pub fn physical_memory_percent(&self) -> u8 {
        self.physical_memory_percent
    }

    /// Returns the nominal memory poll interval.
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the memory poll interval used under high pressure.
    #[inline]
    pub fn high_pressure_poll_interval(&self) -> Duration {
        self.high_pressure_poll_interval
    }

    /// Returns the initial reclaim backoff.
    #[inline]
    pub fn reclaim_backoff(&self) -> Duration {
        self.reclaim_backoff
    }

    /// Returns the per-shard capacity floor.
    #[inline]
    pub fn min_count(&self) -> usize {
        self.min_count
    }

    /// Returns the per-shard capacity ceiling.
    #[inline]
    pub fn absolute_max_count(&self) -> usize {
        self.absolute_max_count
    }

    /// Checks the configuration for values the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.shards.is_power_of_two() {
            return Err(CacheError::InvalidShardCount(self.shards));
        }
        if self.physical_memory_percent > 100 {
            return Err(CacheError::InvalidMemoryPercentage(
                self.physical_memory_percent,
            ));
        }
        let intervals = [
            ("expiration_interval", self.expiration_interval),
            ("poll_interval", self.poll_interval),
            ("high_pressure_poll_interval", self.high_pressure_poll_interval),
            ("reclaim_backoff", self.reclaim_backoff),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(CacheError::ZeroInterval { name: *name });
        }
        if self.min_count > self.absolute_max_count {
            return Err(CacheError::InvalidCountRange {
                min: self.min_count,
                max: self.absolute_max_count,
            });
        }
        Ok(())
    }

    pub(crate) fn shard_settings(&self) -> ShardSettings {
        ShardSettings {
            min_count: self.min_count,
            absolute_max_count: self.absolute_max_count,
            expiration_enabled: self.expiration_enabled,
        }
    }

    pub(crate) fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            private_bytes_limit: self.private_bytes_limit,
            physical_memory_percent: self.physical_memory_percent,
            poll_interval: self.poll_interval,
            high_pressure_poll_interval: self.high_pressure_poll_interval,
            reclaim_backoff: self.reclaim_backoff,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("shards", &self.shards)
            .field("expiration_enabled", &self.expiration_enabled)
            .field("expiration_interval", &self.expiration_interval)
            .field("memory_collection_enabled", &self.memory_collection_enabled)
            .field("private_bytes_limit", &self.private_bytes_limit)
            .field("physical_memory_percent", &self.physical_memory_percent)
            .field("poll_interval", &self.poll_interval)
            .field(
                "high_pressure_poll_interval",
                &self.high_pressure_poll_interval,
            )
            .field("reclaim_backoff", &self.reclaim_backoff)
            .field("min_count", &self.min_count)
            .field("absolute_max_count", &self.absolute_max_count)
            .finish()
    }
}
