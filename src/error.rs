//! Error types for the adaptive cache.
//!
//! The hot path (`get`, `insert`, `add`, `remove`) never fails: races and
//! memory pressure are resolved by policy. Errors are reserved for invalid
//! configuration, invalid per-entry options and unavailable memory
//! statistics.

use core::time::Duration;
use thiserror::Error;

/// Result type alias using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors reported by the cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The configured shard count is not a power of two.
    #[error("shard count must be a non-zero power of two, got {0}")]
    InvalidShardCount(usize),

    /// The physical memory limit percentage is outside `0..=100`.
    #[error("physical memory limit must be a percentage in 0..=100, got {0}")]
    InvalidMemoryPercentage(u8),

    /// A timer interval was configured as zero.
    #[error("{name} must be greater than zero")]
    ZeroInterval {
        /// Name of the offending setting
        name: &'static str,
    },

    /// `min_count` exceeds `max_count`.
    #[error("min_count ({min}) must not exceed max_count ({max})")]
    InvalidCountRange {
        /// Configured lower bound
        min: usize,
        /// Configured upper bound
        max: usize,
    },

    /// An entry was given both an absolute and a sliding expiration.
    #[error("an entry cannot have both an absolute and a sliding expiration")]
    ConflictingExpiration,

    /// The sliding expiration is longer than the supported maximum.
    #[error("sliding expiration {0:?} exceeds the one year maximum")]
    SlidingExpirationTooLong(Duration),

    /// Memory statistics could not be read from the operating system.
    #[error("memory statistics unavailable: {0}")]
    MemoryStatsUnavailable(String),

    /// A background timer thread could not be spawned.
    #[error("failed to start {name} timer: {reason}")]
    TimerSpawn {
        /// Which timer failed
        name: &'static str,
        /// Operating system error text
        reason: String,
    },
}
