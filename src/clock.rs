//! Time sources.
//!
//! All expiration and usage bookkeeping reads time through a [`Clock`], so the
//! cache can be driven by a [`ManualClock`] in tests instead of sleeping.
//! Internally instants are stored as nanosecond offsets ("ticks") from the
//! instant the cache was created, which lets entries keep their timestamps in
//! plain atomics.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::time::Instant;

/// A monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// The operating system's monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// use adaptive_cache::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(clock.now() - start, Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(duration_to_nanos(by), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

/// Sentinel tick value meaning "never".
pub(crate) const NEVER: u64 = u64::MAX;

/// Number of ticks in one second.
pub(crate) const TICKS_PER_SECOND: u64 = 1_000_000_000;

#[inline]
pub(crate) fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(NEVER - 1)
}

/// Converts instants to ticks relative to a fixed origin.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeBase {
    origin: Instant,
}

impl TimeBase {
    pub(crate) fn new(origin: Instant) -> Self {
        Self { origin }
    }

    /// Instants before the origin collapse to tick zero.
    pub(crate) fn ticks(&self, at: Instant) -> u64 {
        duration_to_nanos(at.saturating_duration_since(self.origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now().duration_since(t0), Duration::from_millis(1500));
    }

    #[test]
    fn test_time_base_counts_and_clamps() {
        let clock = ManualClock::new();
        let start = clock.now();
        let base = TimeBase::new(start);
        clock.advance(Duration::from_secs(3));
        assert_eq!(base.ticks(clock.now()), 3 * TICKS_PER_SECOND);

        let later = TimeBase::new(clock.now());
        assert_eq!(later.ticks(start), 0);
    }
}
