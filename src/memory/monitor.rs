//! The memory monitor pass.
//!
//! ```text
//!  tick ──► busy? ──yes──► skip
//!            │no
//!            ▼
//!       suspended? ──yes──► skip until the window ends
//!            │no
//!            ▼
//!   sample private bytes + physical memory
//!            ▼
//!   arm insert gate (High only) ──► review every shard ──► reclaim (High only)
//!            ▼
//!   disarm insert gate, publish snapshot, pick next poll interval
//! ```
//!
//! A pass is owned by whoever flips the busy flag. The periodic timer and
//! `Cache::review_memory_stats` race for it; the loser skips instead of
//! queueing.

use super::pressure::{PhysicalMemorySignal, PrivateBytesSignal};
use super::{MemoryReclaimer, MemoryStatsSource, PressureLevel, PressureSnapshot};
use crate::clock::Clock;
use crate::metrics::CacheStats;
use crate::store::CacheStore;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Reclaims are at least this far apart.
pub(crate) const MIN_RECLAIM_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for the reclaim backoff window.
pub(crate) const MAX_RECLAIM_BACKOFF: Duration = Duration::from_secs(60);

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Monitor settings derived from [`CacheConfig`](crate::CacheConfig).
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorSettings {
    pub(crate) private_bytes_limit: u64,
    pub(crate) physical_memory_percent: u8,
    pub(crate) poll_interval: Duration,
    pub(crate) high_pressure_poll_interval: Duration,
    pub(crate) reclaim_backoff: Duration,
}

/// What a call to [`MemoryPressureMonitor::run_pass`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PassOutcome {
    /// Another pass was in flight.
    Busy,
    /// Sampling is suspended after an ineffective reclaim.
    Suspended,
    Completed {
        snapshot: PressureSnapshot,
        trimmed: usize,
    },
}

struct MonitorState {
    private_bytes: PrivateBytesSignal,
    physical: PhysicalMemorySignal,
    last_reclaim: Option<Instant>,
    suspended_until: Option<Instant>,
    backoff: Duration,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Samples memory, resizes the shards and reclaims memory when pressure
/// stays high.
pub(crate) struct MemoryPressureMonitor {
    settings: MonitorSettings,
    source: Arc<dyn MemoryStatsSource>,
    reclaimer: Arc<dyn MemoryReclaimer>,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
    private_bytes_limit: u64,
    busy: AtomicBool,
    state: Mutex<MonitorState>,
    last_snapshot: Mutex<Option<PressureSnapshot>>,
}

impl MemoryPressureMonitor {
    pub(crate) fn new(
        settings: MonitorSettings,
        source: Arc<dyn MemoryStatsSource>,
        reclaimer: Arc<dyn MemoryReclaimer>,
        clock: Arc<dyn Clock>,
        stats: Arc<CacheStats>,
    ) -> Self {
        let total_physical = match source.physical_memory() {
            Ok(memory) => memory.total_bytes,
            Err(e) => {
                error!(error = %e, "cannot read physical memory size; using conservative limits");
                0
            }
        };
        let private_bytes = PrivateBytesSignal::new(settings.private_bytes_limit, total_physical);
        let physical = PhysicalMemorySignal::new(settings.physical_memory_percent, total_physical);
        debug!(
            private_bytes_limit = private_bytes.limit(),
            physical_high = physical.reading().high,
            "memory monitor limits"
        );

        Self {
            settings,
            source,
            reclaimer,
            clock,
            stats,
            private_bytes_limit: private_bytes.limit(),
            busy: AtomicBool::new(false),
            state: Mutex::new(MonitorState {
                private_bytes,
                physical,
                last_reclaim: None,
                suspended_until: None,
                backoff: settings.reclaim_backoff.min(MAX_RECLAIM_BACKOFF),
            }),
            last_snapshot: Mutex::new(None),
        }
    }

    pub(crate) fn private_bytes_limit(&self) -> u64 {
        self.private_bytes_limit
    }

    /// The snapshot published by the last completed pass.
    pub(crate) fn last_snapshot(&self) -> Option<PressureSnapshot> {
        *self.last_snapshot.lock()
    }

    /// Poll interval to use after a pass that produced `snapshot`.
    pub(crate) fn next_interval(&self, snapshot: &PressureSnapshot) -> Duration {
        if snapshot.level() == PressureLevel::High {
            self.settings.high_pressure_poll_interval
        } else {
            self.settings.poll_interval
        }
    }

    /// Runs one pass against `store` unless another is in flight.
    pub(crate) fn run_pass<V, S>(&self, store: &S) -> PassOutcome
    where
        S: CacheStore<V> + ?Sized,
    {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            self.stats.record_skipped_pass();
            debug!("memory monitor pass already running; skipping");
            return PassOutcome::Busy;
        };

        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.lock();
            if let Some(until) = state.suspended_until {
                if now < until {
                    debug!("memory sampling suspended");
                    return PassOutcome::Suspended;
                }
                state.suspended_until = None;
                info!("resuming memory sampling");
            }
            self.sample(&mut state);
            PressureSnapshot {
                private_bytes: state.private_bytes.reading(),
                physical: state.physical.reading(),
            }
        };

        // Trimming runs removal callbacks, which may call back into the cache
        store.block_insert_if_needed(&snapshot);
        let trimmed = store.review_memory_stats(&snapshot);
        self.reclaim_if_needed(&snapshot, now);
        store.unblock_insert();

        *self.last_snapshot.lock() = Some(snapshot);
        self.stats.record_monitor_pass();
        debug!(
            level = ?snapshot.level(),
            private_bytes = snapshot.private_bytes.last,
            physical = snapshot.physical.last,
            trimmed,
            "memory monitor pass"
        );
        PassOutcome::Completed { snapshot, trimmed }
    }

    /// Blocks until no pass is in flight.
    pub(crate) fn wait_idle(&self) {
        while self.busy.load(Ordering::Acquire) {
            thread::sleep(DRAIN_POLL);
        }
    }

    fn sample(&self, state: &mut MonitorState) {
        match self.source.private_bytes() {
            Ok(bytes) => state.private_bytes.add_sample(bytes),
            Err(e) => error!(error = %e, "failed to sample private bytes"),
        }
        match self.source.physical_memory() {
            Ok(memory) => state.physical.add_sample(memory.percent_used()),
            Err(e) => error!(error = %e, "failed to sample physical memory"),
        }
    }

    fn reclaim_if_needed(&self, snapshot: &PressureSnapshot, now: Instant) {
        if snapshot.level() != PressureLevel::High {
            return;
        }
        let physical_high = snapshot.physical.is_above_high();
        {
            let mut state = self.state.lock();
            let min_interval = if physical_high {
                state.backoff
            } else {
                MIN_RECLAIM_INTERVAL
            };
            if let Some(last) = state.last_reclaim {
                if now.saturating_duration_since(last) < min_interval {
                    return;
                }
            }
            state.last_reclaim = Some(now);
        }

        let before = self.source.private_bytes().ok();
        let reported = self.reclaimer.reclaim();
        let measured = match (before, self.source.private_bytes().ok()) {
            (Some(before), Some(after)) => before.saturating_sub(after),
            _ => 0,
        };
        let freed = reported.max(measured);

        let effective = freed > 0 && freed >= self.private_bytes_limit / 100;
        self.stats.record_reclaim(effective);
        let mut state = self.state.lock();
        if effective {
            state.backoff = self.settings.reclaim_backoff.min(MAX_RECLAIM_BACKOFF);
            if !physical_high {
                debug!(freed, "memory reclaimed");
                return;
            }
        }

        let window = state.backoff;
        state.suspended_until = now.checked_add(window);
        if !effective {
            state.backoff = (window * 2).min(MAX_RECLAIM_BACKOFF);
        }
        drop(state);
        warn!(
            freed,
            physical_high,
            window_secs = window.as_secs(),
            "memory pressure persists after reclaim; suspending sampling"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::{CacheEntry, RemovedReason};
    use crate::error::Result;
    use crate::key::CacheKey;
    use crate::memory::PhysicalMemory;
    use crate::store::UpdateResult;
    use core::sync::atomic::{AtomicU64, AtomicUsize};

    const GIB: u64 = 1 << 30;

    #[derive(Default)]
    struct ScriptedStats {
        private_bytes: AtomicU64,
        used_bytes: AtomicU64,
    }

    impl MemoryStatsSource for ScriptedStats {
        fn private_bytes(&self) -> Result<u64> {
            Ok(self.private_bytes.load(Ordering::SeqCst))
        }

        fn physical_memory(&self) -> Result<PhysicalMemory> {
            Ok(PhysicalMemory {
                total_bytes: 10 * GIB,
                used_bytes: self.used_bytes.load(Ordering::SeqCst),
            })
        }
    }

    struct ShrinkingReclaimer {
        stats: Arc<ScriptedStats>,
        by: u64,
        calls: AtomicUsize,
    }

    impl MemoryReclaimer for ShrinkingReclaimer {
        fn reclaim(&self) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stats.private_bytes.fetch_sub(self.by, Ordering::SeqCst);
            0
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        reviews: AtomicUsize,
        blocks: AtomicUsize,
        unblocks: AtomicUsize,
    }

    impl CacheStore<u32> for RecordingStore {
        fn update_cache(
            &self,
            _key: &CacheKey,
            _new_entry: Option<Arc<CacheEntry<u32>>>,
            _replace: bool,
            _reason: RemovedReason,
        ) -> UpdateResult<u32> {
            UpdateResult::none()
        }

        fn review_memory_stats(&self, _pressure: &PressureSnapshot) -> usize {
            self.reviews.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn enable_expiration_timer(&self, _enable: bool) {}

        fn flush_expired_items(&self, _use_insert_block: bool) -> usize {
            0
        }

        fn trim(&self, _percent: u32) -> usize {
            0
        }

        fn block_insert_if_needed(&self, pressure: &PressureSnapshot) {
            if pressure.level() == PressureLevel::High {
                self.blocks.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn unblock_insert(&self) {
            self.unblocks.fetch_add(1, Ordering::SeqCst);
        }

        fn count(&self) -> usize {
            0
        }

        fn total_count(&self) -> usize {
            0
        }

        fn enumerate(&self) -> Box<dyn Iterator<Item = Arc<CacheEntry<u32>>> + '_> {
            Box::new(core::iter::empty())
        }

        fn shard_count(&self) -> usize {
            1
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        memory: Arc<ScriptedStats>,
        reclaimer: Arc<ShrinkingReclaimer>,
        stats: Arc<CacheStats>,
        monitor: MemoryPressureMonitor,
    }

    /// Private bytes limit of 1 GiB, physical limit of 90%.
    fn fixture(reclaim_by: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let memory = Arc::new(ScriptedStats::default());
        let reclaimer = Arc::new(ShrinkingReclaimer {
            stats: Arc::clone(&memory),
            by: reclaim_by,
            calls: AtomicUsize::new(0),
        });
        let stats = Arc::new(CacheStats::default());
        let monitor = MemoryPressureMonitor::new(
            MonitorSettings {
                private_bytes_limit: GIB,
                physical_memory_percent: 90,
                poll_interval: Duration::from_secs(30),
                high_pressure_poll_interval: Duration::from_secs(5),
                reclaim_backoff: Duration::from_secs(30),
            },
            memory.clone(),
            reclaimer.clone(),
            clock.clone(),
            Arc::clone(&stats),
        );
        Fixture {
            clock,
            memory,
            reclaimer,
            stats,
            monitor,
        }
    }

    #[test]
    fn test_quiet_pass_reviews_without_blocking() {
        let f = fixture(0);
        f.memory.private_bytes.store(GIB / 10, Ordering::SeqCst);
        f.memory.used_bytes.store(2 * GIB, Ordering::SeqCst);
        let store = RecordingStore::default();

        let outcome = f.monitor.run_pass(&store);
        let PassOutcome::Completed { snapshot, .. } = outcome else {
            panic!("expected a completed pass, got {outcome:?}");
        };
        assert_eq!(snapshot.level(), PressureLevel::None);
        assert_eq!(f.monitor.next_interval(&snapshot), Duration::from_secs(30));
        assert_eq!(store.reviews.load(Ordering::SeqCst), 1);
        assert_eq!(store.blocks.load(Ordering::SeqCst), 0);
        assert_eq!(store.unblocks.load(Ordering::SeqCst), 1);
        assert_eq!(f.reclaimer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.monitor.last_snapshot(), Some(snapshot));
    }

    #[test]
    fn test_effective_reclaim_is_rate_limited() {
        let f = fixture(GIB / 20);
        f.memory.private_bytes.store(2 * GIB, Ordering::SeqCst);
        f.memory.used_bytes.store(GIB, Ordering::SeqCst);
        let store = RecordingStore::default();

        let outcome = f.monitor.run_pass(&store);
        let PassOutcome::Completed { snapshot, .. } = outcome else {
            panic!("expected a completed pass, got {outcome:?}");
        };
        assert_eq!(snapshot.level(), PressureLevel::High);
        assert_eq!(f.monitor.next_interval(&snapshot), Duration::from_secs(5));
        assert_eq!(store.blocks.load(Ordering::SeqCst), 1);
        assert_eq!(f.reclaimer.calls.load(Ordering::SeqCst), 1);

        f.clock.advance(Duration::from_secs(1));
        f.monitor.run_pass(&store);
        assert_eq!(f.reclaimer.calls.load(Ordering::SeqCst), 1);

        f.clock.advance(MIN_RECLAIM_INTERVAL);
        f.monitor.run_pass(&store);
        assert_eq!(f.reclaimer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.stats.snapshot().ineffective_reclaims, 0);
    }

    #[test]
    fn test_ineffective_reclaim_suspends_sampling() {
        let f = fixture(0);
        f.memory.private_bytes.store(2 * GIB, Ordering::SeqCst);
        f.memory.used_bytes.store(GIB, Ordering::SeqCst);
        let store = RecordingStore::default();

        assert!(matches!(f.monitor.run_pass(&store), PassOutcome::Completed { .. }));
        assert_eq!(f.stats.snapshot().ineffective_reclaims, 1);

        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.monitor.run_pass(&store), PassOutcome::Suspended);
        assert_eq!(store.reviews.load(Ordering::SeqCst), 1);

        f.clock.advance(Duration::from_secs(21));
        assert!(matches!(f.monitor.run_pass(&store), PassOutcome::Completed { .. }));
        assert_eq!(store.reviews.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_busy_pass_is_skipped() {
        let f = fixture(0);
        let store = RecordingStore::default();
        f.monitor.busy.store(true, Ordering::SeqCst);
        assert_eq!(f.monitor.run_pass(&store), PassOutcome::Busy);
        assert_eq!(store.reviews.load(Ordering::SeqCst), 0);
        assert_eq!(f.stats.snapshot().skipped_passes, 1);

        f.monitor.busy.store(false, Ordering::SeqCst);
        f.monitor.wait_idle();
        assert!(matches!(f.monitor.run_pass(&store), PassOutcome::Completed { .. }));
    }
}
