//! Stress tests for the cache with its background timers running.
//!
//! These tests use the real clock, a fast expiration timer and a fast memory
//! monitor fed by a memory curve that other threads move around, so timer
//! ticks, trims and foreground traffic genuinely interleave. They check for
//! panics, deadlocks and broken counters rather than exact outcomes.

use adaptive_cache::metrics::CacheMetrics;
use adaptive_cache::{
    Cache, CacheConfig, CacheItemPriority, Collaborators, EntryOptions, MemoryReclaimer,
    MemoryStatsSource, PhysicalMemory, RemovedReason, Result,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const NUM_THREADS: usize = 8;
const OPS_PER_THREAD: usize = 5_000;
const GIB: u64 = 1 << 30;

/// Memory figures the test threads can move while the monitor samples them.
#[derive(Default)]
struct MemoryCurve {
    private_bytes: AtomicU64,
    used_percent: AtomicU64,
}

impl MemoryStatsSource for MemoryCurve {
    fn private_bytes(&self) -> Result<u64> {
        Ok(self.private_bytes.load(Ordering::Relaxed))
    }

    fn physical_memory(&self) -> Result<PhysicalMemory> {
        let total_bytes = 8 * GIB;
        Ok(PhysicalMemory {
            total_bytes,
            used_bytes: total_bytes / 100 * self.used_percent.load(Ordering::Relaxed),
        })
    }
}

/// Gives back a tenth of the current private bytes on every call.
struct CurveReclaimer {
    curve: Arc<MemoryCurve>,
    calls: AtomicUsize,
}

impl MemoryReclaimer for CurveReclaimer {
    fn reclaim(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let current = self.curve.private_bytes.load(Ordering::Relaxed);
        let freed = current / 10;
        self.curve.private_bytes.fetch_sub(freed, Ordering::Relaxed);
        freed
    }
}

fn stress_cache(shards: usize, curve: &Arc<MemoryCurve>) -> Arc<Cache<usize>> {
    let collaborators = Collaborators::new(curve.clone()).with_reclaimer(Arc::new(CurveReclaimer {
        curve: curve.clone(),
        calls: AtomicUsize::new(0),
    }));
    let config = CacheConfig::new()
        .with_shards(shards)
        .with_private_bytes_limit(GIB)
        .with_physical_memory_percent(90)
        .with_expiration_interval(Duration::from_millis(5))
        .with_poll_interval(Duration::from_millis(10))
        .with_high_pressure_poll_interval(Duration::from_millis(2))
        .with_reclaim_backoff(Duration::from_millis(50));
    Arc::new(Cache::init_with(config, collaborators).unwrap())
}

/// Many threads hammering a small key set while the timers run
#[test]
fn stress_high_contention() {
    let curve = Arc::new(MemoryCurve::default());
    curve.private_bytes.store(GIB / 4, Ordering::Relaxed);
    curve.used_percent.store(40, Ordering::Relaxed);
    let cache = stress_cache(16, &curve);

    let mut handles = Vec::new();
    for t in 0..NUM_THREADS {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let key = format!("k{}", i % 10);
                match (t + i) % 4 {
                    0 => {
                        cache.insert(&key, i);
                    }
                    1 => {
                        cache.add(&key, i);
                    }
                    2 => {
                        cache.remove(&key);
                    }
                    _ => {
                        let _ = cache.get(&key);
                    }
                }
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    assert!(cache.count() <= 10);
    assert_eq!(cache.count(), cache.iter().count());
}

/// Short-lived entries racing the expiration timer
#[test]
fn stress_expiration_timer() {
    let curve = Arc::new(MemoryCurve::default());
    curve.used_percent.store(30, Ordering::Relaxed);
    let cache = stress_cache(4, &curve);
    let expired = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for t in 0..NUM_THREADS {
        let cache = Arc::clone(&cache);
        let expired = Arc::clone(&expired);
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD / 5 {
                let expired = Arc::clone(&expired);
                let options = EntryOptions::new()
                    .with_sliding_expiration(Duration::from_millis(1))
                    .with_removed_callback(move |_, _, reason| {
                        if reason == RemovedReason::Expired {
                            expired.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                cache
                    .insert_with(&format!("t{t}-{i}"), i, options)
                    .unwrap();
                let _ = cache.get(&format!("t{t}-{}", i / 2));
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    // The timer thread may still be closing entries it already unlinked
    let total = NUM_THREADS * (OPS_PER_THREAD / 5);
    for _ in 0..200 {
        cache.flush_expired();
        if expired.load(Ordering::Relaxed) == total {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(expired.load(Ordering::Relaxed), total);
    assert_eq!(cache.count(), 0);
    assert_eq!(cache.metrics()["expired"], total as f64);
}

/// Memory pressure swinging between idle and critical under load
#[test]
fn stress_pressure_swings() {
    let curve = Arc::new(MemoryCurve::default());
    curve.private_bytes.store(GIB / 10, Ordering::Relaxed);
    curve.used_percent.store(50, Ordering::Relaxed);
    let cache = stress_cache(8, &curve);
    let done = Arc::new(AtomicBool::new(false));

    let driver = {
        let curve = Arc::clone(&curve);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut step = 0u64;
            while !done.load(Ordering::Relaxed) {
                let (private, used) = match step % 3 {
                    0 => (GIB / 10, 50),
                    1 => (GIB * 98 / 100, 89),
                    _ => (GIB, 97),
                };
                curve.private_bytes.store(private, Ordering::Relaxed);
                curve.used_percent.store(used, Ordering::Relaxed);
                step += 1;
                thread::sleep(Duration::from_millis(3));
            }
        })
    };

    let mut handles = Vec::new();
    for t in 0..NUM_THREADS {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let priority = match i % 3 {
                    0 => CacheItemPriority::Low,
                    1 => CacheItemPriority::Normal,
                    _ => CacheItemPriority::High,
                };
                cache
                    .insert_with(
                        &format!("t{t}-{i}"),
                        i,
                        EntryOptions::new().with_priority(priority),
                    )
                    .unwrap();
                if i % 7 == 0 {
                    let _ = cache.get(&format!("t{t}-{}", i / 2));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    done.store(true, Ordering::Relaxed);
    driver.join().expect("Thread panicked");
    cache.set_memory_collection(false).unwrap();

    let metrics = cache.metrics();
    let inserted = (NUM_THREADS * OPS_PER_THREAD) as f64;
    assert_eq!(metrics["inserts"], inserted);
    assert_eq!(
        metrics["public_entries"] + metrics["total_removals"],
        inserted
    );
    assert!(metrics["monitor_passes"] > 0.0);
}

/// Toggling the timers while traffic flows must not deadlock
#[test]
fn stress_toggle_timers() {
    let curve = Arc::new(MemoryCurve::default());
    curve.private_bytes.store(GIB / 2, Ordering::Relaxed);
    curve.used_percent.store(60, Ordering::Relaxed);
    let cache = stress_cache(4, &curve);
    let done = Arc::new(AtomicBool::new(false));

    let toggler = {
        let cache = Arc::clone(&cache);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut on = false;
            while !done.load(Ordering::Relaxed) {
                cache.set_memory_collection(on).unwrap();
                cache.set_expiration_enabled(!on).unwrap();
                on = !on;
                thread::sleep(Duration::from_millis(1));
            }
            cache.set_memory_collection(true).unwrap();
            cache.set_expiration_enabled(true).unwrap();
        })
    };

    let mut handles = Vec::new();
    for t in 0..NUM_THREADS {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD / 5 {
                cache.insert(&format!("t{t}-{}", i % 100), i);
                cache.trim(1);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    done.store(true, Ordering::Relaxed);
    toggler.join().expect("Thread panicked");

    assert!(cache.count() <= NUM_THREADS * 100);
}

/// Dropping a cache with running timers stops them
#[test]
fn stress_drop_with_running_timers() {
    for shards in [1, 2, 4, 8] {
        let curve = Arc::new(MemoryCurve::default());
        curve.used_percent.store(95, Ordering::Relaxed);
        let cache = stress_cache(shards, &curve);
        for i in 0..1000 {
            cache.insert(&format!("k{i}"), i);
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.shard_count(), shards);
        drop(cache);
    }
}
