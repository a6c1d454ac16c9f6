//! Memory Pressure Example
//!
//! Fills a cache, then feeds the memory monitor rising memory readings and
//! shows how the cache sheds its least valuable entries first.
//!
//! Run with: cargo run --example memory_pressure

use adaptive_cache::clock::ManualClock;
use adaptive_cache::metrics::CacheMetrics;
use adaptive_cache::{
    Cache, CacheConfig, CacheItemPriority, Collaborators, EntryOptions, MemoryStatsSource,
    PhysicalMemory, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GIB: u64 = 1 << 30;

/// Memory readings we control from `main`.
struct DialMemory {
    private_bytes: AtomicU64,
    used_percent: AtomicU64,
}

impl MemoryStatsSource for DialMemory {
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

fn main() -> Result<()> {
    println!("Memory Pressure Example");
    println!("=======================\n");

    let clock = Arc::new(ManualClock::new());
    let memory = Arc::new(DialMemory {
        private_bytes: AtomicU64::new(100 << 20),
        used_percent: AtomicU64::new(40),
    });
    let cache: Cache<String> = Cache::init_with(
        CacheConfig::new()
            .with_shards(1)
            .with_memory_collection(false)
            .with_private_bytes_limit(GIB)
            .with_physical_memory_percent(90),
        Collaborators::new(memory.clone()).with_clock(clock.clone()),
    )?;

    for i in 0..3000 {
        let priority = match i % 3 {
            0 => CacheItemPriority::Low,
            1 => CacheItemPriority::Normal,
            _ => CacheItemPriority::High,
        };
        cache.insert_with(
            &format!("item-{i}"),
            format!("payload {i}"),
            EntryOptions::new().with_priority(priority),
        )?;
    }
    cache.insert_with(
        "license",
        "must stay".to_string(),
        EntryOptions::new().with_priority(CacheItemPriority::NotRemovable),
    )?;
    println!("Filled cache with {} entries\n", cache.count());

    // Let the entries age past the new-entry grace period
    clock.advance(Duration::from_secs(30));

    let steps = [
        ("calm", 100 << 20, 40),
        ("medium private bytes", GIB * 98 / 100, 60),
        ("high physical memory", 200 << 20, 95),
        ("recovered", 100 << 20, 40),
    ];
    for (label, private_bytes, used_percent) in steps {
        memory.private_bytes.store(private_bytes, Ordering::Relaxed);
        memory.used_percent.store(used_percent, Ordering::Relaxed);
        // Clear any suspension left by the previous step
        clock.advance(Duration::from_secs(120));

        match cache.review_memory_stats() {
            Some(snapshot) => println!(
                "{label:<22} level={:<6} private={:>3}% physical={:>3}% -> {} entries",
                format!("{:?}", snapshot.level()),
                snapshot.private_bytes.last,
                snapshot.physical.last,
                cache.count()
            ),
            None => println!("{label:<22} monitor suspended"),
        }
    }

    let survivors: Vec<String> = cache.iter().map(|(k, _)| k).collect();
    let low = survivors
        .iter()
        .filter(|k| k.strip_prefix("item-").and_then(|n| n.parse::<u32>().ok()).is_some_and(|n| n % 3 == 0))
        .count();
    println!("\nLow priority survivors: {low}");
    println!("Pinned entry still present: {}", cache.get("license").is_some());

    println!("\nMetrics:");
    for (name, value) in cache.metrics() {
        println!("  {name:<24} {value}");
    }
    Ok(())
}
