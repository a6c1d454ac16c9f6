//! Dependencies Example
//!
//! Shows expiration, key dependencies and external change signals, with a
//! removal callback reporting why each entry left.
//!
//! Run with: cargo run --example dependencies

use adaptive_cache::clock::{Clock, ManualClock};
use adaptive_cache::{
    Cache, CacheConfig, CacheKey, Collaborators, EntryOptions, ManualDependency, RemovedReason,
    Result, SysinfoMemoryStats,
};
use std::sync::Arc;
use std::time::Duration;

fn logged() -> EntryOptions<String> {
    EntryOptions::new().with_removed_callback(|key: &CacheKey, value: &String, reason: RemovedReason| {
        println!("  removed {key} ({value}) because {reason:?}");
    })
}

fn main() -> Result<()> {
    println!("Dependencies Example");
    println!("====================\n");

    let clock = Arc::new(ManualClock::new());
    let cache: Cache<String> = Cache::init_with(
        CacheConfig::new().with_memory_collection(false),
        Collaborators::new(Arc::new(SysinfoMemoryStats::new()?)).with_clock(clock.clone()),
    )?;

    println!("1. Key dependencies cascade");
    cache.insert_with("user:1", "Ada".to_string(), logged())?;
    cache.insert_with(
        "profile:1",
        "Ada's profile".to_string(),
        logged().with_dependency(cache.key_dependency(&["user:1"])),
    )?;
    cache.insert_with(
        "page:1",
        "rendered page".to_string(),
        logged().with_dependency(cache.key_dependency(&["profile:1"])),
    )?;
    cache.insert("user:1", "Ada Lovelace".to_string());
    println!("  entries left: {}\n", cache.count());

    println!("2. External change signal");
    let settings_file = Arc::new(ManualDependency::new());
    cache.insert_with(
        "settings",
        "theme=dark".to_string(),
        logged().with_dependency(settings_file.clone()),
    )?;
    settings_file.notify_changed();
    println!("  settings cached: {}\n", cache.get("settings").is_some());

    println!("3. Absolute and sliding expiration");
    cache.insert_with(
        "banner",
        "sale ends soon".to_string(),
        logged().with_absolute_expiration(clock.now() + Duration::from_secs(60)),
    )?;
    cache.insert_with(
        "session",
        "token".to_string(),
        logged().with_sliding_expiration(Duration::from_secs(30)),
    )?;
    for minute in 1..=3 {
        clock.advance(Duration::from_secs(20));
        let session = cache.get("session").is_some();
        println!("  t+{}s session alive: {session}", minute * 20);
    }
    clock.advance(Duration::from_secs(31));
    println!("  flushed {} expired entries", cache.flush_expired());
    println!("  entries left: {}", cache.count());
    Ok(())
}
