// Drives the cache through a memory profile with worker threads

use crate::generator::{Workload, WorkloadConfig};
use crate::profile::{Phase, ScriptedMemory};
use crate::stats::PhaseResult;
use adaptive_cache::clock::ManualClock;
use adaptive_cache::metrics::CacheMetrics;
use adaptive_cache::{Cache, CacheConfig, Collaborators, EntryOptions, PressureLevel, Result};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const TOTAL_PHYSICAL_BYTES: u64 = 16 << 30;

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub shards: usize,
    pub threads: usize,
    /// Requests per tick, spread over all threads
    pub requests_per_tick: usize,
    pub ticks_per_phase: u32,
    /// Simulated time between ticks
    pub tick: Duration,
    /// Memory charged per cached entry
    pub entry_bytes: u64,
    pub private_bytes_limit: u64,
    pub physical_memory_percent: u8,
    pub seed: u64,
    pub workload: WorkloadConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            shards: 8,
            threads: 4,
            requests_per_tick: 20_000,
            ticks_per_phase: 6,
            tick: Duration::from_secs(5),
            entry_bytes: 4096,
            private_bytes_limit: 512 << 20,
            physical_memory_percent: 90,
            seed: 42,
            workload: WorkloadConfig::default(),
        }
    }
}

/// Runs one simulation
pub struct Simulation {
    config: SimulationConfig,
    clock: Arc<ManualClock>,
    memory: Arc<ScriptedMemory>,
    cache: Cache<u64>,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let clock = Arc::new(ManualClock::new());
        let memory = Arc::new(ScriptedMemory::new(TOTAL_PHYSICAL_BYTES));
        // The runner drives monitor passes itself, once per simulated tick
        let cache = Cache::init_with(
            CacheConfig::new()
                .with_shards(config.shards)
                .with_memory_collection(false)
                .with_private_bytes_limit(config.private_bytes_limit)
                .with_physical_memory_percent(config.physical_memory_percent),
            Collaborators::new(memory.clone()).with_clock(clock.clone()),
        )?;
        Ok(Self {
            config,
            clock,
            memory,
            cache,
        })
    }

    /// Play every phase in order
    pub fn run(&self, profile: &[Phase]) -> Vec<PhaseResult> {
        profile
            .iter()
            .enumerate()
            .map(|(index, phase)| self.run_phase(index, phase))
            .collect()
    }

    fn run_phase(&self, index: usize, phase: &Phase) -> PhaseResult {
        info!(phase = %phase.name, "starting phase");
        let before = self.cache.metrics();
        let mut peak = PressureLevel::None;
        let mut skipped = 0;

        for tick in 0..self.config.ticks_per_phase {
            self.run_tick(index, tick);
            self.clock.advance(self.config.tick);
            self.cache.flush_expired();

            self.memory
                .set(self.private_bytes(phase), phase.physical_percent);
            match self.cache.review_memory_stats() {
                Some(snapshot) => {
                    peak = peak.max(snapshot.level());
                    debug!(
                        phase = %phase.name,
                        tick,
                        level = ?snapshot.level(),
                        entries = self.cache.total_count(),
                        "monitor pass"
                    );
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(phase = %phase.name, skipped, "monitor passes skipped while suspended");
        }
        PhaseResult::from_metrics(phase, &before, &self.cache.metrics(), peak)
    }

    fn run_tick(&self, phase: usize, tick: u32) {
        let threads = self.config.threads.max(1);
        let per_thread = self.config.requests_per_tick / threads;
        thread::scope(|s| {
            for t in 0..threads {
                let seed = self
                    .config
                    .seed
                    .wrapping_add((phase as u64) << 40)
                    .wrapping_add(u64::from(tick) << 20)
                    .wrapping_add(t as u64);
                let mut workload = Workload::new(self.config.workload.clone(), seed);
                s.spawn(move || {
                    for i in 0..per_thread {
                        let request = workload.next_request();
                        if self.cache.get(&request.key).is_some() {
                            continue;
                        }
                        let mut options = EntryOptions::new().with_priority(request.priority);
                        if let Some(sliding) = request.sliding {
                            options = options.with_sliding_expiration(sliding);
                        }
                        if let Err(e) = self.cache.add_with(&request.key, i as u64, options) {
                            warn!(key = %request.key, error = %e, "insert rejected");
                        }
                    }
                });
            }
        });
    }

    /// Background usage plus what the cached entries cost
    fn private_bytes(&self, phase: &Phase) -> u64 {
        let base = self.config.private_bytes_limit / 100 * u64::from(phase.base_private_percent);
        base + self.cache.total_count() as u64 * self.config.entry_bytes
    }
}
