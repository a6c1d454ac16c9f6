use cache_simulator::generator::WorkloadConfig;
use cache_simulator::profile::{default_profile, parse_phase, Phase};
use cache_simulator::runner::{Simulation, SimulationConfig};
use cache_simulator::stats::{print_summary, write_csv};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Adaptive cache workload simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of shards (power of two)
    #[arg(long, default_value = "8")]
    shards: usize,

    /// Worker threads issuing requests
    #[arg(long, default_value = "4")]
    threads: usize,

    /// Number of distinct keys
    #[arg(long, default_value = "100000")]
    keys: u32,

    /// Requests per simulated tick, across all threads
    #[arg(long, default_value = "20000")]
    requests: usize,

    /// Ticks per phase
    #[arg(long, default_value = "6")]
    ticks: u32,

    /// Simulated seconds per tick
    #[arg(long, default_value = "5")]
    tick_secs: u64,

    /// Memory charged per cached entry, in bytes
    #[arg(long, default_value = "4096")]
    entry_bytes: u64,

    /// Private bytes limit in MB
    #[arg(long, default_value = "512")]
    limit_mb: u64,

    /// Physical memory limit percentage
    #[arg(long, default_value = "90")]
    physical_percent: u8,

    /// Percentage of keys that are popular
    #[arg(long, default_value = "20")]
    popular_keys: u8,

    /// Percentage of traffic going to popular keys
    #[arg(long, default_value = "80")]
    popular_traffic: u8,

    /// Percentage of inserts with a sliding expiration
    #[arg(long, default_value = "30")]
    ttl_percent: u8,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Memory profile as name:private:physical phases, comma separated
    /// (default: calm, warming, squeeze, critical, recovery)
    #[arg(long, value_delimiter = ',', value_parser = parse_phase)]
    profile: Vec<Phase>,

    /// Export per-phase results to CSV file
    #[arg(long, value_name = "PATH")]
    output_csv: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_level);

    let profile = if args.profile.is_empty() {
        default_profile()
    } else {
        args.profile.clone()
    };

    let config = SimulationConfig {
        shards: args.shards,
        threads: args.threads,
        requests_per_tick: args.requests,
        ticks_per_phase: args.ticks,
        tick: Duration::from_secs(args.tick_secs),
        entry_bytes: args.entry_bytes,
        private_bytes_limit: args.limit_mb << 20,
        physical_memory_percent: args.physical_percent,
        seed: args.seed,
        workload: WorkloadConfig {
            keys: args.keys,
            popular_keys_percent: args.popular_keys,
            popular_traffic_percent: args.popular_traffic,
            ttl_percent: args.ttl_percent,
            ..WorkloadConfig::default()
        },
    };
    info!(?config, phases = profile.len(), "starting simulation");

    let started = Instant::now();
    let simulation = Simulation::new(config)?;
    let results = simulation.run(&profile);
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "simulation finished");

    print_summary(&results);
    if let Some(path) = args.output_csv {
        write_csv(&path, &results)?;
        println!("Results written to {}", path.display());
    }
    Ok(())
}

fn init_logging(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
