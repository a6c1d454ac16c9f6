// Per-phase statistics and reporting

use crate::profile::Phase;
use adaptive_cache::PressureLevel;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;

/// What happened during one phase, one CSV row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub phase: String,
    pub base_private_percent: u8,
    pub physical_percent: u8,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub inserts: u64,
    pub expired: u64,
    pub evicted: u64,
    pub entries_at_end: u64,
    pub private_bytes_percent: u64,
    pub peak_level: String,
}

impl PhaseResult {
    /// Build from cache metrics taken before and after the phase
    pub fn from_metrics(
        phase: &Phase,
        before: &BTreeMap<String, f64>,
        after: &BTreeMap<String, f64>,
        peak: PressureLevel,
    ) -> Self {
        let delta = |name: &str| -> u64 {
            let value = after.get(name).copied().unwrap_or(0.0) - before.get(name).copied().unwrap_or(0.0);
            value.max(0.0) as u64
        };
        let current = |name: &str| -> u64 { after.get(name).copied().unwrap_or(0.0) as u64 };

        let hits = delta("hits");
        let misses = delta("misses");
        let requests = hits + misses;
        Self {
            phase: phase.name.clone(),
            base_private_percent: phase.base_private_percent,
            physical_percent: phase.physical_percent,
            requests,
            hits,
            misses,
            hit_rate: if requests > 0 {
                hits as f64 / requests as f64
            } else {
                0.0
            },
            inserts: delta("inserts"),
            expired: delta("expired"),
            evicted: delta("underused"),
            entries_at_end: current("total_entries"),
            private_bytes_percent: current("private_bytes_percent"),
            peak_level: format!("{peak:?}"),
        }
    }
}

/// Print a table of phase results to stdout
pub fn print_summary(results: &[PhaseResult]) {
    println!();
    println!(
        "{:<12} {:>8} {:>8} {:>10} {:>8} {:>10} {:>10} {:>10} {:>9} {:>8}",
        "Phase", "Private", "Physical", "Requests", "Hit %", "Inserts", "Expired", "Evicted", "Entries", "Peak"
    );
    println!("{}", "-".repeat(102));
    for r in results {
        println!(
            "{:<12} {:>7}% {:>7}% {:>10} {:>7.2}% {:>10} {:>10} {:>10} {:>9} {:>8}",
            r.phase,
            r.base_private_percent,
            r.physical_percent,
            r.requests,
            r.hit_rate * 100.0,
            r.inserts,
            r.expired,
            r.evicted,
            r.entries_at_end,
            r.peak_level
        );
    }

    let requests: u64 = results.iter().map(|r| r.requests).sum();
    let hits: u64 = results.iter().map(|r| r.hits).sum();
    let evicted: u64 = results.iter().map(|r| r.evicted).sum();
    if requests > 0 {
        println!();
        println!(
            "Overall hit rate: {:.2}% over {requests} requests, {evicted} evictions",
            hits as f64 / requests as f64 * 100.0
        );
    }
}

/// Write phase results as CSV
pub fn write_csv(path: &Path, results: &[PhaseResult]) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}
