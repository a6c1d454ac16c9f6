//! Memory statistics and pressure monitoring.
//!
//! The cache watches two independent signals:
//!
//! - how much memory the process itself holds, against a private-bytes
//!   limit, and
//! - how much of the machine's physical memory is in use, against a
//!   percentage limit.
//!
//! Both are read through [`MemoryStatsSource`], so embedders (and tests) can
//! swap the operating system probe for their own numbers. When pressure stays
//! high after trimming, the monitor asks a [`MemoryReclaimer`] to give memory
//! back, e.g. by trimming allocator arenas.

mod monitor;
mod pressure;

pub(crate) use monitor::{MemoryPressureMonitor, MonitorSettings, PassOutcome, MAX_RECLAIM_BACKOFF};
pub use pressure::{PressureLevel, PressureReading, PressureSnapshot};

use crate::error::{CacheError, Result};
use core::fmt;
use parking_lot::Mutex;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Machine-wide physical memory figures, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMemory {
    /// Installed physical memory
    pub total_bytes: u64,
    /// Physical memory currently in use
    pub used_bytes: u64,
}

impl PhysicalMemory {
    /// Percentage of physical memory in use, `0..=100`.
    pub fn percent_used(&self) -> u32 {
        percent_of(self.used_bytes, self.total_bytes)
    }
}

/// `value` as a percentage of `limit`, saturating at `u32::MAX`.
pub(crate) fn percent_of(value: u64, limit: u64) -> u32 {
    if limit == 0 {
        return 0;
    }
    let percent = u128::from(value) * 100 / u128::from(limit);
    u32::try_from(percent).unwrap_or(u32::MAX)
}

/// Source of the memory numbers the monitor samples.
pub trait MemoryStatsSource: Send + Sync {
    /// Memory held by this process, in bytes.
    fn private_bytes(&self) -> Result<u64>;

    /// Machine-wide physical memory usage.
    fn physical_memory(&self) -> Result<PhysicalMemory>;
}

/// Gives memory back to the operating system when pressure stays high.
pub trait MemoryReclaimer: Send + Sync {
    /// Performs one reclamation cycle and returns the number of bytes it knows
    /// it freed, or zero when unknown. The monitor also measures private bytes
    /// before and after the call.
    fn reclaim(&self) -> u64;
}

/// A reclaimer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReclaimer;

impl MemoryReclaimer for NoopReclaimer {
    fn reclaim(&self) -> u64 {
        0
    }
}

/// [`MemoryStatsSource`] backed by `sysinfo`.
///
/// Keeps one `System` instance and the current pid around so each sample only
/// refreshes this process and the memory totals.
pub struct SysinfoMemoryStats {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoMemoryStats {
    /// Creates a probe for the current process.
    pub fn new() -> Result<Self> {
        let pid = get_current_pid()
            .map_err(|e| CacheError::MemoryStatsUnavailable(e.to_string()))?;
        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }
}

impl MemoryStatsSource for SysinfoMemoryStats {
    fn private_bytes(&self) -> Result<u64> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| {
                CacheError::MemoryStatsUnavailable(format!("process {} not found", self.pid))
            })
    }

    fn physical_memory(&self) -> Result<PhysicalMemory> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total_bytes = system.total_memory();
        if total_bytes == 0 {
            return Err(CacheError::MemoryStatsUnavailable(
                "total physical memory reported as zero".to_string(),
            ));
        }
        Ok(PhysicalMemory {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(system.available_memory()),
        })
    }
}

impl fmt::Debug for SysinfoMemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoMemoryStats")
            .field("pid", &self.pid)
            .finish()
    }
}
