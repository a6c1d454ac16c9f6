// Scripted memory pressure profiles

use adaptive_cache::{MemoryStatsSource, PhysicalMemory, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// One stretch of the simulation with fixed background memory usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    /// Private bytes held outside the cache, as a percentage of the limit
    pub base_private_percent: u8,
    /// Machine-wide physical memory in use
    pub physical_percent: u8,
}

/// Parse `name:private:physical`, e.g. `spike:80:97`
pub fn parse_phase(s: &str) -> std::result::Result<Phase, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [name, private, physical] = parts.as_slice() else {
        return Err(format!("expected name:private:physical, got '{s}'"));
    };
    let percent = |field: &str, what: &str| -> std::result::Result<u8, String> {
        match field.parse::<u8>() {
            Ok(p) if p <= 100 => Ok(p),
            _ => Err(format!("{what} must be a percentage in 0..=100, got '{field}'")),
        }
    };
    Ok(Phase {
        name: (*name).to_string(),
        base_private_percent: percent(private, "private")?,
        physical_percent: percent(physical, "physical")?,
    })
}

/// Calm, a slow squeeze, a spike past the limits, then recovery
pub fn default_profile() -> Vec<Phase> {
    [
        ("calm", 10, 40),
        ("warming", 40, 70),
        ("squeeze", 70, 89),
        ("critical", 85, 97),
        ("recovery", 20, 50),
    ]
    .into_iter()
    .map(|(name, private, physical)| Phase {
        name: name.to_string(),
        base_private_percent: private,
        physical_percent: physical,
    })
    .collect()
}

/// Memory statistics the runner sets before every monitor pass
#[derive(Debug)]
pub struct ScriptedMemory {
    total_bytes: u64,
    private_bytes: AtomicU64,
    used_percent: AtomicU64,
}

impl ScriptedMemory {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            private_bytes: AtomicU64::new(0),
            used_percent: AtomicU64::new(0),
        }
    }

    pub fn set(&self, private_bytes: u64, used_percent: u8) {
        self.private_bytes.store(private_bytes, Ordering::Relaxed);
        self.used_percent
            .store(u64::from(used_percent.min(100)), Ordering::Relaxed);
    }
}

impl MemoryStatsSource for ScriptedMemory {
    fn private_bytes(&self) -> Result<u64> {
        Ok(self.private_bytes.load(Ordering::Relaxed))
    }

    fn physical_memory(&self) -> Result<PhysicalMemory> {
        Ok(PhysicalMemory {
            total_bytes: self.total_bytes,
            used_bytes: self.total_bytes / 100 * self.used_percent.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_phase() {
        assert_eq!(
            parse_phase("spike:80:97").unwrap(),
            Phase {
                name: "spike".to_string(),
                base_private_percent: 80,
                physical_percent: 97,
            }
        );
        assert!(parse_phase("spike:80").is_err());
        assert!(parse_phase("spike:180:97").is_err());
        assert!(parse_phase("spike:x:97").is_err());
    }

    #[test]
    fn test_scripted_memory() {
        let memory = ScriptedMemory::new(1000);
        memory.set(42, 95);
        assert_eq!(memory.private_bytes().unwrap(), 42);
        assert_eq!(memory.physical_memory().unwrap().percent_used(), 95);
    }
}
