// Synthetic request streams with a hot/cold key split

use adaptive_cache::CacheItemPriority;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Shape of the generated traffic
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of distinct keys
    pub keys: u32,
    /// Percentage of keys considered popular
    pub popular_keys_percent: u8,
    /// Percentage of requests that go to popular keys
    pub popular_traffic_percent: u8,
    /// Percentage of inserts that carry a sliding expiration
    pub ttl_percent: u8,
    /// Shortest sliding expiration, in seconds
    pub min_ttl_secs: u64,
    /// Longest sliding expiration, in seconds
    pub max_ttl_secs: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            keys: 100_000,
            popular_keys_percent: 20,
            popular_traffic_percent: 80,
            ttl_percent: 30,
            min_ttl_secs: 10,
            max_ttl_secs: 120,
        }
    }
}

/// One read-through request: look the key up, insert on miss
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub key: String,
    pub priority: CacheItemPriority,
    pub sliding: Option<Duration>,
}

/// Deterministic request generator
pub struct Workload {
    config: WorkloadConfig,
    popular: u32,
    rng: StdRng,
}

impl Workload {
    /// Create a generator; equal seeds produce equal streams
    pub fn new(config: WorkloadConfig, seed: u64) -> Self {
        let keys = config.keys.max(2);
        let popular = (u64::from(keys) * u64::from(config.popular_keys_percent.min(100)) / 100)
            .clamp(1, u64::from(keys) - 1) as u32;
        Self {
            config: WorkloadConfig { keys, ..config },
            popular,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Number of keys in the popular set
    pub fn popular_keys(&self) -> u32 {
        self.popular
    }

    /// Draw the next request
    pub fn next_request(&mut self) -> Request {
        let hot = self.rng.gen_range(0..100u8) < self.config.popular_traffic_percent;
        let id = if hot {
            self.rng.gen_range(0..self.popular)
        } else {
            self.rng.gen_range(self.popular..self.config.keys)
        };

        // Popular keys are worth more; a third of the cold keys are cheap to refetch
        let priority = if hot {
            CacheItemPriority::High
        } else if id % 3 == 0 {
            CacheItemPriority::Low
        } else {
            CacheItemPriority::Normal
        };

        let sliding = (self.rng.gen_range(0..100u8) < self.config.ttl_percent).then(|| {
            let lo = self.config.min_ttl_secs.min(self.config.max_ttl_secs);
            Duration::from_secs(self.rng.gen_range(lo..=self.config.max_ttl_secs))
        });

        Request {
            key: format!("object-{id}"),
            priority,
            sliding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = Workload::new(WorkloadConfig::default(), 7);
        let mut b = Workload::new(WorkloadConfig::default(), 7);
        for _ in 0..100 {
            assert_eq!(a.next_request(), b.next_request());
        }
    }

    #[test]
    fn test_popular_keys_get_most_traffic() {
        let config = WorkloadConfig {
            keys: 1000,
            ..WorkloadConfig::default()
        };
        let mut workload = Workload::new(config, 1);
        assert_eq!(workload.popular_keys(), 200);

        let hot = (0..10_000)
            .filter(|_| workload.next_request().priority == CacheItemPriority::High)
            .count();
        assert!((7_500..8_500).contains(&hot), "hot requests: {hot}");
    }

    #[test]
    fn test_ttl_bounds() {
        let config = WorkloadConfig {
            ttl_percent: 100,
            min_ttl_secs: 5,
            max_ttl_secs: 6,
            ..WorkloadConfig::default()
        };
        let mut workload = Workload::new(config, 3);
        for _ in 0..100 {
            let ttl = workload.next_request().sliding.unwrap();
            assert!(ttl >= Duration::from_secs(5) && ttl <= Duration::from_secs(6));
        }
    }
}
