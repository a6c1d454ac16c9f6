//! Pressure signals and the capacity they allow.
//!
//! Each signal keeps the last [`HISTORY_COUNT`] samples, expressed as a
//! percentage of its limit, and three marks:
//!
//! ```text
//!   0%            low        middle        high           100%
//!   |-------------|-----------|-------------|---------------|
//!        None         Low         Medium          High
//!    grow to max    hold/+5%    shrink by slope    halve
//! ```
//!
//! [`PressureReading::calc_max_count`] turns the latest sample into a new
//! capacity for a shard holding `current` entries. The monitor combines both
//! signals in a [`PressureSnapshot`], which takes the stricter of the two.

use super::percent_of;

/// Number of samples each signal remembers.
pub(crate) const HISTORY_COUNT: usize = 6;

/// Private bytes marks, as a percentage of the private bytes limit.
const PRIVATE_BYTES_HIGH: u32 = 99;
const PRIVATE_BYTES_MIDDLE: u32 = 98;
const PRIVATE_BYTES_LOW: u32 = 97;

/// Gap between the physical high mark and its middle and low marks.
const PHYSICAL_MIDDLE_GAP: u32 = 2;
const PHYSICAL_LOW_GAP: u32 = 9;

const GIB: u64 = 1 << 30;

/// Coarse classification of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PressureLevel {
    /// Below the low mark
    #[default]
    None,
    /// Between the low and middle marks
    Low,
    /// Between the middle and high marks
    Medium,
    /// At or above the high mark
    High,
}

/// One signal's state after the latest sample. All values are percentages of
/// the signal's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureReading {
    /// Most recent sample
    pub last: u32,
    /// Average over the retained history
    pub average: u32,
    /// Low mark
    pub low: u32,
    /// Middle mark
    pub middle: u32,
    /// High mark
    pub high: u32,
}

impl PressureReading {
    /// Classifies the most recent sample.
    pub fn level(&self) -> PressureLevel {
        if self.last < self.low {
            PressureLevel::None
        } else if self.last < self.middle {
            PressureLevel::Low
        } else if self.last < self.high {
            PressureLevel::Medium
        } else {
            PressureLevel::High
        }
    }

    /// Whether the most recent sample reached the high mark.
    pub fn is_above_high(&self) -> bool {
        self.level() == PressureLevel::High
    }

    /// Capacity this signal allows for a shard currently holding `current`
    /// entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use adaptive_cache::PressureReading;
    ///
    /// let reading = PressureReading { last: 90, average: 80, low: 40, middle: 50, high: 100 };
    /// assert_eq!(reading.calc_max_count(1000, 100_000), 500);
    /// ```
    pub fn calc_max_count(&self, current: usize, absolute_max: usize) -> usize {
        match self.level() {
            PressureLevel::None => absolute_max,
            PressureLevel::Low => {
                if self.average < self.low {
                    current.saturating_add(current / 20)
                } else {
                    current
                }
            }
            PressureLevel::Medium => {
                let slope = u128::from((2 * self.middle).saturating_sub(self.last));
                let middle = u128::from(self.middle.max(1));
                let scaled = (current as u128 * slope / middle).min(usize::MAX as u128) as usize;
                let floor = current / 2;
                let ceiling = current / 20 * 19 + current % 20 * 19 / 20;
                scaled.min(ceiling).max(floor)
            }
            PressureLevel::High => current / 2,
        }
    }
}

/// Both signals at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureSnapshot {
    /// Process memory against the private bytes limit
    pub private_bytes: PressureReading,
    /// Machine memory against the physical memory limit
    pub physical: PressureReading,
}

impl PressureSnapshot {
    /// The higher of the two levels.
    pub fn level(&self) -> PressureLevel {
        self.private_bytes.level().max(self.physical.level())
    }

    /// The stricter capacity of the two signals.
    pub fn calc_max_count(&self, current: usize, absolute_max: usize) -> usize {
        self.private_bytes
            .calc_max_count(current, absolute_max)
            .min(self.physical.calc_max_count(current, absolute_max))
    }
}

#[derive(Debug, Clone, Default)]
struct History {
    samples: [u32; HISTORY_COUNT],
    next: usize,
    len: usize,
}

impl History {
    fn push(&mut self, percent: u32) {
        self.samples[self.next] = percent;
        self.next = (self.next + 1) % HISTORY_COUNT;
        self.len = (self.len + 1).min(HISTORY_COUNT);
    }

    fn last(&self) -> u32 {
        if self.len == 0 {
            return 0;
        }
        self.samples[(self.next + HISTORY_COUNT - 1) % HISTORY_COUNT]
    }

    fn average(&self) -> u32 {
        if self.len == 0 {
            return 0;
        }
        let sum: u64 = self.samples[..self.len].iter().map(|&s| u64::from(s)).sum();
        (sum / self.len as u64) as u32
    }
}

/// Process memory against a private bytes limit.
#[derive(Debug, Clone)]
pub(crate) struct PrivateBytesSignal {
    limit: u64,
    history: History,
}

impl PrivateBytesSignal {
    /// A `limit` of zero derives one from physical memory. With no physical
    /// memory figure either, the signal never reports pressure.
    pub(crate) fn new(limit: u64, total_physical: u64) -> Self {
        let limit = if limit == 0 {
            total_physical / 5 * 3
        } else {
            limit
        };
        Self {
            limit,
            history: History::default(),
        }
    }

    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }

    pub(crate) fn add_sample(&mut self, private_bytes: u64) {
        self.history.push(percent_of(private_bytes, self.limit));
    }

    pub(crate) fn reading(&self) -> PressureReading {
        PressureReading {
            last: self.history.last(),
            average: self.history.average(),
            low: PRIVATE_BYTES_LOW,
            middle: PRIVATE_BYTES_MIDDLE,
            high: PRIVATE_BYTES_HIGH,
        }
    }
}

/// Machine memory in use against a percentage limit.
#[derive(Debug, Clone)]
pub(crate) struct PhysicalMemorySignal {
    high: u32,
    middle: u32,
    low: u32,
    history: History,
}

impl PhysicalMemorySignal {
    /// A `percent` of zero picks the high mark from the amount of installed
    /// memory: larger machines can run closer to full.
    pub(crate) fn new(percent: u8, total_physical: u64) -> Self {
        let high = match percent {
            0 => match total_physical {
                t if t >= 4 * GIB => 99,
                t if t >= 2 * GIB => 98,
                t if t >= GIB => 97,
                t if t >= 768 << 20 => 96,
                _ => 95,
            },
            p => u32::from(p),
        }
        .max(3);
        Self {
            high,
            middle: high.saturating_sub(PHYSICAL_MIDDLE_GAP).max(2),
            low: high.saturating_sub(PHYSICAL_LOW_GAP).max(1),
            history: History::default(),
        }
    }

    pub(crate) fn add_sample(&mut self, percent_used: u32) {
        self.history.push(percent_used);
    }

    pub(crate) fn reading(&self) -> PressureReading {
        PressureReading {
            last: self.history.last(),
            average: self.history.average(),
            low: self.low,
            middle: self.middle,
            high: self.high,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(last: u32, average: u32) -> PressureReading {
        PressureReading {
            last,
            average,
            low: 40,
            middle: 50,
            high: 100,
        }
    }

    #[test]
    fn test_levels() {
        assert_eq!(reading(10, 10).level(), PressureLevel::None);
        assert_eq!(reading(45, 45).level(), PressureLevel::Low);
        assert_eq!(reading(60, 45).level(), PressureLevel::Medium);
        assert_eq!(reading(100, 45).level(), PressureLevel::High);
        assert!(reading(120, 45).is_above_high());
    }

    #[test]
    fn test_calc_max_count_no_pressure_allows_absolute_max() {
        assert_eq!(reading(10, 10).calc_max_count(1000, 50_000), 50_000);
    }

    #[test]
    fn test_calc_max_count_low_pressure_holds_or_grows() {
        assert_eq!(reading(45, 45).calc_max_count(1000, 50_000), 1000);
        assert_eq!(reading(45, 30).calc_max_count(1000, 50_000), 1050);
    }

    #[test]
    fn test_calc_max_count_medium_pressure_is_clamped() {
        // slope (2 * 50 - 90) / 50 would leave 200; the floor is half
        assert_eq!(reading(90, 80).calc_max_count(1000, 50_000), 500);
        // slope (2 * 50 - 55) / 50 would leave 900
        assert_eq!(reading(55, 50).calc_max_count(1000, 50_000), 900);
        // barely above middle: shrink by at least 5%
        assert_eq!(reading(50, 50).calc_max_count(1000, 50_000), 950);
    }

    #[test]
    fn test_calc_max_count_high_pressure_halves() {
        assert_eq!(reading(100, 90).calc_max_count(1000, 50_000), 500);
        assert_eq!(reading(100, 90).calc_max_count(1, 50_000), 0);
    }

    #[test]
    fn test_snapshot_takes_stricter_signal() {
        let snapshot = PressureSnapshot {
            private_bytes: reading(10, 10),
            physical: reading(100, 100),
        };
        assert_eq!(snapshot.level(), PressureLevel::High);
        assert_eq!(snapshot.calc_max_count(1000, 50_000), 500);
    }

    #[test]
    fn test_history_average_and_wraparound() {
        let mut signal = PhysicalMemorySignal::new(90, 0);
        for percent in [10, 20, 30, 40, 50, 60, 70] {
            signal.add_sample(percent);
        }
        let reading = signal.reading();
        assert_eq!(reading.last, 70);
        // oldest sample (10) has been overwritten
        assert_eq!(reading.average, (20 + 30 + 40 + 50 + 60 + 70) / 6);
        assert_eq!((reading.low, reading.middle, reading.high), (81, 88, 90));
    }

    #[test]
    fn test_physical_marks_follow_installed_memory() {
        assert_eq!(PhysicalMemorySignal::new(0, 16 * GIB).reading().high, 99);
        assert_eq!(PhysicalMemorySignal::new(0, GIB).reading().high, 97);
        assert_eq!(PhysicalMemorySignal::new(0, 0).reading().high, 95);
    }

    #[test]
    fn test_private_bytes_limit() {
        let mut signal = PrivateBytesSignal::new(0, 10 * GIB);
        assert_eq!(signal.limit(), 6 * GIB);
        signal.add_sample(6 * GIB);
        assert_eq!(signal.reading().last, 100);
        assert_eq!(signal.reading().level(), PressureLevel::High);

        let mut unknown = PrivateBytesSignal::new(0, 0);
        unknown.add_sample(u64::MAX);
        assert_eq!(unknown.reading().level(), PressureLevel::None);
    }
}
