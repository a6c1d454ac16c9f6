//! Background periodic timer.
//!
//! Each timer owns one named thread that sleeps on a condition variable for
//! the current interval, then runs its tick. Ticks never overlap: a tick that
//! runs longer than the interval simply delays the next one. A tick may return
//! a new interval, which is how the memory monitor polls faster under
//! pressure.
//!
//! Stopping wakes the thread and joins it, so once [`PeriodicTimer::stop`]
//! returns no tick is running and none will start.

use crate::error::{CacheError, Result};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

struct TimerState {
    interval: Duration,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// A named background thread running a tick at a (changeable) interval.
pub(crate) struct PeriodicTimer {
    name: &'static str,
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    /// Spawns the timer thread. The first tick runs one `interval` from now.
    pub(crate) fn start<F>(name: &'static str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval,
                stopped: false,
            }),
            wake: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("cache-{name}"))
            .spawn(move || loop {
                {
                    let mut state = worker.state.lock();
                    if state.stopped {
                        break;
                    }
                    let interval = state.interval;
                    let timed_out = worker.wake.wait_for(&mut state, interval).timed_out();
                    if state.stopped {
                        break;
                    }
                    if !timed_out {
                        continue;
                    }
                }
                if let Some(next) = tick() {
                    worker.state.lock().interval = next;
                }
            })
            .map_err(|e| CacheError::TimerSpawn {
                name,
                reason: e.to_string(),
            })?;

        info!(timer = name, interval_ms = interval.as_millis() as u64, "timer started");
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    /// Changes the interval and restarts the current wait.
    pub(crate) fn set_interval(&self, interval: Duration) {
        self.shared.state.lock().interval = interval;
        self.shared.wake.notify_all();
        debug!(timer = self.name, interval_ms = interval.as_millis() as u64, "timer interval changed");
    }

    pub(crate) fn interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    /// Stops the thread and waits for an in-flight tick to finish.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.state.lock().stopped = true;
        self.shared.wake.notify_all();
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
        info!(timer = self.name, "timer stopped");
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_timer_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        let mut timer = PeriodicTimer::start("test", Duration::from_millis(10), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        timer.stop();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 3);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_tick_can_change_interval() {
        let mut timer = PeriodicTimer::start("test", Duration::from_millis(5), || {
            Some(Duration::from_secs(3600))
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while timer.interval() != Duration::from_secs(3600) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(timer.interval(), Duration::from_secs(3600));

        timer.set_interval(Duration::from_secs(7));
        assert_eq!(timer.interval(), Duration::from_secs(7));
        timer.stop();
    }

    #[test]
    fn test_long_interval_stops_promptly() {
        let timer = PeriodicTimer::start("test", Duration::from_secs(3600), || None).unwrap();
        let started = Instant::now();
        drop(timer);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
