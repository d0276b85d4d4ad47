use pamiq_clock::VirtualClock;

use crate::error::{Result, ThreadsError};

/// Fires a callback once at least `interval` virtual seconds have elapsed
/// since the previous fire (or construction).
pub struct TimeIntervalScheduler {
    clock: VirtualClock,
    interval: f64,
    last_fired: f64,
}

impl TimeIntervalScheduler {
    pub fn new(clock: VirtualClock, interval: f64) -> Result<Self> {
        if !(interval > 0.0) {
            return Err(ThreadsError::NonPositiveInterval(interval));
        }
        let last_fired = clock.time();
        Ok(Self {
            clock,
            interval,
            last_fired,
        })
    }

    /// Checks elapsed virtual time and, if due, invokes `on_fire` and
    /// re-arms. Returns whether it fired.
    pub fn tick(&mut self, on_fire: impl FnOnce()) -> bool {
        let now = self.clock.time();
        if now - self.last_fired >= self.interval {
            self.last_fired = now;
            on_fire();
            true
        } else {
            false
        }
    }
}

/// Fires a callback once every `interval` calls to `tick`.
pub struct StepIntervalScheduler {
    interval: u64,
    steps_since_fire: u64,
}

impl StepIntervalScheduler {
    pub fn new(interval: u64) -> Result<Self> {
        if interval == 0 {
            return Err(ThreadsError::NonPositiveInterval(0.0));
        }
        Ok(Self {
            interval,
            steps_since_fire: 0,
        })
    }

    pub fn tick(&mut self, on_fire: impl FnOnce()) -> bool {
        self.steps_since_fire += 1;
        if self.steps_since_fire >= self.interval {
            self.steps_since_fire = 0;
            on_fire();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn time_scheduler_fires_once_interval_elapses() {
        let clock = VirtualClock::new();
        let mut scheduler = TimeIntervalScheduler::new(clock.clone(), 0.01).unwrap();
        assert!(!scheduler.tick(|| {}));
        std::thread::sleep(std::time::Duration::from_millis(15));
        let fired = Cell::new(false);
        assert!(scheduler.tick(|| fired.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn time_scheduler_rejects_non_positive_interval() {
        let clock = VirtualClock::new();
        assert!(TimeIntervalScheduler::new(clock, 0.0).is_err());
    }

    #[test]
    fn step_scheduler_fires_every_n_ticks() {
        let mut scheduler = StepIntervalScheduler::new(3).unwrap();
        let mut fire_count = 0;
        for _ in 0..9 {
            scheduler.tick(|| fire_count += 1);
        }
        assert_eq!(fire_count, 3);
    }
}
