//! A scalable, pausable, serializable virtual time source shared by every
//! worker in the system.
//!
//! [`VirtualClock`] is constructed once by the launcher and cloned (it is a
//! cheap `Arc`-backed handle) into every component that needs a notion of
//! "now". Only the control thread mutates it (`pause`/`resume`/
//! `set_time_scale`); every other thread only reads.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time scale must be positive, got {0}")]
    InvalidScale(f64),
    #[error("io error reading/writing clock state: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize clock state: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClockError>;

/// The serializable, restorable snapshot of a [`VirtualClock`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockStateDict {
    pub scale: f64,
    pub scaled_anchor_time: f64,
    pub scaled_anchor_monotonic: f64,
    pub scaled_anchor_perf_counter: f64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    scaled_time: f64,
    scaled_monotonic: f64,
    scaled_perf_counter: f64,
    raw_monotonic: f64,
}

struct Inner {
    scale: f64,
    paused: bool,
    anchor: Anchor,
}

/// A process-wide handle to virtual time. Cheap to clone; all clones share
/// the same underlying state.
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<Mutex<Inner>>,
    process_start: Instant,
    epoch: SystemTime,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        let process_start = Instant::now();
        let epoch = UNIX_EPOCH;
        let now_wall = wall_seconds(epoch);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                scale: 1.0,
                paused: false,
                anchor: Anchor {
                    scaled_time: now_wall,
                    scaled_monotonic: 0.0,
                    scaled_perf_counter: 0.0,
                    raw_monotonic: 0.0,
                },
            })),
            process_start,
            epoch,
        }
    }

    fn raw_monotonic_now(&self) -> f64 {
        self.process_start.elapsed().as_secs_f64()
    }

    fn raw_time_now(&self) -> f64 {
        wall_seconds(self.epoch)
    }

    /// Current wall-clock time, in virtual seconds since the Unix epoch.
    pub fn time(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.paused {
            return inner.anchor.scaled_time;
        }
        let raw_now = self.raw_time_now();
        let raw_anchor = self.raw_time_anchor(&inner);
        inner.anchor.scaled_time + inner.scale * (raw_now - raw_anchor)
    }

    /// Monotonic virtual seconds, unrelated to wall-clock jumps.
    pub fn monotonic(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.paused {
            return inner.anchor.scaled_monotonic;
        }
        let raw_now = self.raw_monotonic_now();
        inner.anchor.scaled_monotonic + inner.scale * (raw_now - inner.anchor.raw_monotonic)
    }

    /// High-resolution virtual seconds, for interval timing.
    pub fn perf_counter(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.paused {
            return inner.anchor.scaled_perf_counter;
        }
        let raw_now = self.raw_monotonic_now();
        inner.anchor.scaled_perf_counter + inner.scale * (raw_now - inner.anchor.raw_monotonic)
    }

    // `time` anchors on wall-clock raw time but we only track one raw
    // monotonic anchor; derive the wall-clock raw anchor from it so that
    // re-anchoring stays internally consistent.
    fn raw_time_anchor(&self, inner: &Inner) -> f64 {
        self.raw_time_now() - (self.raw_monotonic_now() - inner.anchor.raw_monotonic)
    }

    /// Requires `scale > 0`. Re-anchors so reported time is continuous.
    pub fn set_time_scale(&self, scale: f64) -> Result<()> {
        if !(scale > 0.0) {
            return Err(ClockError::InvalidScale(scale));
        }
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.scale = scale;
            return Ok(());
        }
        let raw_monotonic = self.raw_monotonic_now();
        let raw_time_anchor = self.raw_time_anchor(&inner);
        let raw_time = self.raw_time_now();
        let cur_time = inner.anchor.scaled_time + inner.scale * (raw_time - raw_time_anchor);
        let cur_monotonic = inner.anchor.scaled_monotonic
            + inner.scale * (raw_monotonic - inner.anchor.raw_monotonic);
        let cur_perf = inner.anchor.scaled_perf_counter
            + inner.scale * (raw_monotonic - inner.anchor.raw_monotonic);
        inner.anchor = Anchor {
            scaled_time: cur_time,
            scaled_monotonic: cur_monotonic,
            scaled_perf_counter: cur_perf,
            raw_monotonic,
        };
        inner.scale = scale;
        Ok(())
    }

    pub fn time_scale(&self) -> f64 {
        self.inner.lock().scale
    }

    /// Idempotent. Freezes all three reported times at their current values.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            return;
        }
        let raw_monotonic = self.raw_monotonic_now();
        let raw_time_anchor = self.raw_time_anchor(&inner);
        let raw_time = self.raw_time_now();
        inner.anchor = Anchor {
            scaled_time: inner.anchor.scaled_time + inner.scale * (raw_time - raw_time_anchor),
            scaled_monotonic: inner.anchor.scaled_monotonic
                + inner.scale * (raw_monotonic - inner.anchor.raw_monotonic),
            scaled_perf_counter: inner.anchor.scaled_perf_counter
                + inner.scale * (raw_monotonic - inner.anchor.raw_monotonic),
            raw_monotonic,
        };
        inner.paused = true;
    }

    /// Idempotent. Re-anchors so reported times continue from their paused
    /// values.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            return;
        }
        inner.anchor.raw_monotonic = self.raw_monotonic_now();
        inner.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Blocks for `dt / scale` wall-clock seconds. Returns immediately while
    /// paused.
    pub fn sleep(&self, dt: f64) {
        let (paused, scale) = {
            let inner = self.inner.lock();
            (inner.paused, inner.scale)
        };
        if paused || dt <= 0.0 {
            return;
        }
        let wall_dt = dt / scale;
        std::thread::sleep(Duration::from_secs_f64(wall_dt.max(0.0)));
    }

    /// Snapshots the current reported times and scale.
    pub fn state_dict(&self) -> ClockStateDict {
        ClockStateDict {
            scale: self.time_scale(),
            scaled_anchor_time: self.time(),
            scaled_anchor_monotonic: self.monotonic(),
            scaled_anchor_perf_counter: self.perf_counter(),
        }
    }

    /// Restores reported times to the values captured by `state_dict`.
    pub fn load_state_dict(&self, dict: ClockStateDict) {
        let mut inner = self.inner.lock();
        inner.scale = dict.scale;
        inner.anchor = Anchor {
            scaled_time: dict.scaled_anchor_time,
            scaled_monotonic: dict.scaled_anchor_monotonic,
            scaled_perf_counter: dict.scaled_anchor_perf_counter,
            raw_monotonic: self.raw_monotonic_now(),
        };
    }

    pub fn save_state(&self, path: &Path) -> Result<()> {
        let dict = self.state_dict();
        let bytes = serde_json::to_vec_pretty(&dict)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_state(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let dict: ClockStateDict = serde_json::from_slice(&bytes)?;
        self.load_state_dict(dict);
        Ok(())
    }
}

fn wall_seconds(epoch: SystemTime) -> f64 {
    SystemTime::now()
        .duration_since(epoch)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep as os_sleep;

    #[test]
    fn monotonic_never_decreases_across_pause_resume_and_scale() {
        let clock = VirtualClock::new();
        let t0 = clock.monotonic();
        clock.set_time_scale(3.0).unwrap();
        os_sleep(Duration::from_millis(5));
        let t1 = clock.monotonic();
        assert!(t1 >= t0);
        clock.pause();
        os_sleep(Duration::from_millis(5));
        let t2 = clock.monotonic();
        assert!(t2 >= t1);
        clock.resume();
        os_sleep(Duration::from_millis(5));
        let t3 = clock.monotonic();
        assert!(t3 >= t2);
    }

    #[test]
    fn pause_freezes_all_three_clocks() {
        let clock = VirtualClock::new();
        clock.pause();
        let (a0, b0, c0) = (clock.time(), clock.monotonic(), clock.perf_counter());
        os_sleep(Duration::from_millis(50));
        let (a1, b1, c1) = (clock.time(), clock.monotonic(), clock.perf_counter());
        assert!((a1 - a0).abs() < 1e-3);
        assert!((b1 - b0).abs() < 1e-3);
        assert!((c1 - c0).abs() < 1e-3);
    }

    #[test]
    fn resume_preserves_progress_without_counting_pause_time() {
        let clock = VirtualClock::new();
        let start = clock.monotonic();
        clock.pause();
        os_sleep(Duration::from_millis(100));
        clock.resume();
        os_sleep(Duration::from_millis(100));
        let end = clock.monotonic();
        assert!((end - start - 0.1).abs() < 0.02);
    }

    #[test]
    fn scale_halves_wall_time_for_a_given_sleep() {
        let clock = VirtualClock::new();
        clock.set_time_scale(2.0).unwrap();
        let wall_start = Instant::now();
        clock.sleep(0.1);
        let elapsed = wall_start.elapsed().as_secs_f64();
        assert!((elapsed - 0.05).abs() < 0.02, "elapsed={elapsed}");
    }

    #[test]
    fn round_trip_serialization_preserves_time() {
        let clock = VirtualClock::new();
        os_sleep(Duration::from_millis(10));
        let before = clock.time();
        let dict = clock.state_dict();

        let restored = VirtualClock::new();
        restored.load_state_dict(dict);
        let after = restored.time();
        assert!((after - before).abs() < 1e-3);
    }

    #[test]
    fn save_and_load_state_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.json");
        let clock = VirtualClock::new();
        clock.set_time_scale(1.5).unwrap();
        clock.save_state(&path).unwrap();

        let restored = VirtualClock::new();
        restored.load_state(&path).unwrap();
        assert_eq!(restored.time_scale(), 1.5);
    }

    #[test]
    fn rejects_non_positive_scale() {
        let clock = VirtualClock::new();
        assert!(clock.set_time_scale(0.0).is_err());
        assert!(clock.set_time_scale(-1.0).is_err());
    }

    #[test]
    fn sleep_returns_immediately_while_paused() {
        let clock = VirtualClock::new();
        clock.pause();
        let start = Instant::now();
        clock.sleep(5.0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}

/// Keeps a loop close to a target period by sleeping the residual against a
/// [`VirtualClock`].
pub struct IntervalAdjustor {
    clock: VirtualClock,
    interval: f64,
    time_to_wait: f64,
    last_reset: f64,
}

impl IntervalAdjustor {
    pub fn new(clock: VirtualClock, interval: f64, offset: f64) -> Self {
        let last_reset = f64::NEG_INFINITY;
        Self {
            clock,
            interval,
            time_to_wait: interval - offset,
            last_reset,
        }
    }

    /// Resets the start time of this adjustor to now.
    pub fn reset(&mut self) -> f64 {
        self.last_reset = self.clock.perf_counter();
        self.last_reset
    }

    /// Sleeps until `interval - offset` has elapsed since the last
    /// `reset`/`adjust` call, then re-arms. Returns the elapsed duration.
    /// Never sleeps a negative amount.
    pub fn adjust(&mut self) -> f64 {
        let remaining = (self.last_reset + self.time_to_wait) - self.clock.perf_counter();
        if remaining > 0.0 {
            self.clock.sleep(remaining);
        }
        let delta = self.clock.perf_counter() - self.last_reset;
        self.reset();
        delta
    }
}

#[cfg(test)]
mod interval_adjustor_tests {
    use super::*;

    #[test]
    fn adjust_does_not_sleep_negative_when_already_late() {
        let clock = VirtualClock::new();
        let mut adjustor = IntervalAdjustor::new(clock.clone(), 0.01, 0.0);
        adjustor.reset();
        clock.sleep(0.0); // no-op, just keep clock fresh
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        adjustor.adjust();
        assert!(start.elapsed() < Duration::from_millis(15));
    }

    #[test]
    fn adjust_waits_for_the_residual_of_the_interval() {
        let clock = VirtualClock::new();
        let mut adjustor = IntervalAdjustor::new(clock, 0.05, 0.0);
        adjustor.reset();
        let start = Instant::now();
        adjustor.adjust();
        let elapsed = start.elapsed().as_secs_f64();
        assert!((elapsed - 0.05).abs() < 0.02, "elapsed={elapsed}");
    }
}
