use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A boolean flag with blocking wait, used for the controller's
/// resume/shutdown signals and each worker's paused/exception status.
///
/// Single-writer, many-reader: only the owner calls `set`/`clear`.
pub(crate) struct Latch {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new(initial: bool) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut guard = self.state.lock();
        if !*guard {
            *guard = true;
        }
        self.cond.notify_all();
    }

    pub(crate) fn clear(&self) {
        *self.state.lock() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Returns true if the latch is (or becomes) set within `timeout`.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.state.lock();
        while !*guard {
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(d) if d > Duration::ZERO => d,
                _ => return *guard,
            };
            self.cond.wait_for(&mut guard, remaining);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_true_immediately_if_already_set() {
        let latch = Latch::new(true);
        assert!(latch.wait(Duration::from_millis(1)));
    }

    #[test]
    fn wait_times_out_if_never_set() {
        let latch = Latch::new(false);
        assert!(!latch.wait(Duration::from_millis(20)));
    }

    #[test]
    fn wait_wakes_up_when_set_from_another_thread() {
        let latch = Arc::new(Latch::new(false));
        let other = latch.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            other.set();
        });
        assert!(latch.wait(Duration::from_secs(1)));
    }
}
