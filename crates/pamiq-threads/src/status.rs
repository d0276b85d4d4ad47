use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::latch::Latch;
use crate::types::ThreadType;

struct StatusInner {
    paused: Latch,
    exception: Latch,
}

/// A single worker's `paused`/`exception` latches. Only the owning worker
/// writes to this; the monitor and anyone else only reads.
#[derive(Clone)]
pub struct ThreadStatus {
    inner: Arc<StatusInner>,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                paused: Latch::new(false),
                exception: Latch::new(false),
            }),
        }
    }

    pub fn set_paused(&self) {
        self.inner.paused.set();
    }

    pub fn set_resumed(&self) {
        self.inner.paused.clear();
    }

    pub fn set_exception_raised(&self) {
        self.inner.exception.set();
    }

    pub fn read_only(&self) -> ReadOnlyThreadStatus {
        ReadOnlyThreadStatus {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ReadOnlyThreadStatus {
    inner: Arc<StatusInner>,
}

impl ReadOnlyThreadStatus {
    pub fn is_pause(&self) -> bool {
        self.inner.paused.is_set()
    }

    pub fn is_resume(&self) -> bool {
        !self.is_pause()
    }

    pub fn is_exception_raised(&self) -> bool {
        self.inner.exception.is_set()
    }

    pub fn wait_for_pause(&self, timeout: Duration) -> bool {
        self.inner.paused.wait(timeout)
    }
}

/// Holds a `{thread type -> status}` map and derives systemwide predicates
/// from it.
#[derive(Clone)]
pub struct ThreadStatusesMonitor {
    statuses: HashMap<ThreadType, ReadOnlyThreadStatus>,
}

impl ThreadStatusesMonitor {
    pub fn new(statuses: HashMap<ThreadType, ReadOnlyThreadStatus>) -> Self {
        Self { statuses }
    }

    /// Waits on every status in parallel with the same timeout. Returns
    /// true only if all of them paused within it. An empty map is
    /// vacuously true.
    pub fn wait_for_all_threads_pause(&self, timeout: Duration) -> bool {
        if self.statuses.is_empty() {
            return true;
        }
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .statuses
                .values()
                .map(|status| scope.spawn(move || status.wait_for_pause(timeout)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(false))
                .all(|ok| ok)
        })
    }

    pub fn any_thread_paused(&self) -> bool {
        self.statuses.values().any(|s| s.is_pause())
    }

    pub fn all_threads_paused(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.values().all(|s| s.is_pause())
    }

    pub fn check_exception_raised(&self) -> bool {
        self.statuses.values().any(|s| s.is_exception_raised())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_for_all_threads_pause_is_true_when_map_empty() {
        let monitor = ThreadStatusesMonitor::new(HashMap::new());
        assert!(monitor.wait_for_all_threads_pause(Duration::from_millis(1)));
    }

    #[test]
    fn wait_for_all_threads_pause_waits_on_every_status_concurrently() {
        let a = ThreadStatus::new();
        let b = ThreadStatus::new();
        let mut map = HashMap::new();
        map.insert(ThreadType::Inference, a.read_only());
        map.insert(ThreadType::Training, b.read_only());
        let monitor = ThreadStatusesMonitor::new(map);

        let a2 = a.clone();
        let b2 = b.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            a2.set_paused();
            thread::sleep(Duration::from_millis(10));
            b2.set_paused();
        });

        let start = std::time::Instant::now();
        assert!(monitor.wait_for_all_threads_pause(Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn wait_for_all_threads_pause_false_on_timeout() {
        let a = ThreadStatus::new();
        let mut map = HashMap::new();
        map.insert(ThreadType::Inference, a.read_only());
        let monitor = ThreadStatusesMonitor::new(map);
        assert!(!monitor.wait_for_all_threads_pause(Duration::from_millis(20)));
    }

    #[test]
    fn check_exception_raised_true_if_any_status_has_it() {
        let a = ThreadStatus::new();
        let b = ThreadStatus::new();
        let mut map = HashMap::new();
        map.insert(ThreadType::Inference, a.read_only());
        map.insert(ThreadType::Training, b.read_only());
        let monitor = ThreadStatusesMonitor::new(map);
        assert!(!monitor.check_exception_raised());
        b.set_exception_raised();
        assert!(monitor.check_exception_raised());
    }
}
