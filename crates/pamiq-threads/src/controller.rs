use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ThreadsError};
use crate::latch::Latch;

struct ControllerInner {
    resume_latch: Latch,
    shutdown_latch: Latch,
}

/// Single-writer broadcast of pause/resume/shutdown to every worker thread.
/// Created active and resumed. Only the control thread holds a
/// [`ThreadController`]; workers are handed a [`ReadOnlyController`].
#[derive(Clone)]
pub struct ThreadController {
    inner: Arc<ControllerInner>,
}

impl Default for ThreadController {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                resume_latch: Latch::new(true),
                shutdown_latch: Latch::new(false),
            }),
        }
    }

    pub fn pause(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(ThreadsError::AlreadyShutDown);
        }
        self.inner.resume_latch.clear();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(ThreadsError::AlreadyShutDown);
        }
        self.inner.resume_latch.set();
        Ok(())
    }

    /// Idempotent. Sets the resume latch first so anyone blocked in
    /// `wait_for_resume` wakes promptly.
    pub fn shutdown(&self) {
        if self.is_shutdown() {
            return;
        }
        self.inner.resume_latch.set();
        self.inner.shutdown_latch.set();
    }

    pub fn is_resume(&self) -> bool {
        self.inner.resume_latch.is_set()
    }

    pub fn is_pause(&self) -> bool {
        !self.is_resume()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown_latch.is_set()
    }

    pub fn is_active(&self) -> bool {
        !self.is_shutdown()
    }

    pub fn wait_for_resume(&self, timeout: Duration) -> bool {
        self.inner.resume_latch.wait(timeout)
    }

    /// A read-only view that cannot mutate controller state.
    pub fn read_only(&self) -> ReadOnlyController {
        ReadOnlyController {
            inner: self.inner.clone(),
        }
    }
}

/// Exposes only the predicates and `wait_for_resume`, handed to workers so
/// they cannot mutate the controller.
#[derive(Clone)]
pub struct ReadOnlyController {
    inner: Arc<ControllerInner>,
}

impl ReadOnlyController {
    pub fn is_resume(&self) -> bool {
        self.inner.resume_latch.is_set()
    }

    pub fn is_pause(&self) -> bool {
        !self.is_resume()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown_latch.is_set()
    }

    pub fn is_active(&self) -> bool {
        !self.is_shutdown()
    }

    pub fn wait_for_resume(&self, timeout: Duration) -> bool {
        self.inner.resume_latch.wait(timeout)
    }
}

/// Helper used from inside a worker's loop body to respect pause/shutdown
/// without touching the controller directly.
pub struct ControllerCommandHandler {
    controller: ReadOnlyController,
}

impl ControllerCommandHandler {
    pub fn new(controller: ReadOnlyController) -> Self {
        Self { controller }
    }

    /// Blocks while paused, returning once resumed or shut down.
    pub fn stop_if_pause(&self) {
        while !self.controller.wait_for_resume(Duration::from_secs(1)) {}
    }

    /// Blocks while paused, then returns whether the system is still
    /// active. Write worker loops as `while handler.manage_loop() { ... }`.
    pub fn manage_loop(&self) -> bool {
        self.stop_if_pause();
        self.controller.is_active()
    }
}
