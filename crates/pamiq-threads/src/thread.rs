use std::time::Duration;

use tracing::{error, info, instrument};

use crate::controller::{ControllerCommandHandler, ReadOnlyController};
use crate::error::{Result, ThreadsError};
use crate::status::ThreadStatus;
use crate::types::ThreadType;

/// Delay between loop iterations, to avoid a busy loop when a worker has
/// nothing to do on a given tick.
pub const LOOP_DELAY: Duration = Duration::from_micros(1);

/// Common lifecycle for every worker thread. `run` drives
/// `on_start -> (on_tick)* -> on_end`, calling `on_exception` and always
/// `on_finally` the way a `finally` block would.
pub trait Thread: Send {
    fn thread_type(&self) -> ThreadType;

    fn is_running(&mut self) -> bool {
        true
    }

    fn on_start(&mut self) {}
    fn on_tick(&mut self) {}
    fn on_end(&mut self) {}
    fn on_exception(&mut self) {}
    fn on_finally(&mut self) {}

    #[instrument(skip(self), fields(thread = %self.thread_type()))]
    fn run(&mut self) {
        info!("starting thread");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.on_start();
            while self.is_running() {
                self.on_tick();
                std::thread::sleep(LOOP_DELAY);
            }
            self.on_end();
        }));
        if result.is_err() {
            error!("exception raised in thread");
            self.on_exception();
        }
        self.on_finally();
        info!("thread ended");
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }
}

/// Extends [`Thread`] with a [`ThreadStatus`] and a
/// [`ControllerCommandHandler`] wired in at construction. `THREAD_TYPE`
/// must not be [`ThreadType::Control`].
pub struct BackgroundThreadContext {
    pub thread_type: ThreadType,
    pub status: ThreadStatus,
    pub command_handler: ControllerCommandHandler,
    pub controller: ReadOnlyController,
}

impl BackgroundThreadContext {
    pub fn new(thread_type: ThreadType, controller: ReadOnlyController) -> Result<Self> {
        if matches!(thread_type, ThreadType::Control) {
            return Err(ThreadsError::ControlTypeOnBackgroundThread);
        }
        Ok(Self {
            thread_type,
            status: ThreadStatus::new(),
            command_handler: ControllerCommandHandler::new(controller.clone()),
            controller,
        })
    }

    /// Blocks while paused (setting/clearing the status latch and notifying
    /// the caller so it can propagate pause/resume to user code), then
    /// returns whether the system is still active.
    pub fn is_running(&self) -> bool {
        if self.controller.is_pause() {
            self.on_paused();
            self.command_handler.stop_if_pause();
            self.on_resumed();
        }
        self.controller.is_active()
    }

    pub fn is_paused(&self) -> bool {
        self.controller.is_pause()
    }

    pub fn on_paused(&self) {
        self.status.set_paused();
    }

    pub fn on_resumed(&self) {
        self.status.set_resumed();
    }

    pub fn on_exception(&self) {
        self.status.set_exception_raised();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ThreadController;

    struct Counter {
        thread_type: ThreadType,
        ticks: u32,
        max_ticks: u32,
        started: bool,
        ended: bool,
        finalized: bool,
    }

    impl Thread for Counter {
        fn thread_type(&self) -> ThreadType {
            self.thread_type
        }

        fn is_running(&mut self) -> bool {
            self.ticks < self.max_ticks
        }

        fn on_start(&mut self) {
            self.started = true;
        }

        fn on_tick(&mut self) {
            self.ticks += 1;
        }

        fn on_end(&mut self) {
            self.ended = true;
        }

        fn on_finally(&mut self) {
            self.finalized = true;
        }
    }

    #[test]
    fn run_drives_start_tick_end_finally_in_order() {
        let mut counter = Counter {
            thread_type: ThreadType::Inference,
            ticks: 0,
            max_ticks: 3,
            started: false,
            ended: false,
            finalized: false,
        };
        counter.run();
        assert!(counter.started);
        assert_eq!(counter.ticks, 3);
        assert!(counter.ended);
        assert!(counter.finalized);
    }

    #[test]
    fn background_context_rejects_control_type() {
        let c = ThreadController::new();
        let result = BackgroundThreadContext::new(ThreadType::Control, c.read_only());
        assert!(matches!(
            result,
            Err(ThreadsError::ControlTypeOnBackgroundThread)
        ));
    }

    #[test]
    fn background_context_manage_loop_reflects_controller() {
        let c = ThreadController::new();
        let ctx = BackgroundThreadContext::new(ThreadType::Training, c.read_only()).unwrap();
        assert!(ctx.is_running());
        c.shutdown();
        assert!(!ctx.is_running());
    }
}
