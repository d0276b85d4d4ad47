//! The control thread: the sole writer of the [`pamiq_threads::ThreadController`]
//! and the virtual clock's pause/resume state, plus the bounded command queue
//! and status derivation the HTTP control plane reads and writes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pamiq_clock::VirtualClock;
use pamiq_state::StateStore;
use pamiq_threads::{
    Thread, ThreadController, ThreadStatusesMonitor, ThreadType, TimeIntervalScheduler,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Threads(#[from] pamiq_threads::ThreadsError),
    #[error(transparent)]
    State(#[from] pamiq_state::StateError),
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// A command accepted from the HTTP control plane and applied on the
/// control thread's next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Shutdown,
    SaveCheckpoint,
}

/// A single bounded FIFO of [`ControlCommand`]s, shared between the HTTP
/// handlers (which push, never blocking) and the control thread (which
/// drains once per tick). Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<Mutex<VecDeque<ControlCommand>>>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Non-blocking. Returns `false` if the queue is already at capacity.
    pub fn try_push(&self, command: ControlCommand) -> bool {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(command);
        true
    }

    /// Removes and returns every queued command, oldest first.
    pub fn drain(&self) -> Vec<ControlCommand> {
        self.inner.lock().drain(..).collect()
    }
}

/// The single label exposed over the HTTP control plane, derived fresh on
/// every read from controller and monitor state rather than tracked as its
/// own piece of mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    Active,
    Pausing,
    Paused,
    Resuming,
    ShuttingDown,
}

impl SystemStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SystemStatus::Active => "ACTIVE",
            SystemStatus::Pausing => "PAUSING",
            SystemStatus::Paused => "PAUSED",
            SystemStatus::Resuming => "RESUMING",
            SystemStatus::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Derives [`SystemStatus`] from controller and monitor state. Cheap to
/// clone; handed to the HTTP control plane so status reads never touch the
/// control thread directly.
#[derive(Clone)]
pub struct SystemStatusProvider {
    controller: pamiq_threads::ReadOnlyController,
    monitor: ThreadStatusesMonitor,
}

impl SystemStatusProvider {
    pub fn new(controller: pamiq_threads::ReadOnlyController, monitor: ThreadStatusesMonitor) -> Self {
        Self { controller, monitor }
    }

    pub fn status(&self) -> SystemStatus {
        if self.controller.is_shutdown() {
            return SystemStatus::ShuttingDown;
        }
        if self.controller.is_pause() {
            return if self.monitor.all_threads_paused() {
                SystemStatus::Paused
            } else {
                SystemStatus::Pausing
            };
        }
        if self.controller.is_resume() && self.monitor.any_thread_paused() {
            return SystemStatus::Resuming;
        }
        SystemStatus::Active
    }
}

/// A running HTTP control plane, started from [`ControlThread::on_start`]
/// and torn down from `on_finally`. Implemented by `pamiq-http`; kept as a
/// trait here so this crate never depends on an HTTP framework.
pub trait ControlPlaneServer: Send {
    fn shutdown(&mut self);
}

type ServerFactory<S> = Box<dyn FnOnce(SystemStatusProvider, CommandQueue) -> S + Send>;

/// Configuration for a [`ControlThread`], mirroring the fields the original
/// control loop carries: scheduling intervals, pause retry budget, and the
/// command queue capacity the HTTP control plane is built with.
pub struct ControlThreadConfig {
    pub save_state_interval: Option<f64>,
    pub max_uptime: Option<f64>,
    pub max_pause_attempts: u32,
    pub pause_attempt_timeout: Duration,
    pub command_queue_capacity: usize,
}

impl Default for ControlThreadConfig {
    fn default() -> Self {
        Self {
            save_state_interval: None,
            max_uptime: None,
            max_pause_attempts: 3,
            pause_attempt_timeout: Duration::from_secs(5),
            command_queue_capacity: 1,
        }
    }
}

/// Owns the writable [`ThreadController`] and the virtual clock's
/// pause/resume; every other thread only ever sees read-only views of both.
pub struct ControlThread<S: ControlPlaneServer> {
    controller: ThreadController,
    monitor: ThreadStatusesMonitor,
    clock: VirtualClock,
    queue: CommandQueue,
    state_store: StateStore,
    config: ControlThreadConfig,
    system_start_time: f64,
    running: bool,
    save_scheduler: Option<TimeIntervalScheduler>,
    server_factory: Option<ServerFactory<S>>,
    server: Option<S>,
}

impl<S: ControlPlaneServer> ControlThread<S> {
    pub fn new(
        controller: ThreadController,
        monitor: ThreadStatusesMonitor,
        clock: VirtualClock,
        state_store: StateStore,
        config: ControlThreadConfig,
        spawn_server: impl FnOnce(SystemStatusProvider, CommandQueue) -> S + Send + 'static,
    ) -> Self {
        let queue = CommandQueue::new(config.command_queue_capacity);
        Self {
            controller,
            monitor,
            clock,
            queue,
            state_store,
            config,
            system_start_time: 0.0,
            running: true,
            save_scheduler: None,
            server_factory: Some(Box::new(spawn_server)),
            server: None,
        }
    }

    pub fn command_queue(&self) -> CommandQueue {
        self.queue.clone()
    }

    pub fn status_provider(&self) -> SystemStatusProvider {
        SystemStatusProvider::new(self.controller.read_only(), self.monitor.clone())
    }

    fn on_paused(&mut self) {
        self.clock.pause();
    }

    fn on_resumed(&mut self) {
        self.clock.resume();
    }

    /// If already paused, returns `true` immediately. Otherwise pauses the
    /// controller and waits for every worker to report paused, retrying up
    /// to `max_pause_attempts` times on timeout before giving up. Failure
    /// is logged, not fatal.
    pub fn try_pause(&mut self) -> bool {
        if self.controller.is_pause() {
            return true;
        }
        for attempt in 0..self.config.max_pause_attempts {
            if self.controller.pause().is_err() {
                return false;
            }
            if self
                .monitor
                .wait_for_all_threads_pause(self.config.pause_attempt_timeout)
            {
                self.on_paused();
                return true;
            }
            tracing::warn!(attempt, "not all threads paused in time, retrying");
            let _ = self.controller.resume();
        }
        false
    }

    pub fn resume(&mut self) -> Result<()> {
        self.on_resumed();
        self.controller.resume()?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.controller.shutdown();
        self.running = false;
    }

    /// Pauses (if not already), writes a checkpoint via the state store,
    /// then resumes if this call is the one that paused. Aborts without
    /// writing if pausing fails.
    #[tracing::instrument(skip(self))]
    pub fn save_state(&mut self) -> Result<()> {
        let was_paused = self.controller.is_pause();
        if !self.try_pause() {
            tracing::warn!("aborting save-state: could not pause all threads in time");
            return Ok(());
        }
        let result = self.state_store.save_state();
        if !was_paused {
            self.resume()?;
        }
        result?;
        Ok(())
    }

    fn apply(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Pause => {
                self.try_pause();
                true
            }
            ControlCommand::Resume => {
                let _ = self.resume();
                true
            }
            ControlCommand::Shutdown => {
                self.shutdown();
                false
            }
            ControlCommand::SaveCheckpoint => {
                let _ = self.save_state();
                true
            }
        }
    }
}

impl<S: ControlPlaneServer> Thread for ControlThread<S> {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Control
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn on_start(&mut self) {
        self.system_start_time = self.clock.time();
        if let Some(interval) = self.config.save_state_interval {
            self.save_scheduler = TimeIntervalScheduler::new(self.clock.clone(), interval).ok();
        }
        if let Some(factory) = self.server_factory.take() {
            self.server = Some(factory(self.status_provider(), self.queue.clone()));
        }
    }

    fn on_tick(&mut self) {
        if let Some(scheduler) = &mut self.save_scheduler {
            let mut should_save = false;
            scheduler.tick(|| should_save = true);
            if should_save {
                if let Err(error) = self.save_state() {
                    tracing::error!(%error, "scheduled save-state failed");
                }
            }
        }

        for command in self.queue.drain() {
            if !self.apply(command) {
                break;
            }
        }

        if self.monitor.check_exception_raised() {
            tracing::error!("worker raised an exception, shutting down");
            self.shutdown();
        }

        if let Some(max_uptime) = self.config.max_uptime {
            if self.clock.time() - self.system_start_time > max_uptime {
                tracing::info!("max uptime exceeded, shutting down");
                self.shutdown();
            }
        }
    }

    fn on_finally(&mut self) {
        self.shutdown();
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
    }
}
