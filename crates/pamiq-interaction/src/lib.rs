//! The agent/environment interaction loop, driven once per tick from the
//! inference thread.

use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use pamiq_clock::{IntervalAdjustor, VirtualClock};
use pamiq_state::PersistentState;
use pamiq_threads::{BackgroundThreadContext, Thread, ThreadController, ThreadType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InteractionError {
    #[error(transparent)]
    Threads(#[from] pamiq_threads::ThreadsError),
}

pub type Result<T> = std::result::Result<T, InteractionError>;

/// Reads an observation from the environment, or `None` once nothing is
/// available yet (e.g. before the environment has produced its first
/// frame).
pub trait Environment: PersistentState {
    type Observation;
    type Action;

    fn observe(&mut self) -> Self::Observation;
    fn affect(&mut self, action: Self::Action);

    fn setup(&mut self) {}
    fn teardown(&mut self) {}
    fn on_paused(&mut self) {}
    fn on_resumed(&mut self) {}
}

/// Maps an observation to an action, typically by calling through to an
/// [`pamiq_models::InferenceModel`].
pub trait Agent: PersistentState {
    type Observation;
    type Action;

    fn decide(&mut self, observation: Self::Observation) -> Self::Action;

    fn setup(&mut self) {}
    fn teardown(&mut self) {}
    fn on_paused(&mut self) {}
    fn on_resumed(&mut self) {}
}

/// Holds one agent and one environment. `step` is: observe, decide, affect.
/// `save_state`/`load_state` fan out to `agent/` and `environment/`
/// subdirectories; `on_paused`/`on_resumed` propagate to both.
pub struct Interaction<A, E>
where
    A: Agent,
    E: Environment<Observation = A::Observation, Action = A::Action>,
{
    agent: A,
    environment: E,
}

impl<A, E> Interaction<A, E>
where
    A: Agent,
    E: Environment<Observation = A::Observation, Action = A::Action>,
{
    pub fn new(agent: A, environment: E) -> Self {
        Self { agent, environment }
    }

    pub fn setup(&mut self) {
        self.agent.setup();
        self.environment.setup();
    }

    pub fn teardown(&mut self) {
        self.agent.teardown();
        self.environment.teardown();
    }

    pub fn step(&mut self) {
        let observation = self.environment.observe();
        let action = self.agent.decide(observation);
        self.environment.affect(action);
    }

    pub fn on_paused(&mut self) {
        self.agent.on_paused();
        self.environment.on_paused();
    }

    pub fn on_resumed(&mut self) {
        self.agent.on_resumed();
        self.environment.on_resumed();
    }
}

impl<A, E> PersistentState for Interaction<A, E>
where
    A: Agent,
    E: Environment<Observation = A::Observation, Action = A::Action>,
{
    fn save_state(&mut self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path.join("agent"))?;
        std::fs::create_dir_all(path.join("environment"))?;
        self.agent.save_state(&path.join("agent"))?;
        self.environment.save_state(&path.join("environment"))?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> io::Result<()> {
        self.agent.load_state(&path.join("agent"))?;
        self.environment.load_state(&path.join("environment"))?;
        Ok(())
    }
}

/// Tracks a running mean and (population) standard deviation of per-tick
/// durations, logged periodically by the inference thread.
#[derive(Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn record(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn stdev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

/// Drives an [`Interaction`] on the inference thread: `interaction.step()`
/// every tick, optionally paced by a fixed-cadence [`IntervalAdjustor`], with
/// periodic mean/stdev logging of tick duration.
pub struct InferenceThread<A, E>
where
    A: Agent,
    E: Environment<Observation = A::Observation, Action = A::Action>,
{
    interaction: Arc<Mutex<Interaction<A, E>>>,
    clock: VirtualClock,
    adjustor: Option<IntervalAdjustor>,
    stats: RunningStats,
    stats_log_interval_ticks: u64,
    context: BackgroundThreadContext,
}

impl<A, E> InferenceThread<A, E>
where
    A: Agent,
    E: Environment<Observation = A::Observation, Action = A::Action>,
{
    /// Takes the interaction behind an `Arc<Mutex<_>>` (rather than owning
    /// it outright) so a launcher can register the same instance with a
    /// [`pamiq_state::StateStore`] for save/load without reaching into a
    /// thread it has handed off to a worker.
    pub fn new(
        interaction: Arc<Mutex<Interaction<A, E>>>,
        clock: VirtualClock,
        adjustor: Option<IntervalAdjustor>,
        controller: ThreadController,
    ) -> Result<Self> {
        let context = BackgroundThreadContext::new(ThreadType::Inference, controller.read_only())?;
        Ok(Self {
            interaction,
            clock,
            adjustor,
            stats: RunningStats::default(),
            stats_log_interval_ticks: 1000,
            context,
        })
    }

    /// A read-only view of this thread's paused/exception latches, for a
    /// launcher to fold into a [`pamiq_threads::ThreadStatusesMonitor`].
    pub fn status(&self) -> pamiq_threads::ReadOnlyThreadStatus {
        self.context.status.read_only()
    }

    fn tick(&mut self) {
        let start = self.clock.perf_counter();
        self.interaction.lock().step();
        let duration = self.clock.perf_counter() - start;
        self.stats.record(duration);
        if self.stats.count % self.stats_log_interval_ticks == 0 {
            tracing::info!(
                mean_secs = self.stats.mean,
                stdev_secs = self.stats.stdev(),
                "inference tick stats"
            );
        }
        if let Some(adjustor) = &mut self.adjustor {
            adjustor.adjust();
        }
    }
}

impl<A, E> Thread for InferenceThread<A, E>
where
    A: Agent,
    E: Environment<Observation = A::Observation, Action = A::Action>,
{
    fn thread_type(&self) -> ThreadType {
        ThreadType::Inference
    }

    fn is_running(&mut self) -> bool {
        let was_paused = self.context.is_paused();
        if was_paused {
            self.interaction.lock().on_paused();
        }
        let active = self.context.is_running();
        if was_paused && active {
            self.interaction.lock().on_resumed();
        }
        active
    }

    fn on_start(&mut self) {
        self.interaction.lock().setup();
        if let Some(adjustor) = &mut self.adjustor {
            adjustor.reset();
        }
    }

    fn on_tick(&mut self) {
        self.tick();
    }

    fn on_exception(&mut self) {
        self.context.on_exception();
    }

    fn on_finally(&mut self) {
        self.interaction.lock().teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        last: i32,
    }
    impl PersistentState for Echo {}
    impl Environment for Echo {
        type Observation = i32;
        type Action = i32;
        fn observe(&mut self) -> i32 {
            self.last
        }
        fn affect(&mut self, action: i32) {
            self.last = action;
        }
    }

    struct Increment;
    impl PersistentState for Increment {}
    impl Agent for Increment {
        type Observation = i32;
        type Action = i32;
        fn decide(&mut self, observation: i32) -> i32 {
            observation + 1
        }
    }

    #[test]
    fn step_reads_observation_and_applies_the_agents_action() {
        let mut interaction = Interaction::new(Increment, Echo { last: 0 });
        interaction.step();
        interaction.step();
        interaction.step();
        assert_eq!(interaction.environment.last, 3);
    }

    #[test]
    fn save_and_load_state_delegate_to_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let mut interaction = Interaction::new(Increment, Echo { last: 7 });
        interaction.save_state(dir.path()).unwrap();
        assert!(dir.path().join("agent").is_dir());
        assert!(dir.path().join("environment").is_dir());
    }

    #[test]
    fn running_stats_reports_zero_stdev_for_a_single_sample() {
        let mut stats = RunningStats::default();
        stats.record(1.0);
        assert_eq!(stats.stdev(), 0.0);
        stats.record(3.0);
        assert!(stats.stdev() > 0.0);
    }
}
