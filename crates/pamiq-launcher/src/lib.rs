//! Wires a virtual clock, the three worker threads, the data/model dicts,
//! and the HTTP control plane into one running system.
//!
//! [`run`] is generic over the caller's `Agent`, `Environment`, model, and
//! data types — this crate never picks concrete ones; the binary's `main`
//! supplies a minimal pair only to prove the wiring end to end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use pamiq_clock::VirtualClock;
use pamiq_control::{ControlThread, ControlThreadConfig};
use pamiq_data::DataUsersDict;
use pamiq_interaction::{Agent, Environment, InferenceThread, Interaction};
use pamiq_models::{ModelState, TrainingModelsDict};
use pamiq_state::{PersistentState, RetentionKeeper, StateStore};
use pamiq_threads::{Thread, ThreadController, ThreadStatusesMonitor, ThreadType};
use pamiq_training::{TrainersDict, TrainingThread};
use serde::Deserialize;

/// Command-line flags and environment variables for the `pamiq` binary.
/// Any of these may also be set via `--config`; explicit flags and env
/// vars always win over the file.
#[derive(Parser, Debug, Clone)]
#[command(name = "pamiq", about = "Runs a pamiq agent/environment loop", version)]
pub struct Cli {
    /// Address the HTTP control plane binds to.
    #[arg(long, env = "PAMIQ_BIND_ADDR", default_value = "127.0.0.1:8391")]
    pub bind_addr: SocketAddr,

    /// Directory checkpoints are written under.
    #[arg(long, env = "PAMIQ_STATES_DIR", default_value = "./states")]
    pub states_dir: PathBuf,

    /// Number of most recent checkpoints to retain. Unset disables the
    /// retention keeper entirely.
    #[arg(long, env = "PAMIQ_MAX_KEEP_STATES")]
    pub max_keep_states: Option<usize>,

    /// Seconds between automatic checkpoints. Unset disables periodic saving.
    #[arg(long, env = "PAMIQ_SAVE_STATE_INTERVAL")]
    pub save_state_interval: Option<f64>,

    /// Seconds after which the system shuts itself down. Unset runs forever.
    #[arg(long, env = "PAMIQ_MAX_UPTIME")]
    pub max_uptime: Option<f64>,

    /// Bounded capacity of the HTTP command queue.
    #[arg(long, env = "PAMIQ_COMMAND_QUEUE_CAPACITY", default_value_t = 1)]
    pub command_queue_capacity: usize,

    /// Optional TOML file overlaying the flags above.
    #[arg(long, env = "PAMIQ_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Mirrors [`Cli`]'s optional fields for the TOML overlay. A value present
/// here only takes effect where the corresponding CLI field is still at
/// its built-in default (Option fields are applied whenever the CLI left
/// them unset).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub states_dir: Option<PathBuf>,
    pub max_keep_states: Option<usize>,
    /// Human-readable duration ("30s", "5m"), same config style as
    /// `knhk-autonomous-loop`'s `AutonomousLoopConfig` (`config.rs`).
    #[serde(default, with = "humantime_serde::option")]
    pub save_state_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub max_uptime: Option<Duration>,
    pub command_queue_capacity: Option<usize>,
}

impl Cli {
    pub fn with_file_overlay(mut self) -> anyhow::Result<Self> {
        let Some(path) = self.config.clone() else {
            return Ok(self);
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let file: FileConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;

        if self.bind_addr == default_bind_addr() {
            if let Some(v) = file.bind_addr {
                self.bind_addr = v;
            }
        }
        if self.states_dir == default_states_dir() {
            if let Some(v) = file.states_dir {
                self.states_dir = v;
            }
        }
        if self.command_queue_capacity == 1 {
            if let Some(v) = file.command_queue_capacity {
                self.command_queue_capacity = v;
            }
        }
        self.max_keep_states = self.max_keep_states.or(file.max_keep_states);
        self.save_state_interval = self
            .save_state_interval
            .or(file.save_state_interval.map(|d| d.as_secs_f64()));
        self.max_uptime = self.max_uptime.or(file.max_uptime.map(|d| d.as_secs_f64()));
        Ok(self)
    }
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:8391".parse().expect("valid default address")
}

fn default_states_dir() -> PathBuf {
    PathBuf::from("./states")
}

/// How the process should exit: cleanly (`0`), or non-zero because a
/// worker raised an exception before shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

/// Spawns the inference and training threads, the optional retention
/// keeper, and drives the control thread (which owns the HTTP control
/// plane) on the calling thread until shutdown. Blocks until the system
/// shuts down, then joins every worker.
pub fn run<A, E, M, T>(
    cli: Cli,
    agent: A,
    environment: E,
    models: TrainingModelsDict<M>,
    trainers: TrainersDict<M, T>,
    data: DataUsersDict<T>,
) -> anyhow::Result<ExitCode>
where
    A: Agent + 'static,
    E: Environment<Observation = A::Observation, Action = A::Action> + 'static,
    M: ModelState + Clone + Sync + 'static,
    T: Send + 'static,
{
    let clock = VirtualClock::new();
    let controller = ThreadController::new();

    let interaction = Arc::new(Mutex::new(Interaction::new(agent, environment)));
    let mut inference_thread =
        InferenceThread::new(interaction.clone(), clock.clone(), None, controller.clone())?;
    let mut training_thread = TrainingThread::new(trainers, models, data, controller.clone())?;

    let mut statuses = HashMap::new();
    statuses.insert(ThreadType::Inference, inference_thread.status());
    statuses.insert(ThreadType::Training, training_thread.status());
    let monitor = ThreadStatusesMonitor::new(statuses);

    let state_store = {
        let mut store = StateStore::new(&cli.states_dir)?;
        let interaction: Arc<Mutex<dyn PersistentState>> = interaction;
        store.register("interaction", interaction)?;
        store
    };

    let retention_controller = controller.read_only();
    let retention_handle = cli.max_keep_states.map(|max_keep| {
        let keeper = RetentionKeeper::new(cli.states_dir.clone(), max_keep, retention_controller);
        std::thread::spawn(move || keeper.run())
    });

    let inference_handle = std::thread::spawn(move || inference_thread.run());
    let training_handle = std::thread::spawn(move || training_thread.run());

    let signal_controller = controller.clone();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building a single-threaded tokio runtime for signal handling");
        runtime.block_on(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received interrupt signal, shutting down");
                signal_controller.shutdown();
            }
        });
    });

    let control_config = ControlThreadConfig {
        save_state_interval: cli.save_state_interval,
        max_uptime: cli.max_uptime,
        max_pause_attempts: 3,
        pause_attempt_timeout: Duration::from_secs(5),
        command_queue_capacity: cli.command_queue_capacity,
    };
    let bind_addr = cli.bind_addr;
    let mut control_thread = ControlThread::new(
        controller,
        monitor.clone(),
        clock,
        state_store,
        control_config,
        move |status, queue| pamiq_http::spawn(bind_addr, status, queue),
    );
    control_thread.run();

    let _ = inference_handle.join();
    let _ = training_handle.join();
    if let Some(handle) = retention_handle {
        let _ = handle.join();
    }

    let exit_code = if monitor.check_exception_raised() { 1 } else { 0 };
    Ok(ExitCode(exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overlay_only_fills_fields_left_at_their_default() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pamiq.toml");
        std::fs::write(&config_path, "max-uptime = \"120s\"\nbind-addr = \"0.0.0.0:9000\"\n").unwrap();

        let cli = Cli {
            bind_addr: default_bind_addr(),
            states_dir: default_states_dir(),
            max_keep_states: None,
            save_state_interval: None,
            max_uptime: Some(30.0),
            command_queue_capacity: 1,
            config: Some(config_path),
        };
        let merged = cli.with_file_overlay().unwrap();

        // Explicit CLI value wins over the file.
        assert_eq!(merged.max_uptime, Some(30.0));
        // Field left at its default is filled from the file.
        assert_eq!(merged.bind_addr, "0.0.0.0:9000".parse().unwrap());
    }
}
