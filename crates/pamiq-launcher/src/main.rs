//! Thin binary entrypoint: parses [`Cli`], applies the optional file
//! overlay, and wires up a minimal loopback agent/environment/model/trainer
//! set so the whole system can be exercised end to end. Concrete sensors,
//! actuators, environment dynamics, and model internals are the caller's
//! domain; this pair exists only to prove the wiring.

use clap::Parser;
use pamiq_data::{DataUser, DataUsersDict};
use pamiq_interaction::{Agent, Environment};
use pamiq_models::{Infer, ModelState, TrainingModel, TrainingModelsDict};
use pamiq_state::PersistentState;
use pamiq_training::{Trainer, TrainersDict, TrainingContext};

/// Echoes back whatever it last observed; has no state worth persisting.
struct NullEnvironment {
    last: f64,
}

impl PersistentState for NullEnvironment {}

impl Environment for NullEnvironment {
    type Observation = f64;
    type Action = f64;

    fn observe(&mut self) -> f64 {
        self.last
    }

    fn affect(&mut self, action: f64) {
        self.last = action;
    }
}

/// Feeds the observation straight through an [`pamiq_models::InferenceModel`].
struct PassthroughAgent {
    model: std::sync::Arc<pamiq_models::InferenceModel<Scale>>,
}

impl PersistentState for PassthroughAgent {}

impl Agent for PassthroughAgent {
    type Observation = f64;
    type Action = f64;

    fn decide(&mut self, observation: f64) -> f64 {
        self.model.infer(observation)
    }
}

/// A single learnable scalar multiplier, the simplest shape that exercises
/// the full sync protocol (§4.9) without pulling in a numeric backend.
#[derive(Clone)]
struct Scale(f64);

impl Infer for Scale {
    type Input = f64;
    type Output = f64;
    fn infer(&self, input: f64) -> f64 {
        input * self.0
    }
}

impl ModelState for Scale {
    type GradState = ();
    fn set_eval_mode(&mut self) {}
    fn set_train_mode(&mut self) {}
    fn detach_grad(&mut self) {}
    fn reattach_grad(&mut self, _state: ()) {}
    fn copy_params_from(&mut self, source: &Self) {
        self.0 = source.0;
    }
}

/// Nudges the scale toward the mean of whatever it has collected, once it
/// has seen a handful of samples.
struct DriftTrainer;

impl Trainer<Scale, f64> for DriftTrainer {
    fn is_trainable(&self, data: &DataUsersDict<f64>) -> bool {
        data.get("observation").map(|user| user.len() >= 4).unwrap_or(false)
    }

    fn train(&mut self, ctx: &mut TrainingContext<'_, Scale, f64>) {
        let Some(user) = ctx.get_data_user("observation") else {
            return;
        };
        let samples = user.get_data();
        if samples.is_empty() {
            return;
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        if let Ok(model) = ctx.get_training_model("scale") {
            model.forward(mean);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = pamiq_launcher::Cli::parse().with_file_overlay()?;

    let training_scale = TrainingModel::with_inference(Scale(1.0), Scale(1.0), "scale");
    let mut models = TrainingModelsDict::new();
    models.register("scale", training_scale);
    let inference_model = models.inference_models_dict().get("scale")?;

    let agent = PassthroughAgent { model: inference_model };
    let environment = NullEnvironment { last: 0.0 };

    let mut trainers: TrainersDict<Scale, f64> = TrainersDict::new();
    trainers.register("drift", Box::new(DriftTrainer));

    let clock = pamiq_clock::VirtualClock::new();
    let mut data: DataUsersDict<f64> = DataUsersDict::new();
    data.register(
        "observation",
        DataUser::new(clock, Box::new(pamiq_buffers::SequentialBuffer::new(256))),
    );

    let exit_code = pamiq_launcher::run(cli, agent, environment, models, trainers, data)?;
    std::process::exit(exit_code.0);
}
