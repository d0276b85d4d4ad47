//! Round-robin trainer scheduling, driven from the training thread.
//!
//! A [`Trainer`] is user code; [`TrainersDict`] cycles through registered
//! trainers, running the first trainable one found each tick and syncing
//! whichever models it touched.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use pamiq_data::DataUsersDict;
use pamiq_models::{ModelState, TrainingModel, TrainingModelsDict};
use pamiq_threads::{BackgroundThreadContext, Thread, ThreadController, ThreadType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Threads(#[from] pamiq_threads::ThreadsError),
}

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Borrowed access a trainer's `train` call uses to reach named models and
/// data users, recording which model names it touched so they can be synced
/// afterward.
pub struct TrainingContext<'a, M, T> {
    models: &'a TrainingModelsDict<M>,
    data: &'a DataUsersDict<T>,
    retrieved: &'a mut HashSet<String>,
}

impl<'a, M: ModelState, T: Send + 'static> TrainingContext<'a, M, T> {
    /// Looks up a training model by name and marks it to be synced after
    /// this trainer's `train` call returns.
    pub fn get_training_model(&mut self, name: &str) -> pamiq_models::Result<&'a TrainingModel<M>> {
        let model = self.models.get(name)?;
        self.retrieved.insert(name.to_string());
        Ok(model)
    }

    pub fn get_data_user(&self, name: &str) -> Option<&'a pamiq_data::DataUser<T>> {
        self.data.get(name)
    }
}

/// User-implemented training procedure.
///
/// `is_trainable` takes the data dict explicitly (rather than a name the
/// trainer stashed during attachment) because Rust ownership doesn't let a
/// trainer hold a live alias into a dict it doesn't own between calls; this
/// still supports gating on buffer size or recent-sample count.
pub trait Trainer<M: ModelState, T: Send + 'static>: Send {
    fn on_training_models_attached(&mut self, _models: &TrainingModelsDict<M>) {}
    fn on_data_users_attached(&mut self, _data: &DataUsersDict<T>) {}

    fn is_trainable(&self, _data: &DataUsersDict<T>) -> bool {
        true
    }

    fn setup(&mut self) {}
    fn train(&mut self, ctx: &mut TrainingContext<'_, M, T>);
    fn teardown(&mut self) {}
}

struct TrainerEntry<M, T> {
    trainer: Box<dyn Trainer<M, T>>,
    retrieved_model_names: HashSet<String>,
}

/// Ordered collection of trainers with a rotating cursor. `get_trainable`
/// advances the cursor by one before each check (advance-then-return), so a
/// trainer just handed out is not immediately reconsidered.
pub struct TrainersDict<M, T> {
    order: Vec<String>,
    entries: HashMap<String, TrainerEntry<M, T>>,
    cursor: usize,
}

impl<M: ModelState, T: Send + 'static> TrainersDict<M, T> {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, trainer: Box<dyn Trainer<M, T>>) {
        let name = name.into();
        self.order.push(name.clone());
        self.entries.insert(
            name,
            TrainerEntry {
                trainer,
                retrieved_model_names: HashSet::new(),
            },
        );
    }

    pub fn attach_training_models_dict(&mut self, models: &TrainingModelsDict<M>) {
        for entry in self.entries.values_mut() {
            entry.trainer.on_training_models_attached(models);
        }
    }

    pub fn attach_data_users_dict(&mut self, data: &DataUsersDict<T>) {
        for entry in self.entries.values_mut() {
            entry.trainer.on_data_users_attached(data);
        }
    }

    pub fn setup_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.trainer.setup();
        }
    }

    pub fn teardown_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.trainer.teardown();
        }
    }

    /// Scans starting past the cursor for the first trainable trainer, runs
    /// its `train`, then syncs every training model retrieved during that
    /// call. Returns whether a trainer ran. A full rotation with none
    /// trainable returns `false`.
    #[tracing::instrument(skip_all)]
    pub fn run_trainable_once(&mut self, models: &TrainingModelsDict<M>, data: &DataUsersDict<T>) -> bool
    where
        M: Clone,
    {
        let n = self.order.len();
        if n == 0 {
            return false;
        }
        for _ in 0..n {
            self.cursor = (self.cursor + 1) % n;
            let name = self.order[self.cursor].clone();
            let entry = self.entries.get_mut(&name).expect("order and entries stay in sync");
            entry.retrieved_model_names.clear();
            if !entry.trainer.is_trainable(data) {
                continue;
            }
            {
                let mut ctx = TrainingContext {
                    models,
                    data,
                    retrieved: &mut entry.retrieved_model_names,
                };
                entry.trainer.train(&mut ctx);
            }
            for retrieved_name in &entry.retrieved_model_names {
                if let Ok(model) = models.get(retrieved_name) {
                    model.sync();
                }
            }
            return true;
        }
        false
    }
}

impl<M: ModelState, T: Send + 'static> Default for TrainersDict<M, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A `BackgroundThread` of type `TRAINING`: attaches models and data users
/// at start, then each tick drains data, runs one trainable trainer (if
/// any), and syncs the models it touched.
pub struct TrainingThread<M, T> {
    trainers: TrainersDict<M, T>,
    models: TrainingModelsDict<M>,
    data: DataUsersDict<T>,
    context: BackgroundThreadContext,
}

impl<M: ModelState, T: Send + 'static> TrainingThread<M, T> {
    pub fn new(
        trainers: TrainersDict<M, T>,
        models: TrainingModelsDict<M>,
        data: DataUsersDict<T>,
        controller: ThreadController,
    ) -> Result<Self> {
        let context = BackgroundThreadContext::new(ThreadType::Training, controller.read_only())?;
        Ok(Self {
            trainers,
            models,
            data,
            context,
        })
    }

    /// A read-only view of this thread's paused/exception latches, for a
    /// launcher to fold into a [`pamiq_threads::ThreadStatusesMonitor`].
    pub fn status(&self) -> pamiq_threads::ReadOnlyThreadStatus {
        self.context.status.read_only()
    }
}

impl<M: ModelState + Clone + Sync, T: Send + 'static> Thread for TrainingThread<M, T> {
    fn thread_type(&self) -> ThreadType {
        ThreadType::Training
    }

    fn is_running(&mut self) -> bool {
        self.context.is_running()
    }

    fn on_start(&mut self) {
        self.trainers.attach_training_models_dict(&self.models);
        self.trainers.attach_data_users_dict(&self.data);
        self.trainers.setup_all();
    }

    fn on_tick(&mut self) {
        self.data.update_all();
        if !self.trainers.run_trainable_once(&self.models, &self.data) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn on_exception(&mut self) {
        self.context.on_exception();
    }

    fn on_finally(&mut self) {
        self.trainers.teardown_all();
    }
}
