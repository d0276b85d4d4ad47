//! Training/inference model pairs. A [`TrainingModel`] owns the instance the
//! training thread mutates; it optionally publishes an [`InferenceModel`]
//! wrapper that the inference thread reads through, reconciled by `sync`.
//!
//! The numeric layer itself (gradient descent, tensor ops) is out of scope
//! here: callers implement [`Infer`] and [`ModelState`] for whatever model
//! representation they use, and this crate only orchestrates the locking and
//! pointer-swap choreography around those hooks.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelsError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no model registered under name '{0}'")]
    NotFound(String),
    #[error("model '{0}' is inference-only and has no trainable instance")]
    InferenceOnly(String),
}

pub type Result<T> = std::result::Result<T, ModelsError>;

/// Implemented by a model representation to perform inference given an
/// input, producing an output.
pub trait Infer: Send {
    type Input;
    type Output;
    fn infer(&self, input: Self::Input) -> Self::Output;
}

/// Implemented by a model representation to support the sync protocol
/// (§4.9): switching training/eval mode, detaching and reattaching whatever
/// gradient-tracking state the concrete model keeps, and copying parameter
/// values from a sibling instance.
pub trait ModelState: Infer {
    type GradState;

    fn set_eval_mode(&mut self);
    fn set_train_mode(&mut self);

    /// Detaches gradient-tracking state, returning it so it can be restored
    /// after the instance's parameters are overwritten.
    fn detach_grad(&mut self) -> Self::GradState;
    fn reattach_grad(&mut self, state: Self::GradState);

    /// Overwrites `self`'s parameter values with `source`'s.
    fn copy_params_from(&mut self, source: &Self);
}

/// Published, read-mostly side of a model pair. `infer` loads the current
/// `Arc<M>` and reads through it; a concurrent `sync` never blocks this
/// call, matching `knhk-closed-loop`'s `SnapshotPromoter::current` read path
/// (`promoter.rs`).
pub struct InferenceModel<M> {
    name: String,
    instance: ArcSwap<M>,
}

impl<M: Infer> InferenceModel<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, input), fields(model = %self.name))]
    pub fn infer(&self, input: M::Input) -> M::Output {
        self.instance.load().infer(input)
    }
}

/// The training-thread side of a model pair.
///
/// `has_inference`/`inference_only` pin down the lifecycle: `inference_only`
/// without `has_inference` is invalid; `inference_only = true` shares the
/// same underlying instance between both sides (no sync ever needed);
/// otherwise the two sides hold distinct instances reconciled by [`sync`](Self::sync).
pub struct TrainingModel<M> {
    name: String,
    current: Option<Mutex<M>>,
    inference: Option<Arc<InferenceModel<M>>>,
    has_inference: bool,
    inference_only: bool,
}

impl<M: ModelState> TrainingModel<M> {
    /// A model with no published inference counterpart at all.
    pub fn without_inference(instance: M, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: Some(Mutex::new(instance)),
            inference: None,
            has_inference: false,
            inference_only: false,
        }
    }

    /// The training and inference sides share one instance; `sync` is a
    /// no-op since there is nothing to reconcile.
    pub fn inference_only(instance: M, name: impl Into<String>) -> Self {
        let name = name.into();
        let inference = Arc::new(InferenceModel {
            name: name.clone(),
            instance: ArcSwap::new(Arc::new(instance)),
        });
        Self {
            name,
            current: None,
            inference: Some(inference),
            has_inference: true,
            inference_only: true,
        }
    }

    /// Distinct training and inference instances, reconciled by `sync`.
    /// `inference_instance` must be an equivalent, independently owned
    /// instance of the same model shape.
    pub fn with_inference(training_instance: M, inference_instance: M, name: impl Into<String>) -> Self {
        let name = name.into();
        let inference = Arc::new(InferenceModel {
            name: name.clone(),
            instance: ArcSwap::new(Arc::new(inference_instance)),
        });
        Self {
            name,
            current: Some(Mutex::new(training_instance)),
            inference: Some(inference),
            has_inference: true,
            inference_only: false,
        }
    }

    pub fn has_inference(&self) -> bool {
        self.has_inference
    }

    pub fn inference_only_flag(&self) -> bool {
        self.inference_only
    }

    pub fn forward(&self, input: M::Input) -> M::Output {
        match &self.current {
            Some(current) => current.lock().infer(input),
            None => self
                .inference
                .as_ref()
                .expect("inference_only models always carry an inference side")
                .instance
                .load()
                .infer(input),
        }
    }

    pub fn inference_model(&self) -> Result<Arc<InferenceModel<M>>> {
        self.inference
            .clone()
            .ok_or_else(|| ModelsError::Configuration(format!("model '{}' has no inference model", self.name)))
    }

    fn needs_sync(&self) -> bool {
        self.has_inference && !self.inference_only
    }

    /// The sync protocol (§4.9): eval mode, detach grad, atomically swap in
    /// the freshly trained snapshot as the published instance, copy the
    /// freshly published parameters back into the now-offline training
    /// instance, reattach grad, train mode. A no-op unless `has_inference &&
    /// !inference_only`.
    ///
    /// The swap itself is a single `ArcSwap::swap`, the same RCU idiom
    /// `knhk-closed-loop`'s `SnapshotPromoter::promote` uses to publish a new
    /// snapshot (`promoter.rs`): build the new value, swap it in under one
    /// atomic pointer store, and let the previous `Arc` drop once its last
    /// reader is done with it.
    #[tracing::instrument(skip(self), fields(model = %self.name))]
    pub fn sync(&self)
    where
        M: Clone,
    {
        if !self.needs_sync() {
            return;
        }
        let inference = self.inference.as_ref().expect("needs_sync implies inference is set");
        let mut training_guard = self
            .current
            .as_ref()
            .expect("needs_sync implies current is Some")
            .lock();

        training_guard.set_eval_mode();
        let grads = training_guard.detach_grad();

        let published = Arc::new(training_guard.clone());
        let _ = inference.instance.swap(published.clone());
        training_guard.copy_params_from(&published);

        training_guard.reattach_grad(grads);
        training_guard.set_train_mode();
    }
}

/// Named collection of published [`InferenceModel`]s, as seen from the
/// inference thread.
#[derive(Default)]
pub struct InferenceModelsDict<M> {
    models: HashMap<String, Arc<InferenceModel<M>>>,
}

impl<M: Infer> InferenceModelsDict<M> {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<InferenceModel<M>>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| ModelsError::NotFound(name.to_string()))
    }
}

/// Named collection of [`TrainingModel`]s. Registering a model with an
/// inference side mirrors it into the derived [`InferenceModelsDict`].
pub struct TrainingModelsDict<M> {
    models: HashMap<String, TrainingModel<M>>,
    inference_models: InferenceModelsDict<M>,
}

impl<M: ModelState> TrainingModelsDict<M> {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            inference_models: InferenceModelsDict::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, model: TrainingModel<M>) {
        let name = name.into();
        if let Ok(inference) = model.inference_model() {
            self.inference_models.models.insert(name.clone(), inference);
        }
        self.models.insert(name, model);
    }

    pub fn inference_models_dict(&self) -> &InferenceModelsDict<M> {
        &self.inference_models
    }

    /// Fetches a trainable model by name. Returns [`ModelsError::InferenceOnly`]
    /// for a model whose `inference_only` flag is set, mirroring the
    /// original container's "inference-only models are not trainable" rule.
    pub fn get(&self, name: &str) -> Result<&TrainingModel<M>> {
        let model = self
            .models
            .get(name)
            .ok_or_else(|| ModelsError::NotFound(name.to_string()))?;
        if model.inference_only_flag() {
            return Err(ModelsError::InferenceOnly(name.to_string()));
        }
        Ok(model)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.models.keys()
    }
}

impl<M: ModelState> Default for TrainingModelsDict<M> {
    fn default() -> Self {
        Self::new()
    }
}
