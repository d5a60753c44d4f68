//! Model inference behind `model` nodes.
//!
//! The scheduler only needs two things from a backend: a bounded attempt at
//! claiming an execution slot, and an asynchronous submit that reports back
//! exactly once. [`LocalBackend`] is the in-process implementation: models
//! are plain Rust functions run on the rayon pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pipeflow_types::{BackendConfig, TensorMap};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::slots::{ExecutionSlots, SlotGuard};

/// Completion callback of one inference. Errors are plain messages.
pub type InferenceDone = Box<dyn FnOnce(std::result::Result<TensorMap, String>) + Send + 'static>;

/// A loaded model.
pub trait ModelRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Claim an execution slot, waiting at most `timeout`.
    fn try_acquire(&self, timeout: Duration) -> Option<SlotGuard>;

    /// Start inference holding `slot`. `done` runs exactly once, usually on
    /// another thread, after the slot has been given back.
    fn submit(&self, inputs: TensorMap, slot: SlotGuard, done: InferenceDone);
}

/// Resolves model names at pipeline load time.
pub trait InferenceBackend: Send + Sync {
    fn model(&self, name: &str) -> Result<Arc<dyn ModelRunner>>;
}

// ── Local backend ────────────────────────────────────────────────────────────

pub type ModelFn =
    Arc<dyn Fn(&TensorMap) -> std::result::Result<TensorMap, String> + Send + Sync>;

pub struct LocalModel {
    name: String,
    slots: Arc<ExecutionSlots>,
    func: ModelFn,
}

impl LocalModel {
    pub fn new(name: impl Into<String>, execution_slots: usize, func: ModelFn) -> Self {
        Self { name: name.into(), slots: ExecutionSlots::new(execution_slots), func }
    }

    pub fn slots(&self) -> &Arc<ExecutionSlots> {
        &self.slots
    }
}

impl ModelRunner for LocalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&self, timeout: Duration) -> Option<SlotGuard> {
        self.slots.try_acquire(timeout)
    }

    fn submit(&self, inputs: TensorMap, slot: SlotGuard, done: InferenceDone) {
        let func = Arc::clone(&self.func);
        let name = self.name.clone();
        rayon::spawn(move || {
            debug!(model = %name, slot = slot.id(), "inference started");
            let result = func(&inputs);
            drop(inputs);
            drop(slot);
            done(result);
        });
    }
}

#[derive(Default)]
pub struct LocalBackend {
    config: BackendConfig,
    models: HashMap<String, Arc<LocalModel>>,
}

impl LocalBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config, models: HashMap::new() }
    }

    /// Register `func` as model `name` with the configured slot count.
    pub fn register<F>(&mut self, name: &str, func: F) -> Arc<LocalModel>
    where
        F: Fn(&TensorMap) -> std::result::Result<TensorMap, String> + Send + Sync + 'static,
    {
        let model = Arc::new(LocalModel::new(name, self.config.execution_slots, Arc::new(func)));
        self.models.insert(name.to_string(), Arc::clone(&model));
        model
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl InferenceBackend for LocalBackend {
    fn model(&self, name: &str) -> Result<Arc<dyn ModelRunner>> {
        self.models
            .get(name)
            .map(|m| Arc::clone(m) as Arc<dyn ModelRunner>)
            .ok_or_else(|| PipelineError::UnknownModel(name.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pipeflow_types::Tensor;
    use std::sync::mpsc;

    fn doubler(inputs: &TensorMap) -> std::result::Result<TensorMap, String> {
        let x = inputs.get("x").ok_or("missing x")?;
        let values: Vec<f32> = x
            .to_f32_vec()
            .map_err(|e| e.to_string())?
            .iter()
            .map(|v| v * 2.0)
            .collect();
        let y = Tensor::from_f32(x.shape().to_vec(), &values).map_err(|e| e.to_string())?;
        Ok(TensorMap::from([("y".to_string(), y)]))
    }

    #[test]
    fn unknown_model_is_an_error() {
        let backend = LocalBackend::default();
        assert!(matches!(backend.model("nope"), Err(PipelineError::UnknownModel(_))));
    }

    #[test]
    fn submit_reports_once_and_frees_slot() {
        let mut backend = LocalBackend::new(BackendConfig { execution_slots: 1 });
        let local = backend.register("double", doubler);
        let model = backend.model("double").unwrap();
        assert_eq!(backend.names(), vec!["double"]);

        let slot = model.try_acquire(Duration::ZERO).unwrap();
        assert!(model.try_acquire(Duration::ZERO).is_none());

        let (tx, rx) = mpsc::channel();
        let inputs = TensorMap::from([("x".to_string(), Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap())]);
        model.submit(inputs, slot, Box::new(move |r: std::result::Result<TensorMap, String>| tx.send(r).unwrap()));
        let out = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(out["y"].to_f32_vec().unwrap(), vec![2.0, 4.0]);
        assert_eq!(local.slots().available(), 1);
    }
}
