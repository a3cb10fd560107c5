//! Model Registry
//!
//! Several independent models can live in one process, each with its own
//! engine, controller and training thread. The registry maps model ids to
//! those pairs and caps how many exist at once.
//!
//! ```text
//! ModelRegistry
//!   "shakespeare" ─► (Arc<Mutex<EngineService>>, TrainingController)
//!   "recipes"     ─► (Arc<Mutex<EngineService>>, TrainingController)
//!   active = "recipes"   (last one asked for)
//! ```
//!
//! The registry is an ordinary value; callers own it and pass it where it is
//! needed.

use crate::controller::{lock, TrainingController};
use crate::engine::EngineService;
use crate::error::{EngineError, Result};
use crate::progress::{ProgressSink, TrainingStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

pub const MAX_MODELS: usize = 5;

/// What a caller sees about each loaded model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub model_id: String,
    pub is_ready: bool,
    /// `idle`, `ready`, `training` or `paused`
    pub status: &'static str,
    pub is_active: bool,
    pub total_parameters: usize,
    pub last_loss: Option<f64>,
}

struct Entry {
    engine: Arc<Mutex<EngineService>>,
    controller: Arc<TrainingController>,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    active: Option<String>,
}

pub struct ModelRegistry {
    inner: Mutex<Inner>,
    max_models: usize,
    sinks: Vec<Arc<dyn ProgressSink>>,
    checkpoint_dir: Option<PathBuf>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MODELS)
    }

    pub fn with_capacity(max_models: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                active: None,
            }),
            max_models,
            sinks: Vec::new(),
            checkpoint_dir: None,
        }
    }

    /// Progress sink attached to every controller created from now on
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Auto-save directory for every controller created from now on
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    fn new_entry(&self, model_id: &str) -> Entry {
        let engine = Arc::new(Mutex::new(EngineService::new()));
        let mut controller = TrainingController::new(model_id, Arc::clone(&engine));
        for sink in &self.sinks {
            controller.add_sink(Arc::clone(sink));
        }
        if let Some(dir) = &self.checkpoint_dir {
            controller = controller.with_checkpoint_dir(dir.clone());
        }
        Entry {
            engine,
            controller: Arc::new(controller),
        }
    }

    /// Engine for `model_id`, created on first use; marks it active
    pub fn get_engine(&self, model_id: &str) -> Result<Arc<Mutex<EngineService>>> {
        let mut inner = lock(&self.inner);
        if !inner.entries.contains_key(model_id) {
            if inner.entries.len() >= self.max_models {
                return Err(EngineError::CapacityExceeded {
                    max: self.max_models,
                });
            }
            let entry = self.new_entry(model_id);
            inner.entries.insert(model_id.to_string(), entry);
            info!(model = model_id, loaded = inner.entries.len(), "model registered");
        }
        inner.active = Some(model_id.to_string());
        Ok(Arc::clone(&inner.entries[model_id].engine))
    }

    /// Controller for `model_id`; the model must already be registered
    pub fn get_training_controller(&self, model_id: &str) -> Option<Arc<TrainingController>> {
        lock(&self.inner)
            .entries
            .get(model_id)
            .map(|e| Arc::clone(&e.controller))
    }

    /// The last model asked for, else the first one that is ready
    pub fn get_active_engine(&self) -> Option<Arc<Mutex<EngineService>>> {
        let inner = lock(&self.inner);
        if let Some(entry) = inner.active.as_ref().and_then(|id| inner.entries.get(id)) {
            return Some(Arc::clone(&entry.engine));
        }
        inner
            .entries
            .values()
            .find(|e| lock(&e.engine).is_ready())
            .map(|e| Arc::clone(&e.engine))
    }

    pub fn active_id(&self) -> Option<String> {
        lock(&self.inner).active.clone()
    }

    pub fn has_engine(&self, model_id: &str) -> bool {
        lock(&self.inner).entries.contains_key(model_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unload a model, stopping its training run first
    pub fn remove(&self, model_id: &str) {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.entries.remove(model_id) {
            entry.controller.stop();
            info!(model = model_id, "model removed");
        }
        if inner.active.as_deref() == Some(model_id) {
            inner.active = None;
        }
    }

    pub fn list_active(&self) -> Vec<ModelSummary> {
        let inner = lock(&self.inner);
        inner
            .entries
            .iter()
            .map(|(id, entry)| {
                let (is_ready, total_parameters) = {
                    let engine = lock(&entry.engine);
                    (engine.is_ready(), engine.count_parameters())
                };
                let controller = &entry.controller;
                let status = if controller.is_running() {
                    if controller.status() == TrainingStatus::Paused {
                        "paused"
                    } else {
                        "training"
                    }
                } else if is_ready {
                    "ready"
                } else {
                    "idle"
                };
                ModelSummary {
                    model_id: id.clone(),
                    is_ready,
                    status,
                    is_active: inner.active.as_deref() == Some(id.as_str()),
                    total_parameters,
                    last_loss: controller.loss_history().last().copied(),
                }
            })
            .collect()
    }

    /// Unload every model, stopping all runs
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        for entry in inner.entries.values() {
            entry.controller.stop();
        }
        inner.entries.clear();
        inner.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_capacity_is_enforced() {
        let registry = ModelRegistry::new();
        for i in 0..MAX_MODELS {
            registry.get_engine(&format!("m{}", i)).expect("engine");
        }
        assert!(matches!(
            registry.get_engine("one-too-many"),
            Err(EngineError::CapacityExceeded { max: MAX_MODELS })
        ));
        // Existing ids are still reachable at the cap
        assert!(registry.get_engine("m0").is_ok());

        registry.remove("m1");
        assert!(registry.get_engine("one-too-many").is_ok());
    }

    #[test]
    fn test_same_id_same_engine() {
        let registry = ModelRegistry::new();
        let a = registry.get_engine("x").expect("a");
        let b = registry.get_engine("x").expect("b");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.has_engine("x"));
        assert!(registry.get_training_controller("x").is_some());
        assert!(registry.get_training_controller("y").is_none());
    }

    #[test]
    fn test_active_tracking() {
        let registry = ModelRegistry::new();
        assert!(registry.get_active_engine().is_none());
        registry.get_engine("a").expect("a");
        let b = registry.get_engine("b").expect("b");
        assert_eq!(registry.active_id().as_deref(), Some("b"));
        assert!(Arc::ptr_eq(&registry.get_active_engine().expect("active"), &b));

        registry.remove("b");
        assert_eq!(registry.active_id(), None);
        // Nothing ready, nothing active
        assert!(registry.get_active_engine().is_none());
    }

    #[test]
    fn test_list_active_statuses() {
        let registry = ModelRegistry::new();
        registry.get_engine("idle").expect("idle");
        let ready = registry.get_engine("ready").expect("ready");
        lock(&ready)
            .initialize(Config::tiny(), "abc abc\ncab\n")
            .expect("initialize");

        let summaries = registry.list_active();
        assert_eq!(summaries.len(), 2);
        let idle = summaries.iter().find(|s| s.model_id == "idle").expect("idle");
        assert_eq!(idle.status, "idle");
        assert_eq!(idle.total_parameters, 0);
        let ready = summaries.iter().find(|s| s.model_id == "ready").expect("ready");
        assert_eq!(ready.status, "ready");
        assert!(ready.is_active);
        assert!(ready.total_parameters > 0);
        assert_eq!(ready.last_loss, None);
    }

    #[test]
    fn test_training_status_and_clear() {
        let registry = ModelRegistry::new();
        let engine = registry.get_engine("t").expect("engine");
        lock(&engine)
            .initialize(Config::tiny(), "abcabc\nbca\n")
            .expect("initialize");
        let controller = registry.get_training_controller("t").expect("controller");
        controller.start(Some(100_000)).expect("start");
        assert_eq!(registry.list_active()[0].status, "training");

        controller.pause();
        assert_eq!(registry.list_active()[0].status, "paused");

        registry.clear();
        assert!(registry.is_empty());
        controller.join();
        assert_eq!(controller.status(), TrainingStatus::Stopped);
    }
}
