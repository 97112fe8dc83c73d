//! Maps step type strings to worker instances.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{DynWorker, Erased, Worker};
use crate::error::{EngineError, Result, ResultExt};
use crate::types::JobDefinition;

#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<&'static str, Arc<dyn DynWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker under its own type string. A later registration
    /// for the same type replaces the earlier one.
    pub fn register<W: Worker + 'static>(&mut self, worker: W) {
        let worker_type = worker.worker_type();
        debug!(worker_type, "registering worker");
        self.workers.insert(worker_type, Arc::new(Erased(worker)));
    }

    /// Resolve a step type. Unknown types are a configuration error.
    pub fn resolve(&self, step_type: &str) -> Result<Arc<dyn DynWorker>> {
        self.workers
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkerType(step_type.to_string()))
    }

    pub fn is_registered(&self, step_type: &str) -> bool {
        self.workers.contains_key(step_type)
    }

    /// Registered types, sorted.
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.workers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Check every step of `definition` resolves and passes static validation.
    pub fn verify(&self, definition: &JobDefinition) -> Result<()> {
        for step in &definition.steps {
            let worker = self
                .resolve(&step.step_type)
                .with_context(|| format!("step '{}'", step.name))?;
            worker
                .validate_config(step)
                .with_context(|| format!("step '{}'", step.name))?;
        }
        Ok(())
    }
}
