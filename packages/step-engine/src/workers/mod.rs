//! Worker contract and reference workers.
//!
//! Every step type implements [`Worker`]. Planning (`init`) produces an
//! [`InitResult`] carrying the worker's typed `Plan`; execution
//! (`create_jobs`) consumes it, or plans first when handed `None`, so the two
//! phases compose whether an orchestrator calls them separately or not.
//!
//! The registry stores workers behind [`DynWorker`], which erases the plan
//! type. A plan handed back to the wrong worker is a `PlanMismatch`.

use std::any::Any;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::policy::FailurePolicy;
use crate::types::{InitResult, JobDefinition, JobStep};

pub mod competitor;
pub mod local_dir;
pub mod market_data;
pub mod registry;
pub mod stock_data;

pub use competitor::{parse_competitor_codes, MarketCompetitorWorker};
pub use local_dir::{LocalDirBatchExecutor, LocalDirWorker};
pub use market_data::{MarketDataKind, MarketDataWorker};
pub use registry::WorkerRegistry;
pub use stock_data::StockDataCollectionWorker;

/// Capability set every step type implements.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Typed planning data carried from `init` into `create_jobs`.
    type Plan: Send + Sync + 'static;

    /// Step type string this worker handles.
    fn worker_type(&self) -> &'static str;

    /// Static config check. No I/O.
    fn validate_config(&self, step: &JobStep) -> Result<()>;

    /// Plan the work. May do cheap discovery I/O, never the expensive fetch.
    async fn init(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
    ) -> Result<InitResult<Self::Plan>>;

    /// Execute or dispatch the planned work. Returns the resulting job ID.
    async fn create_jobs(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
        step_job_id: Uuid,
        init: Option<InitResult<Self::Plan>>,
    ) -> Result<Uuid>;

    /// Whether the caller must wait for queued children before the step is done.
    fn returns_child_jobs(&self) -> bool;

    fn failure_policy(&self) -> FailurePolicy;
}

/// Type-erased planning data.
pub type AnyPlan = Box<dyn Any + Send + Sync>;

/// Object-safe view of a [`Worker`], used by the registry and engine.
#[async_trait]
pub trait DynWorker: Send + Sync {
    fn worker_type(&self) -> &'static str;

    fn validate_config(&self, step: &JobStep) -> Result<()>;

    async fn init(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
    ) -> Result<InitResult<AnyPlan>>;

    async fn create_jobs(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
        step_job_id: Uuid,
        init: Option<InitResult<AnyPlan>>,
    ) -> Result<Uuid>;

    fn returns_child_jobs(&self) -> bool;

    fn failure_policy(&self) -> FailurePolicy;
}

/// Adapts a typed worker to [`DynWorker`].
pub(crate) struct Erased<W>(pub(crate) W);

#[async_trait]
impl<W: Worker> DynWorker for Erased<W> {
    fn worker_type(&self) -> &'static str {
        self.0.worker_type()
    }

    fn validate_config(&self, step: &JobStep) -> Result<()> {
        self.0.validate_config(step)
    }

    async fn init(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
    ) -> Result<InitResult<AnyPlan>> {
        let result = self.0.init(cancel, step, definition).await?;
        Ok(result.map_plan(|plan| Box::new(plan) as AnyPlan))
    }

    async fn create_jobs(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
        step_job_id: Uuid,
        init: Option<InitResult<AnyPlan>>,
    ) -> Result<Uuid> {
        let typed = match init {
            None => None,
            Some(result) => Some(result.try_map_plan(|plan| {
                plan.downcast::<W::Plan>()
                    .map(|plan| *plan)
                    .map_err(|_| EngineError::PlanMismatch(self.0.worker_type().to_string()))
            })?),
        };
        self.0
            .create_jobs(cancel, step, definition, step_job_id, typed)
            .await
    }

    fn returns_child_jobs(&self) -> bool {
        self.0.returns_child_jobs()
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.0.failure_policy()
    }
}
