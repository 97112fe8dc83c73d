//! Step engine facade.
//!
//! Ties the worker registry to the job manager: one call runs one step of a
//! job definition, creating and driving its step job record.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, ResultExt};
use crate::jobs::{ChildStats, JobManager, JobStatus, LogLevel, QueueJob, PHASE_INIT, PHASE_RUN};
use crate::types::{JobDefinition, JobStep};
use crate::workers::WorkerRegistry;

/// What `run_step` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub job_id: Uuid,
    /// The step job stays `running` until its children settle
    pub returns_child_jobs: bool,
}

pub struct StepEngine {
    registry: Arc<WorkerRegistry>,
    jobs: Arc<JobManager>,
}

impl StepEngine {
    pub fn new(registry: Arc<WorkerRegistry>, jobs: Arc<JobManager>) -> Self {
        Self { registry, jobs }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// Startup check: every step resolves to a worker and passes static
    /// validation.
    pub fn verify(&self, definition: &JobDefinition) -> Result<()> {
        self.registry.verify(definition)
    }

    /// Run one step.
    ///
    /// Configuration errors surface before any job record exists. Once the
    /// step job is created, any failure (including cancellation) marks it
    /// failed before the error is returned.
    pub async fn run_step(
        &self,
        cancel: &CancellationToken,
        definition: &JobDefinition,
        step: &JobStep,
        parent: Option<Uuid>,
    ) -> Result<StepOutcome> {
        let worker = self
            .registry
            .resolve(&step.step_type)
            .with_context(|| format!("step '{}'", step.name))?;
        worker
            .validate_config(step)
            .with_context(|| format!("step '{}'", step.name))?;

        let mut job = QueueJob::builder()
            .job_type(step.step_type.clone())
            .name(step.name.clone())
            .phase(PHASE_INIT)
            .config(Value::Object(step.config.clone()))
            .build();
        job.parent_id = parent;
        let job = self.jobs.create_job_record(job).await?;
        let job_id = job.id;

        self.jobs.update_job_status(job_id, JobStatus::Running).await?;
        self.jobs
            .phase_log_or_warn(
                job_id,
                LogLevel::Info,
                &format!("Starting step '{}' ({})", step.name, step.step_type),
                PHASE_INIT,
            )
            .await;
        info!(
            job_id = %job_id,
            step = %step.name,
            step_type = %step.step_type,
            definition = %definition.name,
            "running step"
        );

        let returns_child_jobs = worker.returns_child_jobs();
        match worker.create_jobs(cancel, step, definition, job_id, None).await {
            Ok(_) if returns_child_jobs => {
                self.jobs
                    .phase_log_or_warn(job_id, LogLevel::Info, "Waiting for child jobs", PHASE_RUN)
                    .await;
            }
            Ok(_) => {
                self.jobs.update_job_status(job_id, JobStatus::Completed).await?;
            }
            Err(e) => {
                error!(job_id = %job_id, step = %step.name, error = %e, "step failed");
                let reason = e.failure_reason();
                if let Err(mark_err) = self.jobs.mark_failed(job_id, &reason).await {
                    warn!(job_id = %job_id, error = %mark_err, "failed to mark step job failed");
                }
                return Err(e).with_context(|| format!("step '{}'", step.name));
            }
        }

        Ok(StepOutcome {
            job_id,
            returns_child_jobs,
        })
    }

    /// Reduce a parent's children into its own status.
    ///
    /// The parent stays running while any child is pending or running.
    /// Once all are terminal it completes, or fails if any child failed.
    /// A parent already in a terminal status is left as is.
    pub async fn settle_parent(&self, parent_id: Uuid) -> Result<JobStatus> {
        let parent = self.jobs.get_job(parent_id).await?;
        if parent.status.is_terminal() {
            return Ok(parent.status);
        }

        let stats = self.jobs.get_child_stats(parent_id).await?;
        if !stats.is_settled() {
            return Ok(parent.status);
        }

        let status = match settle_reason(&stats) {
            None => {
                self.jobs
                    .phase_log_or_warn(
                        parent_id,
                        LogLevel::Info,
                        &format!("All {} batch jobs completed", stats.total),
                        PHASE_RUN,
                    )
                    .await;
                self.jobs.update_job_status(parent_id, JobStatus::Completed).await?.status
            }
            Some(reason) => self.jobs.mark_failed(parent_id, &reason).await?.status,
        };
        info!(parent_id = %parent_id, status = %status, total = stats.total, failed = stats.failed, "parent settled");
        Ok(status)
    }
}

fn settle_reason(stats: &ChildStats) -> Option<String> {
    (stats.failed > 0).then(|| format!("{} of {} batch jobs failed", stats.failed, stats.total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::stores::{MemoryDocumentStore, MemoryJobStore};
    use crate::testing::{RecordingTransport, ScriptedMarketData};
    use crate::workers::{MarketDataKind, MarketDataWorker};

    struct Harness {
        engine: StepEngine,
        jobs: Arc<JobManager>,
        store: Arc<MemoryJobStore>,
    }

    impl Harness {
        fn with_status(&self, status: JobStatus) -> Vec<QueueJob> {
            self.store.jobs().into_iter().filter(|j| j.status == status).collect()
        }
    }

    fn harness(provider: ScriptedMarketData) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let jobs = Arc::new(JobManager::new(store.clone(), Arc::new(RecordingTransport::new())));
        let mut registry = WorkerRegistry::new();
        registry.register(MarketDataWorker::new(
            MarketDataKind::Stock,
            jobs.clone(),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(provider),
            &EngineConfig::default(),
        ));
        Harness {
            engine: StepEngine::new(Arc::new(registry), jobs.clone()),
            jobs,
            store,
        }
    }

    fn stock_step(ticker: &str) -> JobStep {
        JobStep::new("prices", "asx_stock_collector").with("asx_code", ticker)
    }

    #[tokio::test]
    async fn inline_step_completes() {
        let h = harness(ScriptedMarketData::new());
        let step = stock_step("GNP");
        let definition = JobDefinition::new("daily", vec![step.clone()]);

        let outcome = h
            .engine
            .run_step(&CancellationToken::new(), &definition, &step, None)
            .await
            .unwrap();

        assert!(!outcome.returns_child_jobs);
        let job = h.jobs.get_job(outcome.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert_eq!(job.result.unwrap()["documents_created"], 1);
    }

    #[tokio::test]
    async fn failed_step_is_marked_failed() {
        let h = harness(ScriptedMarketData::new().fail_stock("GNP", "502 bad gateway"));
        let step = stock_step("GNP");
        let definition = JobDefinition::new("daily", vec![step.clone()]);

        let err = h
            .engine
            .run_step(&CancellationToken::new(), &definition, &step, None)
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("step 'prices'"));
        let failed = h.with_status(JobStatus::Failed);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("502 bad gateway"));
    }

    #[tokio::test]
    async fn cancelled_step_is_marked_failed() {
        let h = harness(ScriptedMarketData::new());
        let step = stock_step("GNP");
        let definition = JobDefinition::new("daily", vec![step.clone()]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.engine.run_step(&cancel, &definition, &step, None).await.unwrap_err();

        assert!(err.is_cancelled());
        let failed = h.with_status(JobStatus::Failed);
        assert_eq!(failed[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn unknown_step_type_creates_no_job() {
        let h = harness(ScriptedMarketData::new());
        let step = JobStep::new("crawl", "web_crawler");
        let definition = JobDefinition::new("daily", vec![step.clone()]);

        let err = h
            .engine
            .run_step(&CancellationToken::new(), &definition, &step, None)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), EngineError::UnknownWorkerType(_)));
        assert_eq!(h.store.job_count(), 0);
        assert!(h.engine.verify(&definition).unwrap_err().is_configuration());
    }

    async fn parent_with_children(jobs: &JobManager, outcomes: &[JobStatus]) -> Uuid {
        let parent = jobs
            .create_job_record(QueueJob::builder().job_type("local_dir").name("index").build())
            .await
            .unwrap();
        jobs.update_job_status(parent.id, JobStatus::Running).await.unwrap();

        for (i, status) in outcomes.iter().enumerate() {
            let child = jobs
                .create_child_job(
                    &CancellationToken::new(),
                    QueueJob::builder()
                        .parent_id(parent.id)
                        .job_type("local_dir_batch")
                        .name(format!("Batch {}/{}: docs", i + 1, outcomes.len()))
                        .build(),
                )
                .await
                .unwrap();
            match status {
                JobStatus::Pending => {}
                JobStatus::Running => {
                    jobs.update_job_status(child.id, JobStatus::Running).await.unwrap();
                }
                JobStatus::Completed => {
                    jobs.update_job_status(child.id, JobStatus::Running).await.unwrap();
                    jobs.update_job_status(child.id, JobStatus::Completed).await.unwrap();
                }
                JobStatus::Failed => {
                    jobs.mark_failed(child.id, "read error").await.unwrap();
                }
            }
        }
        parent.id
    }

    #[tokio::test]
    async fn parent_waits_for_unsettled_children() {
        let h = harness(ScriptedMarketData::new());
        let parent = parent_with_children(&h.jobs, &[JobStatus::Completed, JobStatus::Running]).await;

        assert_eq!(h.engine.settle_parent(parent).await.unwrap(), JobStatus::Running);
    }

    #[tokio::test]
    async fn parent_completes_when_every_child_completes() {
        let h = harness(ScriptedMarketData::new());
        let parent = parent_with_children(&h.jobs, &[JobStatus::Completed, JobStatus::Completed]).await;

        assert_eq!(h.engine.settle_parent(parent).await.unwrap(), JobStatus::Completed);
        // Settling again is a no-op
        assert_eq!(h.engine.settle_parent(parent).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn parent_fails_when_any_child_fails() {
        let h = harness(ScriptedMarketData::new());
        let parent =
            parent_with_children(&h.jobs, &[JobStatus::Completed, JobStatus::Failed, JobStatus::Completed]).await;

        assert_eq!(h.engine.settle_parent(parent).await.unwrap(), JobStatus::Failed);
        let job = h.jobs.get_job(parent).await.unwrap();
        assert_eq!(job.error.as_deref(), Some("1 of 3 batch jobs failed"));
    }
}
