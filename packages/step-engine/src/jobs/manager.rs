//! Job lifecycle manager.
//!
//! `JobManager` is the only component that mutates job records. It is an
//! explicitly injected collaborator: workers receive an `Arc<JobManager>`
//! at construction, so tests substitute in-memory stores and transports
//! without any global state.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{ChildStats, JobLogEntry, JobStatus, LogLevel, QueueJob};
use crate::error::{EngineError, Result};
use crate::traits::queue::{JobRecordStore, QueueTransport};
use crate::types::WorkerOutcome;

pub struct JobManager {
    store: Arc<dyn JobRecordStore>,
    transport: Arc<dyn QueueTransport>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobRecordStore>, transport: Arc<dyn QueueTransport>) -> Self {
        Self { store, transport }
    }

    // ========================================================================
    // Creation and dispatch
    // ========================================================================

    /// Persist a job record in `pending`.
    ///
    /// Records always start pending; status and lifecycle timestamps on the
    /// input are reset. The record is queryable before anything can enqueue it.
    pub async fn create_job_record(&self, mut job: QueueJob) -> Result<QueueJob> {
        job.status = JobStatus::Pending;
        job.error = None;
        job.result = None;
        job.started_at = None;
        job.completed_at = None;

        self.store.insert_job(&job).await?;
        debug!(
            job_id = %job.id,
            parent_id = ?job.parent_id,
            job_type = %job.job_type,
            "Created job record"
        );
        Ok(job)
    }

    /// Hand a persisted job to the queue transport.
    pub async fn enqueue(&self, cancel: &CancellationToken, job: &QueueJob) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.transport.enqueue(job.to_message()) => result?,
        }
        info!(job_id = %job.id, job_type = %job.job_type, name = %job.name, "Enqueued job");
        Ok(())
    }

    /// Persist then enqueue a child job.
    ///
    /// If the enqueue fails the child is marked failed with the enqueue
    /// error, so no record is left pending with nothing to pick it up.
    pub async fn create_child_job(&self, cancel: &CancellationToken, job: QueueJob) -> Result<QueueJob> {
        let job = self.create_job_record(job).await?;
        if let Err(e) = self.enqueue(cancel, &job).await {
            warn!(job_id = %job.id, error = %e, "Enqueue failed, marking child failed");
            if let Err(mark_err) = self.mark_failed(job.id, &format!("enqueue failed: {e}")).await {
                warn!(job_id = %job.id, error = %mark_err, "Failed to mark child failed");
            }
            return Err(e);
        }
        Ok(job)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Transition a job and append a `Status changed` log line.
    pub async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<QueueJob> {
        let job = self.store.transition(job_id, status, Utc::now()).await?;
        info!(job_id = %job_id, status = %status, "Job status changed");
        self.log_or_warn(job_id, LogLevel::Info, &format!("Status changed: {status}"))
            .await;
        Ok(job)
    }

    /// Attach a failure reason without changing status.
    pub async fn set_job_error(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.store.set_error(job_id, error).await
    }

    /// Move the job to `failed` with its reason in a single store write.
    ///
    /// A job that already reached a terminal status is left untouched and
    /// the call fails with `InvalidTransition`.
    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<QueueJob> {
        let job = self.store.fail(job_id, error, Utc::now()).await?;
        info!(job_id = %job_id, status = %JobStatus::Failed, "Job status changed");
        self.log_or_warn(job_id, LogLevel::Error, error).await;
        self.log_or_warn(job_id, LogLevel::Info, &format!("Status changed: {}", JobStatus::Failed))
            .await;
        Ok(job)
    }

    /// Store what an inline execution produced on the job record.
    pub async fn set_job_result(&self, job_id: Uuid, outcome: &WorkerOutcome) -> Result<()> {
        let value = serde_json::to_value(outcome)?;
        self.store.set_result(job_id, &value).await
    }

    pub async fn update_job_progress(&self, job_id: Uuid, current: i64, total: i64) -> Result<()> {
        self.store.set_progress(job_id, current, total).await
    }

    // ========================================================================
    // Logs
    // ========================================================================

    /// Append a log line under the job's own phase.
    pub async fn add_job_log(&self, job_id: Uuid, level: LogLevel, message: &str) -> Result<()> {
        let job = self.get_job(job_id).await?;
        self.add_job_log_with_phase(job_id, level, message, &job.phase).await
    }

    /// Append a log line under an explicit phase.
    pub async fn add_job_log_with_phase(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        phase: &str,
    ) -> Result<()> {
        self.store.append_log(job_id, level, message, phase).await?;
        Ok(())
    }

    /// Append a log line; a failed append is reported to tracing only.
    ///
    /// Job logs are user-facing records, never a reason to fail the work.
    pub async fn log_or_warn(&self, job_id: Uuid, level: LogLevel, message: &str) {
        if let Err(e) = self.add_job_log(job_id, level, message).await {
            warn!(job_id = %job_id, error = %e, "Failed to append job log");
        }
    }

    /// Same as `log_or_warn` with an explicit phase.
    pub async fn phase_log_or_warn(&self, job_id: Uuid, level: LogLevel, message: &str, phase: &str) {
        if let Err(e) = self.add_job_log_with_phase(job_id, level, message, phase).await {
            warn!(job_id = %job_id, error = %e, "Failed to append job log");
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_job(&self, job_id: Uuid) -> Result<QueueJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Children of a parent, oldest first.
    pub async fn list_child_jobs(&self, parent_id: Uuid) -> Result<Vec<QueueJob>> {
        self.store.list_children(parent_id).await
    }

    pub async fn get_child_stats(&self, parent_id: Uuid) -> Result<ChildStats> {
        self.store.child_stats(parent_id).await
    }

    pub async fn get_job_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>> {
        self.store.list_logs(job_id).await
    }
}
