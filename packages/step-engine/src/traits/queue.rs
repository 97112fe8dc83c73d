//! Job record persistence and queue transport boundaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{ChildStats, JobLogEntry, JobStatus, LogLevel, QueueJob};

/// Serialized unit handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
}

/// Backing queue the engine dispatches batch jobs into.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn enqueue(&self, message: QueueMessage) -> Result<()>;
}

/// Persistent store for job records and their logs.
///
/// Implementations must apply `transition` atomically: the allowed-from
/// check and the write happen under one lock or one conditional UPDATE, so
/// concurrent child completions can never move a job out of a terminal state.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Persist a new job record.
    async fn insert_job(&self, job: &QueueJob) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>>;

    /// Apply a status transition, stamping `started_at` / `completed_at`.
    ///
    /// Fails with `InvalidTransition` when the current status does not
    /// allow `to`, and `JobNotFound` when the job does not exist.
    async fn transition(&self, id: Uuid, to: JobStatus, at: DateTime<Utc>) -> Result<QueueJob>;

    /// Move the job to `failed` and record `error` in one step.
    ///
    /// The reason is only written when the transition is allowed, so a
    /// job that reached a terminal status first keeps its own outcome.
    async fn fail(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<QueueJob>;

    /// Attach a failure reason (independent of status).
    async fn set_error(&self, id: Uuid, error: &str) -> Result<()>;

    /// Store the execution summary for the job.
    async fn set_result(&self, id: Uuid, result: &serde_json::Value) -> Result<()>;

    async fn set_progress(&self, id: Uuid, current: i64, total: i64) -> Result<()>;

    /// Append a log entry. Entries are never mutated or deleted.
    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        phase: &str,
    ) -> Result<JobLogEntry>;

    /// Children of `parent_id`, oldest first.
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<QueueJob>>;

    /// Logs for one job in append order.
    async fn list_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>>;

    /// Per-status child counts, read in one consistent pass.
    async fn child_stats(&self, parent_id: Uuid) -> Result<ChildStats> {
        let children = self.list_children(parent_id).await?;
        Ok(ChildStats::from_jobs(&children))
    }
}
