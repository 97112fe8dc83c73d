//! Queue job model and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::traits::queue::QueueMessage;

/// Planning phase of a step.
pub const PHASE_INIT: &str = "init";
/// Work being performed by a worker or batch executor.
pub const PHASE_RUN: &str = "run";
/// Queued batch execution.
pub const PHASE_EXECUTION: &str = "execution";

// ============================================================================
// Enums
// ============================================================================

/// `pending -> running -> {completed, failed}`.
///
/// A pending job may also fail directly (enqueue failure, cancellation
/// before pickup). Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Statuses from which `to` may be entered.
    pub fn allowed_from(to: JobStatus) -> &'static [JobStatus] {
        match to {
            JobStatus::Pending => &[],
            JobStatus::Running => &[JobStatus::Pending],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed => &[JobStatus::Pending, JobStatus::Running],
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(EngineError::persistence(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(EngineError::persistence(format!("unknown log level: {other}"))),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueueJob {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    /// Present for batch children
    #[builder(default, setter(strip_option))]
    pub parent_id: Option<Uuid>,

    pub job_type: String,
    pub name: String,

    #[builder(default = PHASE_EXECUTION.to_string())]
    pub phase: String,

    /// Batch-specific payload
    #[builder(default)]
    pub config: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,

    /// Terminal failure reason, distinct from status
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    /// Summary an inline worker recorded for this job
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    #[builder(default = 0)]
    pub progress_current: i64,
    #[builder(default = 0)]
    pub progress_total: i64,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// The message handed to the queue transport for this job.
    pub fn to_message(&self) -> QueueMessage {
        QueueMessage {
            job_id: self.id,
            job_type: self.job_type.clone(),
            payload: self.config.clone(),
        }
    }

    /// Apply a transition in memory, stamping timestamps.
    ///
    /// Stores call this under their own lock (or mirror it in SQL).
    pub fn apply_transition(&mut self, to: JobStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        match to {
            JobStatus::Running => self.started_at = Some(at),
            JobStatus::Completed | JobStatus::Failed => self.completed_at = Some(at),
            JobStatus::Pending => {}
        }
        Ok(())
    }
}

/// One append-only log line attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    /// Store-wide append order
    pub sequence: u64,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub phase: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-status counts of a parent's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ChildStats {
    pub fn from_jobs(jobs: &[QueueJob]) -> Self {
        let mut stats = ChildStats {
            total: jobs.len(),
            ..Default::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Every child has reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}
