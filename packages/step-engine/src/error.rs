//! Typed errors for the step engine.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can
//! branch on the failure class: configuration problems are surfaced to the
//! job definition author, transient fetch failures are handled by the
//! step's failure policy, and dead-man trips are always fatal to the step.

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::JobStatus;

/// Boxed error from an external collaborator (provider, store, transport).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while planning, dispatching, or executing a step.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    /// Step config is missing a field or has an invalid value
    #[error("invalid config for {step_type}: {reason}")]
    InvalidConfig { step_type: String, reason: String },

    /// No worker registered for the step's declared type
    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    /// API key could not be found in env, KV store, or fallback
    #[error("API key '{name}' not found in environment, KV store, or config")]
    MissingCredential { name: String },

    // ------------------------------------------------------------------
    // Transient fetch
    // ------------------------------------------------------------------
    /// External provider call failed
    #[error("fetch failed: {0}")]
    Fetch(#[source] BoxError),

    /// External provider call exceeded its timeout
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------
    /// Document or job record could not be written or read
    #[error("storage error: {0}")]
    Persistence(#[source] BoxError),

    /// Filesystem error during discovery or batch execution
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ------------------------------------------------------------------
    // Invariant violations
    // ------------------------------------------------------------------
    /// Strict policy tripped: the produced artifacts do not match the plan
    #[error("dead-man check failed: {actual} of {expected} expected documents produced ({breakdown}), {} sub-operation(s) failed{}", .failures.len(), render_failures(.failures))]
    DeadMan {
        expected: usize,
        actual: usize,
        breakdown: String,
        failures: Vec<String>,
    },

    /// Best-effort policy tripped: every attempted sub-operation failed
    #[error("all {attempted} sub-operations failed, last error: {last_error}")]
    AllFailed { attempted: usize, last_error: String },

    /// Requested status change is not allowed by the job state machine
    #[error("job {job_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// `create_jobs` was handed a plan produced by a different worker family
    #[error("planning result does not belong to worker {0}")]
    PlanMismatch(String),

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    /// Job record does not exist
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Error wrapped with call-site context (ticker, batch index, phase)
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

fn render_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(": {}", failures.join("; "))
    }
}

impl EngineError {
    /// Wrap an external storage error.
    pub fn persistence(err: impl Into<BoxError>) -> Self {
        EngineError::Persistence(err.into())
    }

    /// Wrap an external provider error.
    pub fn fetch(err: impl Into<BoxError>) -> Self {
        EngineError::Fetch(err.into())
    }

    pub fn invalid_config(step_type: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            step_type: step_type.into(),
            reason: reason.into(),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Configuration errors are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            EngineError::InvalidConfig { .. }
                | EngineError::UnknownWorkerType(_)
                | EngineError::MissingCredential { .. }
        )
    }

    /// Transient errors are tolerated or escalated by the failure policy.
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), EngineError::Fetch(_) | EngineError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), EngineError::Cancelled)
    }

    /// Reason recorded on a job that ends with this error.
    pub fn failure_reason(&self) -> String {
        if self.is_cancelled() {
            "cancelled".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Adds operation context to an error at a call boundary.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| EngineError::Context {
            context: context.into(),
            source: Box::new(source),
        })
    }

    fn with_context<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|source| EngineError::Context {
            context: f().into(),
            source: Box::new(source),
        })
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
