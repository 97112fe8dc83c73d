//! Queue job records, lifecycle management, and batch execution.
//!
//! # Architecture
//!
//! ```text
//! Worker.create_jobs (parallel strategy)
//!     │
//!     └─► batching::dispatch_batches
//!             ├─► JobManager.create_job_record   (persist, pending)
//!             └─► JobManager.enqueue             (QueueTransport)
//!
//! BatchRunner
//!     │
//!     ├─► Receive QueueMessage (ChannelTransport)
//!     ├─► Resolve JobExecutor by job type
//!     ├─► pending -> running
//!     ├─► JobExecutor.execute(job)
//!     └─► running -> completed | failed
//! ```
//!
//! Step completion for parallel steps is a reduction over child statuses,
//! which the orchestrator computes from `JobManager::get_child_stats`.

mod job;
pub mod manager;
pub mod runner;

pub use job::{
    ChildStats, JobLogEntry, JobStatus, LogLevel, QueueJob, PHASE_EXECUTION, PHASE_INIT,
    PHASE_RUN,
};
pub use manager::JobManager;
pub use runner::{
    BatchRunner, BatchRunnerConfig, ChannelTransport, ExecutorRegistry, JobExecutor, RunSummary,
};
