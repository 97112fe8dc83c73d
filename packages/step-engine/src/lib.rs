//! # Step Engine
//!
//! Execution engine for multi-step data-collection jobs. A job definition
//! is an ordered list of steps; each step names a worker type, and the
//! worker plans its work and then either executes it inline or dispatches
//! it as batched child jobs on a queue.
//!
//! ## Architecture
//!
//! ```text
//! StepEngine.run_step(definition, step)
//!     │
//!     ├─► WorkerRegistry.resolve(step.type)
//!     ├─► JobManager.create_job_record        (step job: pending -> running)
//!     │
//!     └─► Worker.create_jobs
//!             │
//!             ├─ Inline ────► fetch_or_reuse per item ─► DocumentStore
//!             │                   │
//!             │                   └─► FailurePolicy.verify (best-effort | strict)
//!             │
//!             └─ Parallel ──► dispatch_batches ─► QueueTransport
//!                                                     │
//!                                                     ▼
//!                                    BatchRunner ─► JobExecutor.execute
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Bounded job records** - a parallel step over N items creates
//!    `ceil(N / batch_size)` child jobs, never N
//! 2. **Idempotent artifacts** - documents are upserted by
//!    `(source_type, source_id)`; a fresh document is reused, not refetched
//! 3. **Explicit failure policy** - every worker declares best-effort or
//!    strict; strict steps fail when any planned artifact is missing
//! 4. **Queryable lifecycle** - every job is persisted before it is
//!    enqueued, and status moves only along `pending -> running -> terminal`
//!
//! ## Example
//!
//! ```ignore
//! use step_engine::{EngineConfig, JobManager, StepEngine, WorkerRegistry};
//! use step_engine::stores::{MemoryDocumentStore, MemoryJobStore};
//! use step_engine::workers::LocalDirWorker;
//!
//! let config = EngineConfig::from_env()?;
//! let (transport, receiver) = ChannelTransport::new();
//! let jobs = Arc::new(JobManager::new(Arc::new(MemoryJobStore::new()), Arc::new(transport)));
//!
//! let mut registry = WorkerRegistry::new();
//! registry.register(LocalDirWorker::new(jobs.clone(), &config));
//!
//! let engine = StepEngine::new(Arc::new(registry), jobs);
//! engine.verify(&definition)?;
//! let outcome = engine.run_step(&cancel, &definition, &definition.steps[0], None).await?;
//! ```

pub mod batching;
pub mod config;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod jobs;
pub mod policy;
pub mod security;
pub mod stores;
pub mod traits;
pub mod types;
pub mod workers;

// Mock collaborators for tests (also used by downstream crates)
pub mod testing;

// Re-export the engine facade
pub use config::EngineConfig;
pub use engine::{StepEngine, StepOutcome};

// Re-export error types
pub use error::{EngineError, Result, ResultExt};

// Re-export job lifecycle types
pub use jobs::{
    BatchRunner, ChannelTransport, ChildStats, ExecutorRegistry, JobExecutor, JobManager, JobStatus, LogLevel,
    QueueJob,
};

// Re-export policy and freshness helpers
pub use freshness::{fetch_or_reuse, is_fresh, FreshnessPolicy};
pub use policy::{ExpectedCount, FailurePolicy, OutcomeTally};

// Re-export collaborator traits
pub use traits::documents::{DocumentStore, SearchOptions, SearchService};
pub use traits::market::{CompetitorIdentifier, FetchedContent, MarketDataProvider};
pub use traits::queue::{JobRecordStore, QueueMessage, QueueTransport};

// Re-export domain types
pub use types::{ConfigMap, Document, InitResult, JobDefinition, JobStep, Strategy, Ticker, WorkItem};

// Re-export the worker contract
pub use workers::{DynWorker, Worker, WorkerRegistry};
