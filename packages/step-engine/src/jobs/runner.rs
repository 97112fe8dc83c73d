//! In-process batch runner.
//!
//! The engine itself only produces queued units of work. `BatchRunner` is
//! the consumer side for single-process deployments and tests: it receives
//! messages from a `ChannelTransport`, resolves an executor by job type, and
//! drives each job through `running -> completed | failed`.
//!
//! # Example
//!
//! ```ignore
//! let (transport, receiver) = ChannelTransport::new();
//! let jobs = Arc::new(JobManager::new(store, Arc::new(transport)));
//!
//! let mut executors = ExecutorRegistry::new();
//! executors.register(Arc::new(LocalDirBatchExecutor::new(jobs.clone(), documents)));
//!
//! let runner = BatchRunner::new(jobs, Arc::new(executors), receiver);
//! tokio::spawn(runner.run(cancel.child_token()));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{JobStatus, QueueJob};
use super::manager::JobManager;
use crate::error::{EngineError, Result};
use crate::traits::queue::{QueueMessage, QueueTransport};

/// Executes one queued job of a given type.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn execute(&self, cancel: &CancellationToken, job: &QueueJob) -> Result<()>;
}

/// Maps job type strings to executors.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(executor.job_type(), executor);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.executors.keys().copied().collect()
    }
}

/// Queue transport backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<QueueMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl QueueTransport for ChannelTransport {
    async fn enqueue(&self, message: QueueMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| EngineError::persistence("queue channel closed"))
    }
}

/// Configuration for the batch runner.
#[derive(Debug, Clone)]
pub struct BatchRunnerConfig {
    /// Jobs executed at once
    pub concurrency: usize,
    /// Runner ID for log correlation
    pub runner_id: String,
}

impl Default for BatchRunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            runner_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

impl BatchRunnerConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Default::default()
        }
    }
}

/// Counts from one runner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct BatchRunner {
    jobs: Arc<JobManager>,
    executors: Arc<ExecutorRegistry>,
    receiver: mpsc::UnboundedReceiver<QueueMessage>,
    config: BatchRunnerConfig,
}

impl BatchRunner {
    pub fn new(
        jobs: Arc<JobManager>,
        executors: Arc<ExecutorRegistry>,
        receiver: mpsc::UnboundedReceiver<QueueMessage>,
    ) -> Self {
        Self::with_config(jobs, executors, receiver, BatchRunnerConfig::default())
    }

    pub fn with_config(
        jobs: Arc<JobManager>,
        executors: Arc<ExecutorRegistry>,
        receiver: mpsc::UnboundedReceiver<QueueMessage>,
        config: BatchRunnerConfig,
    ) -> Self {
        Self {
            jobs,
            executors,
            receiver,
            config,
        }
    }

    /// Run until the channel closes or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> RunSummary {
        info!(
            runner_id = %self.config.runner_id,
            concurrency = self.config.concurrency,
            "batch runner starting"
        );

        let BatchRunner {
            jobs,
            executors,
            receiver,
            config,
        } = self;

        let messages = stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })
        .take_until(cancel.clone().cancelled_owned());

        let summary = process_all(&jobs, &executors, &cancel, config.concurrency, messages).await;
        info!(runner_id = %config.runner_id, ?summary, "batch runner stopped");
        summary
    }

    /// Process every message queued right now, then return.
    pub async fn drain(&mut self, cancel: &CancellationToken) -> RunSummary {
        let mut pending = Vec::new();
        while let Ok(msg) = self.receiver.try_recv() {
            pending.push(msg);
        }
        debug!(count = pending.len(), "draining queued jobs");

        process_all(
            &self.jobs,
            &self.executors,
            cancel,
            self.config.concurrency,
            stream::iter(pending),
        )
        .await
    }
}

async fn process_all<S>(
    jobs: &Arc<JobManager>,
    executors: &Arc<ExecutorRegistry>,
    cancel: &CancellationToken,
    concurrency: usize,
    messages: S,
) -> RunSummary
where
    S: futures::Stream<Item = QueueMessage>,
{
    messages
        .map(|msg| process_one(jobs, executors, cancel, msg))
        .buffer_unordered(concurrency.max(1))
        .fold(RunSummary::default(), |mut summary, completed| async move {
            summary.processed += 1;
            if completed {
                summary.completed += 1;
            } else {
                summary.failed += 1;
            }
            summary
        })
        .await
}

/// Drive one job to a terminal status. Returns true when it completed.
async fn process_one(
    jobs: &JobManager,
    executors: &ExecutorRegistry,
    cancel: &CancellationToken,
    msg: QueueMessage,
) -> bool {
    let job_id = msg.job_id;

    let Some(executor) = executors.get(&msg.job_type) else {
        warn!(job_id = %job_id, job_type = %msg.job_type, "no executor registered");
        fail(jobs, job_id, &format!("Unknown job type: {}", msg.job_type)).await;
        return false;
    };

    let job = match jobs.update_job_status(job_id, JobStatus::Running).await {
        Ok(job) => job,
        Err(e) => {
            // Duplicate delivery of a finished job, or a job that failed at enqueue
            warn!(job_id = %job_id, error = %e, "skipping job that cannot start");
            return false;
        }
    };

    debug!(job_id = %job_id, job_type = %job.job_type, name = %job.name, "executing job");

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = executor.execute(cancel, &job) => result,
    };

    match result {
        Ok(()) => match jobs.update_job_status(job_id, JobStatus::Completed).await {
            Ok(_) => {
                info!(job_id = %job_id, "job completed");
                true
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to mark job completed");
                false
            }
        },
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "job failed");
            fail(jobs, job_id, &e.failure_reason()).await;
            false
        }
    }
}

async fn fail(jobs: &JobManager, job_id: Uuid, reason: &str) {
    if let Err(e) = jobs.mark_failed(job_id, reason).await {
        error!(job_id = %job_id, error = %e, "failed to mark job failed");
    }
}
