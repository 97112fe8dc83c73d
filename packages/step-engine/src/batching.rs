//! Batching engine.
//!
//! Splits an ordered work set into contiguous groups and packs each group
//! into a single queued child job, so the number of persisted job records
//! is bounded by `ceil(N / batch_size)` rather than by `N`.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::jobs::{JobManager, QueueJob, PHASE_EXECUTION};
use crate::types::{ConfigMap, WorkItem};

/// Split `items` into order-preserving batches of at most `batch_size`.
///
/// The last batch holds the remainder. An empty work set yields no batches.
pub fn plan_batches(items: &[WorkItem], batch_size: usize) -> Result<Vec<&[WorkItem]>> {
    if batch_size == 0 {
        return Err(EngineError::invalid_config("batching", "batch_size must be greater than 0"));
    }
    Ok(items.chunks(batch_size).collect())
}

/// Describes the child jobs a parallel step should produce.
#[derive(Debug, Clone)]
pub struct BatchDispatch {
    /// Step job the batches belong to
    pub parent_id: Uuid,
    /// Queue job type, resolved by the consumer's executor registry
    pub job_type: String,
    /// Human label appended to each batch name
    pub label: String,
    pub batch_size: usize,
    /// Worker fields merged into every batch config
    pub extra: ConfigMap,
}

/// What `dispatch_batches` managed to enqueue.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub batch_count: usize,
    pub job_ids: Vec<Uuid>,
    /// `(batch_idx, error)` for batches that could not be created
    pub failed: Vec<(usize, String)>,
}

impl DispatchReport {
    pub fn dispatched(&self) -> usize {
        self.job_ids.len()
    }
}

/// Persist and enqueue one child job per batch.
///
/// A batch that fails to dispatch is logged and skipped. If every batch
/// fails the whole dispatch is a persistence error. Cancellation stops
/// dispatch immediately.
pub async fn dispatch_batches(
    cancel: &CancellationToken,
    jobs: &JobManager,
    dispatch: &BatchDispatch,
    items: &[WorkItem],
) -> Result<DispatchReport> {
    let batches = plan_batches(items, dispatch.batch_size)?;
    let batch_count = batches.len();
    let mut report = DispatchReport {
        batch_count,
        ..Default::default()
    };

    if batch_count == 0 {
        debug!(parent_id = %dispatch.parent_id, "no work items, nothing to dispatch");
        return Ok(report);
    }

    info!(
        parent_id = %dispatch.parent_id,
        job_type = %dispatch.job_type,
        total_items = items.len(),
        batch_size = dispatch.batch_size,
        batch_count,
        "creating batch jobs"
    );

    for (batch_idx, batch) in batches.into_iter().enumerate() {
        let job = batch_job(dispatch, batch_idx, batch_count, batch)?;

        match jobs.create_child_job(cancel, job).await {
            Ok(job) => {
                debug!(
                    job_id = %job.id,
                    batch = batch_idx,
                    items_in_batch = batch.len(),
                    "batch job enqueued"
                );
                report.job_ids.push(job.id);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    parent_id = %dispatch.parent_id,
                    batch = batch_idx,
                    error = %e,
                    "failed to create batch job"
                );
                report.failed.push((batch_idx, e.to_string()));
            }
        }
    }

    if report.job_ids.is_empty() {
        let last = report
            .failed
            .last()
            .map(|(idx, e)| format!("batch {idx}: {e}"))
            .unwrap_or_default();
        return Err(EngineError::persistence(format!(
            "failed to create any of {batch_count} batch jobs ({last})"
        )));
    }

    info!(
        parent_id = %dispatch.parent_id,
        batches_created = report.dispatched(),
        batches_failed = report.failed.len(),
        "batch jobs created and enqueued"
    );
    Ok(report)
}

fn batch_job(dispatch: &BatchDispatch, batch_idx: usize, batch_count: usize, batch: &[WorkItem]) -> Result<QueueJob> {
    let mut config = dispatch.extra.clone();
    config.insert("batch_idx".into(), json!(batch_idx));
    config.insert("batch_count".into(), json!(batch_count));
    config.insert("batch_size".into(), json!(batch.len()));
    config.insert("items".into(), serde_json::to_value(batch)?);

    Ok(QueueJob::builder()
        .parent_id(dispatch.parent_id)
        .job_type(dispatch.job_type.clone())
        .name(format!("Batch {}/{}: {}", batch_idx + 1, batch_count, dispatch.label))
        .phase(PHASE_EXECUTION)
        .config(Value::Object(config))
        .progress_total(batch.len() as i64)
        .build())
}
