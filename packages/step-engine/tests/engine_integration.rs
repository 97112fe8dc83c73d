//! End-to-end tests for step execution.
//!
//! These drive the public API the way the binary does:
//! 1. Resolve and run a step through `StepEngine`
//! 2. Drain dispatched batches through an in-process `BatchRunner`
//! 3. Settle the parent from its child statistics

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use step_engine::security::{ApiKeyResolver, KeyValueStore};
use step_engine::stores::{MemoryDocumentStore, MemoryJobStore, MemoryKvStore};
use step_engine::testing::{RecordingTransport, ScriptedCompetitors, ScriptedMarketData};
use step_engine::types::ErrorStrategy;
use step_engine::workers::{LocalDirBatchExecutor, LocalDirWorker, MarketCompetitorWorker, StockDataCollectionWorker};
use step_engine::{
    BatchRunner, ChannelTransport, EngineConfig, EngineError, ExecutorRegistry, JobDefinition, JobManager, JobStatus,
    JobStep, StepEngine, WorkerRegistry,
};

fn write(base: &Path, rel: &str, content: &str) {
    let path = base.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Engine wired with the local directory worker and its batch executor.
struct LocalDirHarness {
    engine: StepEngine,
    runner: BatchRunner,
    documents: Arc<MemoryDocumentStore>,
}

fn local_dir_harness(batch_size: usize) -> LocalDirHarness {
    let (transport, receiver) = ChannelTransport::new();
    let jobs = Arc::new(JobManager::new(Arc::new(MemoryJobStore::new()), Arc::new(transport)));
    let documents = Arc::new(MemoryDocumentStore::new());
    let config = EngineConfig {
        batch_size,
        ..Default::default()
    };

    let mut workers = WorkerRegistry::new();
    workers.register(LocalDirWorker::new(jobs.clone(), &config));

    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(LocalDirBatchExecutor::new(jobs.clone(), documents.clone())));

    LocalDirHarness {
        engine: StepEngine::new(Arc::new(workers), jobs.clone()),
        runner: BatchRunner::new(jobs, Arc::new(executors), receiver),
        documents,
    }
}

fn index_step(dir: &Path) -> JobStep {
    JobStep::new("index", "local_dir")
        .with("dir_path", dir.to_string_lossy().to_string())
        .with("extensions", json!([".rs", ".md"]))
}

#[tokio::test]
async fn test_local_dir_step_completes_after_batches_drain() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "src/lib.rs", "pub mod a;\n");
    write(dir.path(), "src/a.rs", "pub fn a() {}\n");
    write(dir.path(), "src/b.rs", "pub fn b() {}\n");
    write(dir.path(), "docs/guide.md", "# Guide\n");
    write(dir.path(), "README.md", "# Readme\n");
    write(dir.path(), "target/debug/out.rs", "// generated\n");

    let mut h = local_dir_harness(2);
    let step = index_step(dir.path());
    let definition = JobDefinition::new("index-repo", vec![step.clone()]);
    h.engine.verify(&definition).unwrap();

    let cancel = CancellationToken::new();
    let outcome = assert_ok!(h.engine.run_step(&cancel, &definition, &step, None).await);

    assert!(outcome.returns_child_jobs);
    let parent = h.engine.jobs().get_job(outcome.job_id).await.unwrap();
    assert_eq!(parent.status, JobStatus::Running);

    // 5 files at 2 per batch
    let children = h.engine.jobs().list_child_jobs(outcome.job_id).await.unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.job_type == "local_dir_batch"));

    let summary = h.runner.drain(&cancel).await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.completed, 3);

    let status = h.engine.settle_parent(outcome.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(h.documents.document_count(), 5);

    let mut source_ids: Vec<_> = h.documents.documents().into_iter().map(|d| d.source_id).collect();
    source_ids.sort();
    assert_eq!(source_ids, ["README.md", "docs/guide.md", "src/a.rs", "src/b.rs", "src/lib.rs"]);

    let logs = h.engine.jobs().get_job_logs(outcome.job_id).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "All 3 batch jobs completed"));
    assert!(logs.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn test_rerunning_local_dir_step_upserts_documents() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "src/lib.rs", "pub mod a;\n");
    write(dir.path(), "README.md", "# Readme\n");

    let mut h = local_dir_harness(10);
    let step = index_step(dir.path());
    let definition = JobDefinition::new("index-repo", vec![step.clone()]);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let outcome = h.engine.run_step(&cancel, &definition, &step, None).await.unwrap();
        h.runner.drain(&cancel).await;
        assert_eq!(h.engine.settle_parent(outcome.job_id).await.unwrap(), JobStatus::Completed);
    }

    assert_eq!(h.documents.document_count(), 2);
    assert_eq!(h.documents.save_count(), 4);
}

#[tokio::test]
async fn test_parent_fails_when_a_batch_cannot_read_its_files() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.md", "# A\n");
    write(dir.path(), "b.md", "# B\n");

    let mut h = local_dir_harness(1);
    let step = index_step(dir.path());
    let definition = JobDefinition::new("index-repo", vec![step.clone()]);
    let cancel = CancellationToken::new();

    let outcome = h.engine.run_step(&cancel, &definition, &step, None).await.unwrap();
    // Planned but gone before the batch runs
    std::fs::remove_file(dir.path().join("b.md")).unwrap();

    let summary = h.runner.drain(&cancel).await;
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    assert_eq!(h.engine.settle_parent(outcome.job_id).await.unwrap(), JobStatus::Failed);
    let parent = h.engine.jobs().get_job(outcome.job_id).await.unwrap();
    assert_eq!(parent.error.as_deref(), Some("1 of 2 batch jobs failed"));
    assert_eq!(h.documents.document_count(), 1);
}

fn market_engine(provider: ScriptedMarketData, identifier: ScriptedCompetitors) -> (StepEngine, Arc<MemoryDocumentStore>) {
    let jobs = Arc::new(JobManager::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(RecordingTransport::new()),
    ));
    let documents = Arc::new(MemoryDocumentStore::new());
    let provider = Arc::new(provider);
    let config = EngineConfig::default();

    let kv = Arc::new(MemoryKvStore::new());
    kv.set("competitor_llm_key", "kv-secret");

    let mut workers = WorkerRegistry::new();
    workers.register(StockDataCollectionWorker::new(
        jobs.clone(),
        documents.clone(),
        documents.clone(),
        provider.clone(),
        &config,
    ));
    workers.register(MarketCompetitorWorker::new(
        jobs.clone(),
        documents.clone(),
        provider,
        Arc::new(identifier),
        ApiKeyResolver::new("STEP_ENGINE_INTEGRATION_TEST", Some(kv as Arc<dyn KeyValueStore>)),
        &config,
    ));

    (StepEngine::new(Arc::new(workers), jobs), documents)
}

#[tokio::test]
async fn test_strict_collection_fails_when_one_artifact_is_missing() {
    let (engine, documents) = market_engine(
        ScriptedMarketData::new().fail_announcements("CBA", "upstream 503"),
        ScriptedCompetitors::new(),
    );
    let step = JobStep::new("collect", "stock_data_collection").with("tickers", json!(["BHP", "CBA"]));
    let definition = JobDefinition::new("portfolio", vec![step.clone()]);

    let err = assert_err!(
        engine
            .run_step(&CancellationToken::new(), &definition, &step, None)
            .await
    );

    match err.root() {
        EngineError::DeadMan { expected, actual, .. } => {
            // XJO benchmark plus stock and announcements per ticker
            assert_eq!(*expected, 5);
            assert_eq!(*actual, 4);
        }
        other => panic!("expected dead-man failure, got {other:?}"),
    }
    // Artifacts that did land are kept
    assert_eq!(documents.document_count(), 4);
}

#[tokio::test]
async fn test_best_effort_competitors_complete_with_partial_results() {
    let (engine, documents) = market_engine(
        ScriptedMarketData::new().fail_stock("XRO", "timeout"),
        ScriptedCompetitors::new()
            .respond("GNP", r#"["XRO", "WTC"]"#)
            .fail("WES", "rate limited"),
    );
    let step = JobStep::new("competitors", "market_competitor")
        .with("asx_codes", json!(["GNP", "WES"]))
        .with("api_key", "{competitor_llm_key}");
    let definition = JobDefinition::new("peers", vec![step.clone()]);

    let outcome = assert_ok!(
        engine
            .run_step(&CancellationToken::new(), &definition, &step, None)
            .await
    );

    let job = engine.jobs().get_job(outcome.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["documents_created"], 1);
    assert_eq!(documents.document_count(), 1);

    let logs = engine.jobs().get_job_logs(outcome.job_id).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "Completed 1/2 target tickers successfully"));
}

#[test]
fn test_definition_parses_with_defaults() {
    let definition: JobDefinition = serde_json::from_value(json!({
        "name": "nightly",
        "steps": [
            { "name": "index", "type": "local_dir", "config": { "dir_path": "/srv/repo" } },
            { "name": "collect", "type": "stock_data_collection", "on_error": "continue" }
        ]
    }))
    .unwrap();

    assert_eq!(definition.steps.len(), 2);
    assert_eq!(definition.steps[0].on_error, ErrorStrategy::Fail);
    assert_eq!(definition.steps[1].on_error, ErrorStrategy::Continue);
    assert_eq!(definition.step("index").unwrap().config["dir_path"], "/srv/repo");
}
