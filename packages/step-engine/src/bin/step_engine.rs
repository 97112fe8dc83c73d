use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use step_engine::jobs::BatchRunnerConfig;
use step_engine::stores::{MemoryDocumentStore, MemoryJobStore};
use step_engine::types::ErrorStrategy;
use step_engine::workers::{LocalDirBatchExecutor, LocalDirWorker};
use step_engine::{
    BatchRunner, ChannelTransport, EngineConfig, ExecutorRegistry, JobDefinition, JobManager, JobRecordStore,
    JobStatus, StepEngine, WorkerRegistry,
};

#[derive(Parser)]
#[command(name = "step-engine")]
#[command(about = "Run multi-step data-collection job definitions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every step of a job definition in order
    Run {
        /// Path to the job definition (JSON)
        definition: PathBuf,

        /// Run only the named step
        #[arg(long)]
        step: Option<String>,

        /// Override the work items per batch job
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Check that every step resolves to a worker and validates
    Verify {
        /// Path to the job definition (JSON)
        definition: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,step_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            definition,
            step,
            batch_size,
        } => {
            if let Some(size) = batch_size {
                if size == 0 {
                    bail!("--batch-size must be greater than 0");
                }
                config.batch_size = size;
            }
            let definition = load_definition(&definition).await?;
            run(config, definition, step).await
        }
        Commands::Verify { definition } => {
            let definition = load_definition(&definition).await?;
            let app = App::new(&config).await?;
            app.engine.verify(&definition)?;
            println!(
                "{} {} ({} steps) is valid",
                "✓".green(),
                definition.name.bold(),
                definition.steps.len()
            );
            Ok(())
        }
    }
}

async fn load_definition(path: &Path) -> Result<JobDefinition> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid job definition in {}", path.display()))
}

/// Job records go to Postgres when `DATABASE_URL` is set and the binary
/// was built with the `postgres` feature, otherwise they stay in memory.
#[cfg(feature = "postgres")]
async fn job_store(config: &EngineConfig) -> Result<Arc<dyn JobRecordStore>> {
    match &config.database_url {
        Some(url) => {
            let store = step_engine::stores::PostgresJobStore::connect(url)
                .await
                .context("Failed to connect to job database")?;
            info!("Using PostgreSQL job store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryJobStore::new())),
    }
}

#[cfg(not(feature = "postgres"))]
async fn job_store(config: &EngineConfig) -> Result<Arc<dyn JobRecordStore>> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but this build has no postgres support, keeping job records in memory");
    }
    Ok(Arc::new(MemoryJobStore::new()))
}

/// In-process wiring: a channel-backed queue over the configured job store.
struct App {
    engine: StepEngine,
    documents: Arc<MemoryDocumentStore>,
    runner: BatchRunner,
}

impl App {
    async fn new(config: &EngineConfig) -> Result<Self> {
        let (transport, receiver) = ChannelTransport::new();
        let jobs = Arc::new(JobManager::new(job_store(config).await?, Arc::new(transport)));
        let documents = Arc::new(MemoryDocumentStore::new());

        let mut workers = WorkerRegistry::new();
        workers.register(LocalDirWorker::new(jobs.clone(), config));

        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(LocalDirBatchExecutor::new(jobs.clone(), documents.clone())));

        let runner = BatchRunner::with_config(
            jobs.clone(),
            Arc::new(executors),
            receiver,
            BatchRunnerConfig::with_concurrency(config.runner_concurrency),
        );

        Ok(Self {
            engine: StepEngine::new(Arc::new(workers), jobs),
            documents,
            runner,
        })
    }
}

async fn run(config: EngineConfig, definition: JobDefinition, only: Option<String>) -> Result<()> {
    let mut app = App::new(&config).await?;
    app.engine.verify(&definition)?;

    let steps: Vec<_> = match &only {
        Some(name) => match definition.step(name) {
            Some(step) => vec![step.clone()],
            None => bail!("No step named '{}' in {}", name, definition.name),
        },
        None => definition.steps.clone(),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    info!(definition = %definition.name, steps = steps.len(), "Running job definition");

    let mut failed_steps = 0usize;
    for step in &steps {
        let outcome = match app.engine.run_step(&cancel, &definition, step, None).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), step.name.bold(), e);
                failed_steps += 1;
                match step.on_error {
                    ErrorStrategy::Continue => continue,
                    ErrorStrategy::Fail => return Err(e.into()),
                }
            }
        };

        let status = if outcome.returns_child_jobs {
            let summary = app.runner.drain(&cancel).await;
            info!(step = %step.name, ?summary, "Batch jobs drained");
            app.engine.settle_parent(outcome.job_id).await?
        } else {
            app.engine.jobs().get_job(outcome.job_id).await?.status
        };

        let stats = app.engine.jobs().get_child_stats(outcome.job_id).await?;
        let marker = if status == JobStatus::Failed { "✗".red() } else { "✓".green() };
        println!("{} {} [{}] job {}", marker, step.name.bold(), status, outcome.job_id);
        if stats.total > 0 {
            println!(
                "    batches: {} total, {} completed, {} failed",
                stats.total, stats.completed, stats.failed
            );
        }

        if status == JobStatus::Failed {
            failed_steps += 1;
            if step.on_error == ErrorStrategy::Fail {
                bail!("Step '{}' failed", step.name);
            }
        }
    }

    println!("{} {}", "Documents stored:".cyan(), app.documents.document_count());
    if failed_steps > 0 {
        bail!("{} step(s) failed", failed_steps);
    }
    Ok(())
}
