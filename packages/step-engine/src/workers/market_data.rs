//! Freshness-cached market data workers.
//!
//! One worker implementation serves three step types, selected by
//! [`MarketDataKind`]:
//!
//! | Step type             | Source id                   | Default period |
//! |-----------------------|-----------------------------|----------------|
//! | `asx_stock_collector` | `asx:<CODE>:stock_collector` | `Y2`          |
//! | `asx_announcements`   | `asx:<CODE>:announcements`  | `M6`           |
//! | `asx_index_data`      | `asx:<CODE>:index`          | `Y2`           |
//!
//! Each runs inline and looks up the stored document before fetching. The
//! composite workers (`stock_data_collection`, `market_competitor`) call
//! [`MarketDataWorker::collect`] directly so that each sub-fetch reports
//! its own result to their failure policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::Worker;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, ResultExt};
use crate::freshness::{fetch_or_reuse, CachedFetch, FreshnessPolicy};
use crate::jobs::{JobManager, LogLevel};
use crate::policy::{FailurePolicy, OutcomeTally};
use crate::traits::documents::DocumentStore;
use crate::traits::market::{FetchedContent, MarketDataProvider};
use crate::types::{Document, InitResult, JobDefinition, JobStep, SourceKey, Ticker, WorkItem, WorkerOutcome};

/// Which market data a [`MarketDataWorker`] collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketDataKind {
    Stock,
    Announcements,
    Index,
}

impl MarketDataKind {
    pub fn worker_type(&self) -> &'static str {
        match self {
            MarketDataKind::Stock => "asx_stock_collector",
            MarketDataKind::Announcements => "asx_announcements",
            MarketDataKind::Index => "asx_index_data",
        }
    }

    pub fn default_period(&self) -> &'static str {
        match self {
            MarketDataKind::Stock | MarketDataKind::Index => "Y2",
            MarketDataKind::Announcements => "M6",
        }
    }

    /// Idempotency key for `ticker`'s document of this kind.
    pub fn source_key(&self, ticker: &Ticker) -> SourceKey {
        let suffix = match self {
            MarketDataKind::Stock => "stock_collector",
            MarketDataKind::Announcements => "announcements",
            MarketDataKind::Index => "index",
        };
        SourceKey::new(self.worker_type(), ticker.source_id(suffix))
    }

    fn default_tags(&self, ticker: &Ticker) -> Vec<String> {
        let code = ticker.code.to_lowercase();
        match self {
            MarketDataKind::Stock => vec!["asx-stock-data".into(), code],
            MarketDataKind::Announcements => vec!["asx-announcement-summary".into(), code],
            MarketDataKind::Index => vec!["asx-index".into(), code, "benchmark".into()],
        }
    }
}

/// Step config shared by the three market data step types.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MarketStepConfig {
    ticker: Option<String>,
    asx_code: Option<String>,
    tickers: Vec<String>,
    asx_codes: Vec<String>,
    period: Option<String>,
    cache_hours: Option<i64>,
    force_refresh: bool,
    output_tags: Vec<String>,
}

impl MarketStepConfig {
    /// Targets from every ticker field, de-duplicated in order.
    fn targets(&self) -> Vec<Ticker> {
        let raw = self
            .ticker
            .iter()
            .chain(self.asx_code.iter())
            .chain(self.tickers.iter())
            .chain(self.asx_codes.iter());
        let mut targets: Vec<Ticker> = Vec::new();
        for ticker in Ticker::parse_all(raw) {
            if !targets.contains(&ticker) {
                targets.push(ticker);
            }
        }
        targets
    }
}

/// Planning data for a market data step.
#[derive(Debug, Clone)]
pub struct MarketPlan {
    pub targets: Vec<Ticker>,
    pub period: String,
    pub freshness: FreshnessPolicy,
    pub output_tags: Vec<String>,
}

pub struct MarketDataWorker {
    kind: MarketDataKind,
    jobs: Arc<JobManager>,
    documents: Arc<dyn DocumentStore>,
    provider: Arc<dyn MarketDataProvider>,
    cache_hours: i64,
    fetch_timeout: Duration,
}

impl MarketDataWorker {
    pub fn new(
        kind: MarketDataKind,
        jobs: Arc<JobManager>,
        documents: Arc<dyn DocumentStore>,
        provider: Arc<dyn MarketDataProvider>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            kind,
            jobs,
            documents,
            provider,
            cache_hours: config.cache_hours,
            fetch_timeout: config.fetch_timeout,
        }
    }

    pub fn kind(&self) -> MarketDataKind {
        self.kind
    }

    /// Default freshness for callers that do not override it.
    pub fn default_freshness(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(self.cache_hours, false)
    }

    /// Fetch (or reuse) the document for one ticker and log the decision to
    /// the step job.
    pub async fn collect(
        &self,
        cancel: &CancellationToken,
        step_job_id: Uuid,
        ticker: &Ticker,
        period: &str,
        freshness: FreshnessPolicy,
        output_tags: &[String],
    ) -> Result<CachedFetch> {
        let key = self.kind.source_key(ticker);
        let kind = self.kind;
        let provider = self.provider.clone();

        let fetched = fetch_or_reuse(
            cancel,
            self.documents.as_ref(),
            &key,
            freshness,
            self.fetch_timeout,
            || async move {
                let content = match kind {
                    MarketDataKind::Stock => provider.fetch_stock(ticker, period).await,
                    MarketDataKind::Announcements => provider.fetch_announcements(ticker, period).await,
                    MarketDataKind::Index => provider.fetch_index(&ticker.code, period).await,
                }?;
                Ok::<_, EngineError>(self.to_document(content, ticker, period, output_tags))
            },
        )
        .await
        .with_context(|| format!("{} {}", kind.worker_type(), ticker))?;

        let message = if fetched.from_cache {
            let synced = fetched
                .document
                .last_synced
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            format!("{ticker} - Using cached data (last synced: {synced})")
        } else {
            format!("{ticker} - Fetched {} data", self.kind.worker_type())
        };
        self.jobs.log_or_warn(step_job_id, LogLevel::Info, &message).await;

        Ok(fetched)
    }

    fn to_document(&self, content: FetchedContent, ticker: &Ticker, period: &str, output_tags: &[String]) -> Document {
        let mut tags = self.kind.default_tags(ticker);
        for tag in output_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let mut metadata = content.metadata;
        metadata.insert("ticker".into(), json!(ticker.to_string()));
        metadata.insert("asx_code".into(), json!(ticker.code));
        metadata.insert("period".into(), json!(period));

        let key = self.kind.source_key(ticker);
        let builder = Document::builder()
            .source_type(key.source_type)
            .source_id(key.source_id)
            .title(content.title)
            .content_markdown(content.content_markdown)
            .metadata(metadata)
            .tags(tags);
        match content.url {
            Some(url) => builder.url(url).build(),
            None => builder.build(),
        }
    }
}

#[async_trait]
impl Worker for MarketDataWorker {
    type Plan = MarketPlan;

    fn worker_type(&self) -> &'static str {
        self.kind.worker_type()
    }

    fn validate_config(&self, step: &JobStep) -> Result<()> {
        let config: MarketStepConfig = step.parse_config()?;
        if config.targets().is_empty() {
            return Err(EngineError::invalid_config(
                self.worker_type(),
                format!(
                    "step '{}' requires 'ticker', 'asx_code', 'tickers', or 'asx_codes'",
                    step.name
                ),
            ));
        }
        Ok(())
    }

    async fn init(
        &self,
        _cancel: &CancellationToken,
        step: &JobStep,
        _definition: &JobDefinition,
    ) -> Result<InitResult<MarketPlan>> {
        self.validate_config(step)?;
        let config: MarketStepConfig = step.parse_config()?;

        let targets = config.targets();
        let period = config
            .period
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.kind.default_period().to_string());
        let freshness = FreshnessPolicy::new(config.cache_hours.unwrap_or(self.cache_hours), config.force_refresh);

        info!(
            phase = "init",
            step = %step.name,
            worker_type = self.worker_type(),
            ticker_count = targets.len(),
            period = %period,
            "market data worker initialized"
        );

        let items = targets
            .iter()
            .map(|t| {
                WorkItem::new(t.code.clone(), format!("Fetch {t} {}", self.worker_type()), self.worker_type())
                    .with_config(json!({ "ticker": t.to_string(), "period": period }))
            })
            .collect();

        Ok(InitResult::inline(
            items,
            MarketPlan {
                targets,
                period,
                freshness,
                output_tags: config.output_tags,
            },
        ))
    }

    async fn create_jobs(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
        step_job_id: Uuid,
        init: Option<InitResult<MarketPlan>>,
    ) -> Result<Uuid> {
        let init = match init {
            Some(init) => init,
            None => self.init(cancel, step, definition).await?,
        };
        let plan = init.plan;

        let mut tally = OutcomeTally::new();
        let mut outcome = WorkerOutcome::for_source(self.worker_type());

        for ticker in &plan.targets {
            let result = self
                .collect(cancel, step_job_id, ticker, &plan.period, plan.freshness, &plan.output_tags)
                .await;
            match result {
                Ok(fetched) => {
                    outcome.record(&fetched.document);
                    tally.success(ticker.to_string(), 1);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.jobs
                        .log_or_warn(step_job_id, LogLevel::Error, &format!("{ticker} - Failed: {e}"))
                        .await;
                    outcome.errors.push(e.to_string());
                    tally.failure(ticker.to_string(), &e);
                }
            }
        }

        info!(
            step_job_id = %step_job_id,
            worker_type = self.worker_type(),
            documents = outcome.documents_created,
            errors = outcome.errors.len(),
            "market data collection complete"
        );

        if let Err(e) = self.jobs.set_job_result(step_job_id, &outcome).await {
            warn!(step_job_id = %step_job_id, error = %e, "failed to store worker result");
        }

        self.failure_policy().verify(&tally, None)?;
        Ok(step_job_id)
    }

    fn returns_child_jobs(&self) -> bool {
        false
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemoryDocumentStore, MemoryJobStore};
    use crate::testing::{RecordingTransport, ScriptedMarketData};
    use crate::jobs::QueueJob;

    struct Fixture {
        jobs: Arc<JobManager>,
        documents: Arc<MemoryDocumentStore>,
        provider: Arc<ScriptedMarketData>,
        step_job_id: Uuid,
    }

    async fn fixture(provider: ScriptedMarketData) -> Fixture {
        let jobs = Arc::new(JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RecordingTransport::new()),
        ));
        let step_job = jobs
            .create_job_record(QueueJob::builder().job_type("asx_stock_collector").name("step").build())
            .await
            .unwrap();
        Fixture {
            jobs,
            documents: Arc::new(MemoryDocumentStore::new()),
            provider: Arc::new(provider),
            step_job_id: step_job.id,
        }
    }

    fn worker(f: &Fixture, kind: MarketDataKind) -> MarketDataWorker {
        MarketDataWorker::new(kind, f.jobs.clone(), f.documents.clone(), f.provider.clone(), &EngineConfig::default())
    }

    async fn run(worker: &MarketDataWorker, f: &Fixture, step: &JobStep) -> Result<Uuid> {
        let definition = JobDefinition::new("def", vec![step.clone()]);
        worker
            .create_jobs(&CancellationToken::new(), step, &definition, f.step_job_id, None)
            .await
    }

    #[test]
    fn source_keys() {
        let gnp = Ticker::parse("ASX:GNP").unwrap();
        assert_eq!(
            MarketDataKind::Stock.source_key(&gnp).to_string(),
            "asx_stock_collector/asx:GNP:stock_collector"
        );
        assert_eq!(
            MarketDataKind::Announcements.source_key(&gnp).source_id,
            "asx:GNP:announcements"
        );
        let xjo = Ticker::parse("XJO").unwrap();
        assert_eq!(MarketDataKind::Index.source_key(&xjo).source_id, "asx:XJO:index");
    }

    #[tokio::test]
    async fn validate_requires_a_ticker_and_known_keys() {
        let f = fixture(ScriptedMarketData::new()).await;
        let worker = worker(&f, MarketDataKind::Stock);

        let err = worker.validate_config(&JobStep::new("s", "asx_stock_collector")).unwrap_err();
        assert!(err.is_configuration());

        let typo = JobStep::new("s", "asx_stock_collector").with("asx_code", "GNP").with("perod", "Y1");
        assert!(worker.validate_config(&typo).unwrap_err().is_configuration());

        let ok = JobStep::new("s", "asx_stock_collector").with("asx_code", "GNP");
        worker.validate_config(&ok).unwrap();
    }

    #[tokio::test]
    async fn idempotent_rerun_is_a_cache_hit() {
        let f = fixture(ScriptedMarketData::new()).await;
        let worker = worker(&f, MarketDataKind::Stock);
        let step = JobStep::new("stock", "asx_stock_collector").with("asx_code", "GNP");

        run(&worker, &f, &step).await.unwrap();
        run(&worker, &f, &step).await.unwrap();

        assert_eq!(f.provider.stock_fetches(), 1);
        assert_eq!(f.documents.save_count(), 1);
        let docs = f.documents.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "asx:GNP:stock_collector");
        assert!(docs[0].tags.contains(&"gnp".to_string()));

        let logs = f.jobs.get_job_logs(f.step_job_id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.starts_with("ASX:GNP - Using cached data")));
    }

    #[tokio::test]
    async fn force_refresh_refetches() {
        let f = fixture(ScriptedMarketData::new()).await;
        let worker = worker(&f, MarketDataKind::Stock);
        let step = JobStep::new("stock", "asx_stock_collector").with("asx_code", "GNP");
        run(&worker, &f, &step).await.unwrap();

        let refresh = step.clone().with("force_refresh", true);
        run(&worker, &f, &refresh).await.unwrap();

        assert_eq!(f.provider.stock_fetches(), 2);
        assert_eq!(f.documents.document_count(), 1);
    }

    #[tokio::test]
    async fn single_ticker_failure_fails_the_step() {
        let f = fixture(ScriptedMarketData::new().fail_announcements("GNP", "upstream 503")).await;
        let worker = worker(&f, MarketDataKind::Announcements);
        let step = JobStep::new("ann", "asx_announcements").with("asx_code", "GNP");

        let err = run(&worker, &f, &step).await.unwrap_err();

        assert!(matches!(err, EngineError::AllFailed { attempted: 1, .. }));
        assert!(err.to_string().contains("upstream 503"));
        assert_eq!(f.documents.document_count(), 0);
    }

    #[tokio::test]
    async fn partial_failure_records_outcome() {
        let f = fixture(ScriptedMarketData::new().fail_stock("BHP", "timeout")).await;
        let worker = worker(&f, MarketDataKind::Stock);
        let step = JobStep::new("stock", "asx_stock_collector").with("tickers", json!(["GNP", "BHP"]));

        run(&worker, &f, &step).await.unwrap();

        let job = f.jobs.get_job(f.step_job_id).await.unwrap();
        let result = job.result.unwrap();
        assert_eq!(result["documents_created"], 1);
        assert_eq!(result["source_ids"][0], "asx:GNP:stock_collector");
        assert_eq!(result["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn announcements_use_their_default_period() {
        let f = fixture(ScriptedMarketData::new()).await;
        let worker = worker(&f, MarketDataKind::Announcements);
        let step = JobStep::new("ann", "asx_announcements").with("ticker", "ASX:GNP");

        let init = worker
            .init(&CancellationToken::new(), &step, &JobDefinition::new("d", vec![]))
            .await
            .unwrap();
        assert_eq!(init.plan.period, "M6");
        assert_eq!(init.total_count, 1);
        assert_eq!(init.plan.freshness, FreshnessPolicy::new(24, false));
    }
}
