//! Deterministic stock data collection with a dead-man check.
//!
//! Collects benchmark index data, then stock data and announcements for
//! every ticker, inline. The step feeds automated summarization, which
//! cannot tell "no data" from "some data omitted", so it runs under the
//! strict policy: any failed sub-fetch fails the whole step.
//!
//! Tickers come from:
//! - step config `tickers` and `variables` entries
//! - job definition variables (`ticker` / `asx_code`)
//! - documents matching `filter_tags` (metadata `tickers`, or ASX `holdings`)

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::market_data::{MarketDataKind, MarketDataWorker};
use super::Worker;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::freshness::FreshnessPolicy;
use crate::jobs::{JobManager, LogLevel};
use crate::policy::{ExpectedCount, FailurePolicy, OutcomeTally};
use crate::traits::documents::{DocumentStore, SearchOptions, SearchService};
use crate::traits::market::MarketDataProvider;
use crate::types::{ConfigMap, Document, InitResult, JobDefinition, JobStep, Ticker, WorkItem, WorkerOutcome};

const WORKER_TYPE: &str = "stock_data_collection";
const FILTER_SEARCH_LIMIT: usize = 100;
const DEFAULT_BENCHMARK: &str = "XJO";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StockDataConfig {
    tickers: Vec<String>,
    variables: Vec<ConfigMap>,
    filter_tags: Vec<String>,
    #[serde(alias = "benchmarks")]
    benchmark_codes: Option<Vec<String>>,
    period: Option<String>,
    announcement_period: Option<String>,
    cache_hours: Option<i64>,
    force_refresh: bool,
    output_tags: Vec<String>,
}

/// Planning data. The expected artifact count is derived from it, so the
/// dead-man check always matches what was actually planned.
#[derive(Debug, Clone)]
pub struct StockDataPlan {
    pub tickers: Vec<Ticker>,
    pub benchmarks: Vec<Ticker>,
    pub period: String,
    pub announcement_period: String,
    pub freshness: FreshnessPolicy,
    pub output_tags: Vec<String>,
}

impl StockDataPlan {
    /// One index document per benchmark, stock plus announcements per ticker.
    pub fn expected(&self) -> ExpectedCount {
        ExpectedCount::new()
            .with("benchmarks", self.benchmarks.len())
            .with("tickers x 2", self.tickers.len() * 2)
    }

    /// Sub-operations in execution order.
    fn operations(&self) -> Vec<(MarketDataKind, &Ticker, &str)> {
        let mut ops = Vec::with_capacity(self.expected().total());
        for benchmark in &self.benchmarks {
            ops.push((MarketDataKind::Index, benchmark, self.period.as_str()));
        }
        for ticker in &self.tickers {
            ops.push((MarketDataKind::Stock, ticker, self.period.as_str()));
            ops.push((MarketDataKind::Announcements, ticker, self.announcement_period.as_str()));
        }
        ops
    }
}

fn operation_label(kind: MarketDataKind, ticker: &Ticker) -> String {
    match kind {
        MarketDataKind::Index => format!("index {}", ticker.code),
        MarketDataKind::Stock => format!("stock {}", ticker.code),
        MarketDataKind::Announcements => format!("announcements {}", ticker.code),
    }
}

pub struct StockDataCollectionWorker {
    jobs: Arc<JobManager>,
    search: Arc<dyn SearchService>,
    stock: MarketDataWorker,
    announcements: MarketDataWorker,
    index: MarketDataWorker,
}

impl StockDataCollectionWorker {
    pub fn new(
        jobs: Arc<JobManager>,
        documents: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchService>,
        provider: Arc<dyn MarketDataProvider>,
        config: &EngineConfig,
    ) -> Self {
        let market = |kind| MarketDataWorker::new(kind, jobs.clone(), documents.clone(), provider.clone(), config);
        Self {
            stock: market(MarketDataKind::Stock),
            announcements: market(MarketDataKind::Announcements),
            index: market(MarketDataKind::Index),
            jobs,
            search,
        }
    }

    fn market(&self, kind: MarketDataKind) -> &MarketDataWorker {
        match kind {
            MarketDataKind::Stock => &self.stock,
            MarketDataKind::Announcements => &self.announcements,
            MarketDataKind::Index => &self.index,
        }
    }

    async fn collect_tickers(&self, config: &StockDataConfig, definition: &JobDefinition) -> BTreeSet<Ticker> {
        let mut tickers: BTreeSet<Ticker> = Ticker::parse_all(&config.tickers).into_iter().collect();

        for vars in &config.variables {
            tickers.extend(tickers_from_variables(vars));
        }
        for vars in &definition.variables {
            tickers.extend(tickers_from_variables(vars));
        }

        if !config.filter_tags.is_empty() {
            let options = SearchOptions::with_tags(config.filter_tags.iter().cloned()).limit(FILTER_SEARCH_LIMIT);
            match self.search.search("", &options).await {
                Ok(docs) => {
                    for doc in &docs {
                        tickers.extend(tickers_from_document(doc));
                    }
                    debug!(filter_tags = ?config.filter_tags, documents = docs.len(), "searched filter documents");
                }
                Err(e) => {
                    warn!(filter_tags = ?config.filter_tags, error = %e, "failed to search documents by filter_tags");
                }
            }
        }

        tickers
    }
}

fn tickers_from_variables(vars: &ConfigMap) -> Vec<Ticker> {
    ["ticker", "asx_code"]
        .iter()
        .filter_map(|key| vars.get(*key).and_then(|v| v.as_str()))
        .filter_map(Ticker::parse)
        .collect()
}

/// Tickers listed on a filter document: metadata `tickers`, plus `holdings`
/// entries on ASX (or with no exchange).
fn tickers_from_document(doc: &Document) -> Vec<Ticker> {
    let mut tickers = Vec::new();

    if let Some(holdings) = doc.metadata.get("holdings").and_then(|v| v.as_array()) {
        for holding in holdings {
            let symbol = holding["symbol"].as_str().unwrap_or_default();
            let exchange = holding["exchange"].as_str().unwrap_or_default();
            if !symbol.is_empty() && matches!(exchange, "ASX" | "AU" | "") {
                tickers.extend(Ticker::parse(symbol));
            }
        }
    }

    if let Some(list) = doc.metadata.get("tickers").and_then(|v| v.as_array()) {
        tickers.extend(Ticker::parse_all(list.iter().filter_map(|v| v.as_str())));
    }

    tickers
}

#[async_trait]
impl Worker for StockDataCollectionWorker {
    type Plan = StockDataPlan;

    fn worker_type(&self) -> &'static str {
        WORKER_TYPE
    }

    fn validate_config(&self, step: &JobStep) -> Result<()> {
        // Tickers may come from definition variables or filter documents,
        // so only the shape of the config is checked here.
        step.parse_config::<StockDataConfig>().map(|_| ())
    }

    async fn init(
        &self,
        _cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
    ) -> Result<InitResult<StockDataPlan>> {
        let config: StockDataConfig = step.parse_config()?;

        let tickers: Vec<Ticker> = self.collect_tickers(&config, definition).await.into_iter().collect();
        if tickers.is_empty() {
            return Err(EngineError::invalid_config(
                WORKER_TYPE,
                "no tickers found in variables or filter documents",
            ));
        }

        let benchmark_codes = config
            .benchmark_codes
            .unwrap_or_else(|| vec![DEFAULT_BENCHMARK.to_string()]);
        let plan = StockDataPlan {
            tickers,
            benchmarks: Ticker::parse_all(&benchmark_codes),
            period: config.period.filter(|p| !p.is_empty()).unwrap_or_else(|| "Y2".into()),
            announcement_period: config
                .announcement_period
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "M6".into()),
            freshness: FreshnessPolicy::new(
                config.cache_hours.unwrap_or(self.stock.default_freshness().ttl_hours),
                config.force_refresh,
            ),
            output_tags: config.output_tags,
        };

        info!(
            phase = "init",
            step = %step.name,
            ticker_count = plan.tickers.len(),
            benchmarks = plan.benchmarks.len(),
            expected = plan.expected().total(),
            "stock data collection initialized"
        );

        let items = plan
            .operations()
            .into_iter()
            .map(|(kind, ticker, period)| {
                WorkItem::new(operation_label(kind, ticker), ticker.to_string(), kind.worker_type())
                    .with_config(json!({ "ticker": ticker.to_string(), "period": period }))
            })
            .collect();

        Ok(InitResult::inline(items, plan))
    }

    async fn create_jobs(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
        step_job_id: Uuid,
        init: Option<InitResult<StockDataPlan>>,
    ) -> Result<Uuid> {
        let init = match init {
            Some(init) => init,
            None => self.init(cancel, step, definition).await?,
        };
        let plan = init.plan;
        let expected = plan.expected();

        info!(
            step_job_id = %step_job_id,
            ticker_count = plan.tickers.len(),
            benchmarks = plan.benchmarks.len(),
            period = %plan.period,
            announcement_period = %plan.announcement_period,
            "starting stock data collection"
        );

        let mut tally = OutcomeTally::new();
        let mut outcome = WorkerOutcome::for_source(WORKER_TYPE);

        for (kind, ticker, period) in plan.operations() {
            let mut tags = plan.output_tags.clone();
            tags.push("stock-data-collected".into());

            let label = operation_label(kind, ticker);
            let result = self
                .market(kind)
                .collect(cancel, step_job_id, ticker, period, plan.freshness, &tags)
                .await;
            match result {
                Ok(fetched) => {
                    outcome.record(&fetched.document);
                    tally.success(label, 1);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(step_job_id = %step_job_id, ticker = %ticker, operation = %label, error = %e, "sub-fetch failed");
                    outcome.errors.push(format!("{label}: {e}"));
                    tally.failure(label, &e);
                }
            }
        }

        info!(
            step_job_id = %step_job_id,
            documents_created = tally.produced(),
            expected = expected.total(),
            errors = tally.failures().len(),
            "stock data collection completed"
        );

        if let Err(e) = self.jobs.set_job_result(step_job_id, &outcome).await {
            warn!(step_job_id = %step_job_id, error = %e, "failed to store worker result");
        }

        if let Err(e) = self.failure_policy().verify(&tally, Some(&expected)) {
            self.jobs
                .log_or_warn(step_job_id, LogLevel::Error, &e.to_string())
                .await;
            return Err(e);
        }

        self.jobs
            .log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!(
                    "Collected data for {} tickers, {} documents created (all workers succeeded)",
                    plan.tickers.len(),
                    tally.produced()
                ),
            )
            .await;
        Ok(step_job_id)
    }

    fn returns_child_jobs(&self) -> bool {
        false
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::QueueJob;
    use crate::stores::{MemoryDocumentStore, MemoryJobStore};
    use crate::testing::{RecordingTransport, ScriptedMarketData};

    struct Fixture {
        jobs: Arc<JobManager>,
        documents: Arc<MemoryDocumentStore>,
        provider: Arc<ScriptedMarketData>,
        worker: StockDataCollectionWorker,
    }

    fn fixture(provider: ScriptedMarketData) -> Fixture {
        let jobs = Arc::new(JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RecordingTransport::new()),
        ));
        let documents = Arc::new(MemoryDocumentStore::new());
        let provider = Arc::new(provider);
        let worker = StockDataCollectionWorker::new(
            jobs.clone(),
            documents.clone(),
            documents.clone(),
            provider.clone(),
            &EngineConfig::default(),
        );
        Fixture {
            jobs,
            documents,
            provider,
            worker,
        }
    }

    async fn step_job(jobs: &JobManager) -> Uuid {
        jobs.create_job_record(QueueJob::builder().job_type(WORKER_TYPE).name("collect").build())
            .await
            .unwrap()
            .id
    }

    fn definition(step: &JobStep) -> JobDefinition {
        JobDefinition::new("portfolio review", vec![step.clone()])
    }

    #[tokio::test]
    async fn tickers_are_merged_deduplicated_and_sorted() {
        let f = fixture(ScriptedMarketData::new());
        f.documents.insert(
            Document::builder()
                .source_type("navexa_holdings")
                .source_id("portfolio-1")
                .tags(vec!["navexa-holdings".to_string()])
                .metadata(
                    json!({
                        "holdings": [
                            { "symbol": "BHP", "exchange": "ASX" },
                            { "symbol": "AAPL", "exchange": "NASDAQ" }
                        ],
                        "tickers": ["CBA"]
                    })
                    .as_object()
                    .cloned()
                    .unwrap(),
                )
                .build(),
        );
        let step = JobStep::new("collect", WORKER_TYPE)
            .with("tickers", json!(["gnp", "ASX:BHP"]))
            .with("filter_tags", json!(["navexa-holdings"]));
        let def = definition(&step).with_variable("ticker", "ASX.GNP").with_variable("asx_code", "WES");

        let init = f
            .worker
            .init(&CancellationToken::new(), &step, &def)
            .await
            .unwrap();

        let codes: Vec<&str> = init.plan.tickers.iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, ["BHP", "CBA", "GNP", "WES"]);
        assert_eq!(init.plan.benchmarks[0].code, "XJO");
        assert_eq!(init.plan.expected().total(), 9);
        assert_eq!(init.total_count, 9, "work items mirror the expected count");
    }

    #[tokio::test]
    async fn no_tickers_is_configuration_error() {
        let f = fixture(ScriptedMarketData::new());
        let step = JobStep::new("collect", WORKER_TYPE);
        let err = f
            .worker
            .init(&CancellationToken::new(), &step, &definition(&step))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn all_fetches_succeeding_passes_the_check() {
        let f = fixture(ScriptedMarketData::new());
        let id = step_job(&f.jobs).await;
        let step = JobStep::new("collect", WORKER_TYPE).with("tickers", json!(["GNP"]));

        f.worker
            .create_jobs(&CancellationToken::new(), &step, &definition(&step), id, None)
            .await
            .unwrap();

        assert_eq!(f.documents.document_count(), 3);
        let logs = f.jobs.get_job_logs(id).await.unwrap();
        assert!(logs
            .iter()
            .any(|l| l.message == "Collected data for 1 tickers, 3 documents created (all workers succeeded)"));
    }

    #[tokio::test]
    async fn one_missing_announcement_trips_the_dead_man_check() {
        let f = fixture(ScriptedMarketData::new().fail_announcements("B", "provider returned 500"));
        let id = step_job(&f.jobs).await;
        let step = JobStep::new("collect", WORKER_TYPE)
            .with("tickers", json!(["A", "B"]))
            .with("benchmark_codes", json!(["X"]));

        let err = f
            .worker
            .create_jobs(&CancellationToken::new(), &step, &definition(&step), id, None)
            .await
            .unwrap_err();

        match &err {
            EngineError::DeadMan { expected, actual, failures, .. } => {
                assert_eq!(*expected, 5);
                assert_eq!(*actual, 4);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("announcements B"));
            }
            other => panic!("expected DeadMan, got {other:?}"),
        }
        assert!(err.to_string().contains("4 of 5"));

        let logs = f.jobs.get_job_logs(id).await.unwrap();
        assert!(logs.iter().any(|l| l.level == LogLevel::Error && l.message.contains("4 of 5")));
        assert_eq!(f.provider.calls().len(), 5);
    }

    #[tokio::test]
    async fn save_failure_counts_as_missing_artifact() {
        let jobs = Arc::new(JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RecordingTransport::new()),
        ));
        let inner = Arc::new(MemoryDocumentStore::new());
        let flaky = Arc::new(
            crate::testing::FlakyDocumentStore::new(inner.clone()).fail_saves_for("asx:GNP:announcements"),
        );
        let worker = StockDataCollectionWorker::new(
            jobs.clone(),
            flaky,
            inner.clone(),
            Arc::new(ScriptedMarketData::new()),
            &EngineConfig::default(),
        );
        let id = step_job(&jobs).await;
        let step = JobStep::new("collect", WORKER_TYPE).with("tickers", json!(["GNP"]));

        let err = worker
            .create_jobs(&CancellationToken::new(), &step, &definition(&step), id, None)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DeadMan { expected: 3, actual: 2, .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_without_counting_failures() {
        let f = fixture(ScriptedMarketData::new());
        let id = step_job(&f.jobs).await;
        let step = JobStep::new("collect", WORKER_TYPE).with("tickers", json!(["GNP"]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .worker
            .create_jobs(&cancel, &step, &definition(&step), id, None)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(f.documents.document_count(), 0);
    }
}
