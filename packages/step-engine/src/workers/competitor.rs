//! Competitor discovery for ASX tickers.
//!
//! For each target, an LLM names its listed competitors and each
//! competitor's stock document is collected through the stock collector,
//! so repeated runs reuse fresh documents. Best-effort: one target failing
//! does not fail the step.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::market_data::{MarketDataKind, MarketDataWorker};
use super::Worker;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::freshness::{guard_fetch, FreshnessPolicy};
use crate::jobs::{JobManager, LogLevel};
use crate::policy::{FailurePolicy, OutcomeTally};
use crate::security::{ApiKeyResolver, SecretString};
use crate::traits::documents::DocumentStore;
use crate::traits::market::{CompetitorIdentifier, MarketDataProvider};
use crate::types::{InitResult, JobDefinition, JobStep, Ticker, WorkItem, WorkerOutcome};

const WORKER_TYPE: &str = "market_competitor";
const LLM_TIMEOUT: Duration = Duration::from_secs(120);

static ASX_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{3,4})\b").expect("ASX code pattern is valid"));

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CompetitorConfig {
    ticker: Option<String>,
    asx_code: Option<String>,
    tickers: Vec<String>,
    asx_codes: Vec<String>,
    api_key: Option<String>,
    prompt: Option<String>,
    period: Option<String>,
    cache_hours: Option<i64>,
    force_refresh: bool,
    output_tags: Vec<String>,
}

impl CompetitorConfig {
    fn targets(&self, definition: &JobDefinition) -> Vec<Ticker> {
        let raw = self
            .ticker
            .iter()
            .chain(self.asx_code.iter())
            .chain(self.tickers.iter())
            .chain(self.asx_codes.iter())
            .cloned()
            .chain(definition.variable_strings("ticker"))
            .chain(definition.variable_strings("asx_code"));

        let mut targets: Vec<Ticker> = Vec::new();
        for ticker in Ticker::parse_all(raw) {
            if !targets.contains(&ticker) {
                targets.push(ticker);
            }
        }
        targets
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct CompetitorPlan {
    pub targets: Vec<Ticker>,
    pub api_key: SecretString,
    pub prompt: Option<String>,
    pub period: String,
    pub freshness: FreshnessPolicy,
    pub output_tags: Vec<String>,
}

impl CompetitorPlan {
    fn prompt_for(&self, target: &Ticker) -> String {
        match &self.prompt {
            Some(template) => template
                .replace("{ticker}", &target.to_string())
                .replace("{code}", &target.code),
            None => format!("Identify the top 3-5 ASX-listed competitors for {}", target.code),
        }
    }
}

/// Extract competitor codes from an LLM response.
///
/// Strips a fenced code block, then reads a JSON array of codes. When the
/// response is not a JSON array, falls back to every 3-4 letter capitalised
/// word. The target's own code is always dropped. A JSON array that names
/// no competitors is a valid "none found"; free text with no codes is an
/// error.
pub fn parse_competitor_codes(response: &str, target: &str) -> Result<Vec<String>> {
    let body = strip_code_fence(response);
    let target = target.trim().to_uppercase();

    let mut codes: Vec<String> = Vec::new();
    let mut push = |code: String| {
        if code != target && !codes.contains(&code) {
            codes.push(code);
        }
    };

    if let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(body) {
        for entry in entries {
            let raw = match &entry {
                serde_json::Value::String(s) => s.as_str(),
                serde_json::Value::Object(obj) => obj.get("code").and_then(|c| c.as_str()).unwrap_or_default(),
                _ => "",
            };
            let code = raw.trim().to_uppercase();
            let code = code.strip_prefix("ASX:").unwrap_or(&code).to_string();
            if (3..=4).contains(&code.len()) && code.chars().all(|c| c.is_ascii_uppercase()) {
                push(code);
            }
        }
        return Ok(codes);
    }

    for capture in ASX_CODE.captures_iter(body) {
        push(capture[1].to_string());
    }
    if codes.is_empty() {
        return Err(EngineError::fetch("no valid ASX codes found in response"));
    }
    Ok(codes)
}

fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line, then the closing fence
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

pub struct MarketCompetitorWorker {
    jobs: Arc<JobManager>,
    identifier: Arc<dyn CompetitorIdentifier>,
    resolver: ApiKeyResolver,
    stock: MarketDataWorker,
}

impl MarketCompetitorWorker {
    pub fn new(
        jobs: Arc<JobManager>,
        documents: Arc<dyn DocumentStore>,
        provider: Arc<dyn MarketDataProvider>,
        identifier: Arc<dyn CompetitorIdentifier>,
        resolver: ApiKeyResolver,
        config: &EngineConfig,
    ) -> Self {
        Self {
            stock: MarketDataWorker::new(MarketDataKind::Stock, jobs.clone(), documents, provider, config),
            jobs,
            identifier,
            resolver,
        }
    }

    /// Identify and collect competitors for one target. Returns how many
    /// competitor documents were produced.
    async fn process_target(
        &self,
        cancel: &CancellationToken,
        step_job_id: Uuid,
        plan: &CompetitorPlan,
        target: &Ticker,
        outcome: &mut WorkerOutcome,
    ) -> Result<usize> {
        let prompt = plan.prompt_for(target);
        let response = guard_fetch(cancel, LLM_TIMEOUT, self.identifier.identify(target, &prompt, &plan.api_key))
            .await
            .map_err(|e| match e {
                EngineError::Cancelled => e,
                e => EngineError::fetch(format!("failed to identify competitors: {e}")),
            })?;

        let codes = parse_competitor_codes(&response, &target.code)?;
        if codes.is_empty() {
            self.jobs
                .log_or_warn(step_job_id, LogLevel::Warn, &format!("{target} - No competitors identified"))
                .await;
            return Ok(0);
        }
        self.jobs
            .log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!("{target} - Identified {} competitors: {}", codes.len(), codes.join(", ")),
            )
            .await;

        let mut tags = plan.output_tags.clone();
        tags.push(format!("competitor-of-{}", target.code.to_lowercase()));

        let mut fetched = 0;
        let mut last_error = None;
        for competitor in Ticker::parse_all(&codes) {
            match self
                .stock
                .collect(cancel, step_job_id, &competitor, &plan.period, plan.freshness, &tags)
                .await
            {
                Ok(result) => {
                    outcome.record(&result.document);
                    fetched += 1;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(target = %target, competitor = %competitor, error = %e, "competitor fetch failed");
                    outcome.errors.push(format!("{competitor}: {e}"));
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if fetched == 0 => Err(EngineError::fetch(format!(
                "failed to fetch any of {} competitors: {e}",
                codes.len()
            ))),
            _ => Ok(fetched),
        }
    }
}

#[async_trait]
impl Worker for MarketCompetitorWorker {
    type Plan = CompetitorPlan;

    fn worker_type(&self) -> &'static str {
        WORKER_TYPE
    }

    fn validate_config(&self, step: &JobStep) -> Result<()> {
        let config: CompetitorConfig = step.parse_config()?;
        if config.api_key().is_none() {
            return Err(EngineError::invalid_config(
                WORKER_TYPE,
                format!("step '{}' requires 'api_key'", step.name),
            ));
        }
        Ok(())
    }

    async fn init(
        &self,
        _cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
    ) -> Result<InitResult<CompetitorPlan>> {
        self.validate_config(step)?;
        let config: CompetitorConfig = step.parse_config()?;

        let targets = config.targets(definition);
        if targets.is_empty() {
            return Err(EngineError::invalid_config(
                WORKER_TYPE,
                "no tickers in step config or job variables",
            ));
        }

        let api_key = self
            .resolver
            .resolve_config_value(config.api_key().unwrap_or_default())
            .await?;

        let plan = CompetitorPlan {
            targets,
            api_key,
            prompt: config.prompt.filter(|p| !p.trim().is_empty()),
            period: config.period.filter(|p| !p.is_empty()).unwrap_or_else(|| "Y1".into()),
            freshness: FreshnessPolicy::new(
                config.cache_hours.unwrap_or(self.stock.default_freshness().ttl_hours),
                config.force_refresh,
            ),
            output_tags: config.output_tags,
        };

        info!(
            phase = "init",
            step = %step.name,
            ticker_count = plan.targets.len(),
            "competitor worker initialized"
        );

        let items = plan
            .targets
            .iter()
            .map(|t| {
                WorkItem::new(t.code.clone(), format!("Analyze competitors for {t}"), "competitor")
                    .with_config(json!({ "ticker": t.to_string() }))
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
        init: Option<InitResult<CompetitorPlan>>,
    ) -> Result<Uuid> {
        let init = match init {
            Some(init) => init,
            None => self.init(cancel, step, definition).await?,
        };
        let plan = init.plan;

        let names: Vec<String> = plan.targets.iter().map(ToString::to_string).collect();
        self.jobs
            .log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!("Analyzing competitors for {} tickers: {}", names.len(), names.join(", ")),
            )
            .await;

        let mut tally = OutcomeTally::new();
        let mut outcome = WorkerOutcome::for_source(MarketDataKind::Stock.worker_type());

        for target in &plan.targets {
            match self.process_target(cancel, step_job_id, &plan, target, &mut outcome).await {
                Ok(produced) => {
                    debug!(target = %target, produced, "competitors collected");
                    tally.success(target.to_string(), produced);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.jobs
                        .log_or_warn(step_job_id, LogLevel::Error, &format!("{target} - Failed: {e}"))
                        .await;
                    outcome.errors.push(format!("{target}: {e}"));
                    tally.failure(target.to_string(), &e);
                }
            }
        }

        self.jobs
            .log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!(
                    "Completed {}/{} target tickers successfully",
                    tally.succeeded(),
                    plan.targets.len()
                ),
            )
            .await;

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
