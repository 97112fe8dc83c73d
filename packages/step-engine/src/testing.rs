//! Testing utilities including mock implementations.
//!
//! These are useful for testing orchestrators and workers built on the
//! engine without real queues, data providers, or LLM calls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::security::SecretString;
use crate::stores::MemoryDocumentStore;
use crate::traits::documents::DocumentStore;
use crate::traits::market::{CompetitorIdentifier, FetchedContent, MarketDataProvider};
use crate::traits::queue::{QueueMessage, QueueTransport};
use crate::types::{Document, Ticker};

type EnqueueHook = Box<dyn Fn(&QueueMessage) + Send + Sync>;

/// Transport that records every message instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    messages: RwLock<Vec<QueueMessage>>,
    fail_next: RwLock<Option<String>>,
    hook: RwLock<Option<EnqueueHook>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<QueueMessage> {
        self.messages.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make the next enqueue fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.write().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
    }

    /// Run `hook` for each message before it is recorded.
    pub fn on_enqueue(&self, hook: impl Fn(&QueueMessage) + Send + Sync + 'static) {
        *self.hook.write().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }
}

#[async_trait]
impl QueueTransport for RecordingTransport {
    async fn enqueue(&self, message: QueueMessage) -> Result<()> {
        if let Some(reason) = self.fail_next.write().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(EngineError::persistence(reason));
        }
        if let Some(hook) = self.hook.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            hook(&message);
        }
        self.messages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

/// Record of a call made to the scripted market data provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketCall {
    Stock { ticker: String, period: String },
    Announcements { ticker: String, period: String },
    Index { code: String, period: String },
}

/// A mock market data provider.
///
/// Returns deterministic content for every request except those marked
/// as failing. Every call is recorded for assertions.
#[derive(Default)]
pub struct ScriptedMarketData {
    /// Keys like `stock:ASX:GNP`, `announcements:ASX:GNP`, `index:XJO`
    failures: RwLock<HashMap<String, String>>,
    calls: RwLock<Vec<MarketCall>>,
}

impl ScriptedMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_stock(self, ticker: &str, reason: &str) -> Self {
        self.fail(format!("stock:{}", normalize(ticker)), reason)
    }

    pub fn fail_announcements(self, ticker: &str, reason: &str) -> Self {
        self.fail(format!("announcements:{}", normalize(ticker)), reason)
    }

    pub fn fail_index(self, code: &str, reason: &str) -> Self {
        self.fail(format!("index:{}", code.to_uppercase()), reason)
    }

    fn fail(self, key: String, reason: &str) -> Self {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, reason.to_string());
        self
    }

    pub fn calls(&self) -> Vec<MarketCall> {
        self.calls.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stock_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MarketCall::Stock { .. }))
            .count()
    }

    fn respond(&self, key: String, call: MarketCall, title: String) -> Result<FetchedContent> {
        self.calls.write().unwrap_or_else(|e| e.into_inner()).push(call);
        if let Some(reason) = self.failures.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Err(EngineError::fetch(reason.clone()));
        }
        Ok(FetchedContent {
            content_markdown: format!("# {title}\n"),
            title,
            ..Default::default()
        })
    }
}

fn normalize(ticker: &str) -> String {
    Ticker::parse(ticker)
        .map(|t| t.to_string())
        .unwrap_or_else(|| ticker.to_string())
}

#[async_trait]
impl MarketDataProvider for ScriptedMarketData {
    async fn fetch_stock(&self, ticker: &Ticker, period: &str) -> Result<FetchedContent> {
        self.respond(
            format!("stock:{ticker}"),
            MarketCall::Stock {
                ticker: ticker.to_string(),
                period: period.to_string(),
            },
            format!("{ticker} stock data"),
        )
    }

    async fn fetch_announcements(&self, ticker: &Ticker, period: &str) -> Result<FetchedContent> {
        self.respond(
            format!("announcements:{ticker}"),
            MarketCall::Announcements {
                ticker: ticker.to_string(),
                period: period.to_string(),
            },
            format!("{ticker} announcements"),
        )
    }

    async fn fetch_index(&self, code: &str, period: &str) -> Result<FetchedContent> {
        let code = code.to_uppercase();
        self.respond(
            format!("index:{code}"),
            MarketCall::Index {
                code: code.clone(),
                period: period.to_string(),
            },
            format!("{code} index data"),
        )
    }
}

/// A mock competitor identifier returning canned LLM responses per target code.
#[derive(Default)]
pub struct ScriptedCompetitors {
    responses: RwLock<HashMap<String, Result<String>>>,
    keys_seen: RwLock<Vec<String>>,
}

impl ScriptedCompetitors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, target_code: &str, response: &str) -> Self {
        self.responses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target_code.to_uppercase(), Ok(response.to_string()));
        self
    }

    pub fn fail(self, target_code: &str, reason: &str) -> Self {
        self.responses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target_code.to_uppercase(), Err(EngineError::fetch(reason.to_string())));
        self
    }

    /// API keys the identifier was called with (exposed, for assertions).
    pub fn keys_seen(&self) -> Vec<String> {
        self.keys_seen.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CompetitorIdentifier for ScriptedCompetitors {
    async fn identify(&self, target: &Ticker, _prompt: &str, api_key: &SecretString) -> Result<String> {
        self.keys_seen
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(api_key.expose().to_string());
        match self.responses.read().unwrap_or_else(|e| e.into_inner()).get(&target.code) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(e)) => Err(EngineError::fetch(e.to_string())),
            None => Ok("[]".to_string()),
        }
    }
}

/// Document store that fails saves for chosen source ids.
///
/// Wraps a `MemoryDocumentStore`; reads always succeed.
pub struct FlakyDocumentStore {
    inner: Arc<MemoryDocumentStore>,
    failing_source_ids: RwLock<HashSet<String>>,
}

impl FlakyDocumentStore {
    pub fn new(inner: Arc<MemoryDocumentStore>) -> Self {
        Self {
            inner,
            failing_source_ids: RwLock::new(HashSet::new()),
        }
    }

    pub fn fail_saves_for(self, source_id: impl Into<String>) -> Self {
        self.failing_source_ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source_id.into());
        self
    }
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn get_document_by_source(&self, source_type: &str, source_id: &str) -> Result<Option<Document>> {
        self.inner.get_document_by_source(source_type, source_id).await
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.inner.get_document(id).await
    }

    async fn save_document(&self, doc: &Document) -> Result<Document> {
        if self
            .failing_source_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&doc.source_id)
        {
            return Err(EngineError::persistence(format!("disk full saving {}", doc.source_id)));
        }
        self.inner.save_document(doc).await
    }
}
