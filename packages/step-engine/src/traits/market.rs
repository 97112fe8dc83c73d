//! External data providers consumed by the market workers.
//!
//! Concrete providers (market data APIs, LLM completion) live outside this
//! crate; workers see only these narrow interfaces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::security::SecretString;
use crate::types::Ticker;

/// Content returned by a provider, before it becomes a stored document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchedContent {
    pub title: String,
    pub content_markdown: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Market data source (prices, announcements, index levels).
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Price history and fundamentals for one ticker.
    async fn fetch_stock(&self, ticker: &Ticker, period: &str) -> Result<FetchedContent>;

    /// Company announcements for one ticker.
    async fn fetch_announcements(&self, ticker: &Ticker, period: &str) -> Result<FetchedContent>;

    /// Benchmark index data (e.g. `XJO`).
    async fn fetch_index(&self, code: &str, period: &str) -> Result<FetchedContent>;
}

/// Raw LLM completion used to name a company's listed competitors.
#[async_trait]
pub trait CompetitorIdentifier: Send + Sync {
    /// Returns the model's raw response text.
    async fn identify(&self, target: &Ticker, prompt: &str, api_key: &SecretString) -> Result<String>;
}
