//! Document freshness cache.
//!
//! Workers that fetch idempotently keyed artifacts consult the document
//! store first and skip the fetch when a stored copy is younger than the
//! TTL. There is no cross-worker locking: two workers racing on the same
//! key may both refetch, and the store's upsert-by-source-key makes the
//! second write replace the first rather than add to it.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result, ResultExt};
use crate::traits::documents::DocumentStore;
use crate::types::{Document, SourceKey};

/// True when `doc` exists, has been synced, and is younger than `ttl_hours`.
///
/// Only reads `last_synced`, which the writer sets in the same save as the
/// content, so a partially written document is never judged fresh.
pub fn is_fresh(doc: Option<&Document>, ttl_hours: i64, now: DateTime<Utc>) -> bool {
    if ttl_hours <= 0 {
        return false;
    }
    match doc.and_then(|d| cache_age(d, now)) {
        Some(age) => age < chrono::Duration::hours(ttl_hours),
        None => false,
    }
}

/// Age of the stored copy, or `None` if it was never synced.
pub fn cache_age(doc: &Document, now: DateTime<Utc>) -> Option<chrono::Duration> {
    doc.last_synced.map(|synced| now - synced)
}

/// Per-call freshness settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub ttl_hours: i64,
    pub force_refresh: bool,
}

impl FreshnessPolicy {
    pub fn new(ttl_hours: i64, force_refresh: bool) -> Self {
        Self {
            ttl_hours,
            force_refresh,
        }
    }

    /// Whether the store should be consulted before fetching.
    pub fn should_lookup(&self) -> bool {
        !self.force_refresh && self.ttl_hours > 0
    }
}

/// Result of a freshness-aware fetch.
#[derive(Debug, Clone)]
pub struct CachedFetch {
    pub document: Document,
    pub from_cache: bool,
}

/// Bound a provider call by `timeout` and abort it when `cancel` fires.
pub async fn guard_fetch<T, Fut>(cancel: &CancellationToken, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(EngineError::Timeout { secs: timeout.as_secs() }),
        },
    }
}

/// Return the stored document for `key` if fresh, otherwise fetch and upsert.
///
/// `fetch` produces the unsaved document content. The source key and
/// `last_synced` are stamped here. A save failure is returned as an error so
/// that an artifact that never became durable is not counted as produced.
pub async fn fetch_or_reuse<F, Fut>(
    cancel: &CancellationToken,
    store: &dyn DocumentStore,
    key: &SourceKey,
    policy: FreshnessPolicy,
    timeout: Duration,
    fetch: F,
) -> Result<CachedFetch>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Document>>,
{
    if policy.should_lookup() {
        match store.get_document_by_source(&key.source_type, &key.source_id).await {
            Ok(Some(doc)) => {
                let now = Utc::now();
                if is_fresh(Some(&doc), policy.ttl_hours, now) {
                    let age_hours = cache_age(&doc, now)
                        .map(|age| age.num_minutes() as f64 / 60.0)
                        .unwrap_or_default();
                    info!(
                        source = %key,
                        document_id = %doc.id,
                        age_hours = %format!("{age_hours:.1}"),
                        ttl_hours = policy.ttl_hours,
                        "using cached document"
                    );
                    return Ok(CachedFetch {
                        document: doc,
                        from_cache: true,
                    });
                }
                debug!(source = %key, "cached document is stale, refetching");
            }
            Ok(None) => debug!(source = %key, "no cached document"),
            Err(e) => warn!(source = %key, error = %e, "cache lookup failed, fetching"),
        }
    } else if policy.force_refresh {
        debug!(source = %key, "force_refresh set, bypassing cache");
    }

    let mut doc = guard_fetch(cancel, timeout, fetch()).await?;

    let now = Utc::now();
    doc.source_type = key.source_type.clone();
    doc.source_id = key.source_id.clone();
    doc.last_synced = Some(now);
    doc.updated_at = now;

    let saved = store
        .save_document(&doc)
        .await
        .with_context(|| format!("saving {key}"))?;

    info!(source = %key, document_id = %saved.id, "fetched and stored document");
    Ok(CachedFetch {
        document: saved,
        from_cache: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryDocumentStore;
    use crate::testing::FlakyDocumentStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn synced_at(now: DateTime<Utc>, hours_ago: i64) -> Document {
        Document::builder()
            .source_type("asx_stock_collector")
            .source_id("asx:GNP:stock_collector")
            .last_synced(now - chrono::Duration::hours(hours_ago))
            .build()
    }

    fn synced(hours_ago: i64) -> Document {
        synced_at(Utc::now(), hours_ago)
    }

    fn key() -> SourceKey {
        SourceKey::new("asx_stock_collector", "asx:GNP:stock_collector")
    }

    #[test]
    fn freshness_predicate() {
        let now = Utc::now();
        assert!(!is_fresh(None, 24, now));

        let never_synced = Document::builder().source_type("t").source_id("i").build();
        assert!(!is_fresh(Some(&never_synced), 24, now));

        assert!(is_fresh(Some(&synced_at(now, 1)), 24, now));
        assert!(!is_fresh(Some(&synced_at(now, 24)), 24, now), "age == ttl is stale");
        assert!(!is_fresh(Some(&synced_at(now, 30)), 24, now));
        assert!(!is_fresh(Some(&synced_at(now, 0)), 0, now), "ttl 0 disables the cache");
        assert!(!is_fresh(Some(&synced_at(now, 0)), -5, now));
    }

    #[test]
    fn should_lookup() {
        assert!(FreshnessPolicy::new(24, false).should_lookup());
        assert!(!FreshnessPolicy::new(24, true).should_lookup());
        assert!(!FreshnessPolicy::new(0, false).should_lookup());
    }

    async fn run(
        store: &dyn DocumentStore,
        policy: FreshnessPolicy,
        fetches: &AtomicUsize,
    ) -> Result<CachedFetch> {
        fetch_or_reuse(
            &CancellationToken::new(),
            store,
            &key(),
            policy,
            Duration::from_secs(5),
            || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(Document::builder()
                    .source_type("")
                    .source_id("")
                    .title("GNP stock data")
                    .build())
            },
        )
        .await
    }

    #[tokio::test]
    async fn second_run_in_window_is_pure_cache_hit() {
        let store = MemoryDocumentStore::new();
        let fetches = AtomicUsize::new(0);
        let policy = FreshnessPolicy::new(24, false);

        let first = run(&store, policy, &fetches).await.unwrap();
        let second = run(&store, policy, &fetches).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.document.id, second.document.id);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.document_count(), 1);
    }

    #[tokio::test]
    async fn force_refresh_never_reuses_fresh_document() {
        let store = MemoryDocumentStore::new();
        store.insert(synced(1));
        let fetches = AtomicUsize::new(0);

        let result = run(&store, FreshnessPolicy::new(24, true), &fetches).await.unwrap();

        assert!(!result.from_cache);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.document_count(), 1, "refresh upserts over the old copy");
    }

    #[tokio::test]
    async fn stale_document_is_refetched() {
        let store = MemoryDocumentStore::new();
        store.insert(synced(48));
        let fetches = AtomicUsize::new(0);

        let result = run(&store, FreshnessPolicy::new(24, false), &fetches).await.unwrap();

        assert!(!result.from_cache);
        assert_eq!(result.document.title, "GNP stock data");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn save_failure_is_an_error() {
        let inner = Arc::new(MemoryDocumentStore::new());
        let store = FlakyDocumentStore::new(inner.clone()).fail_saves_for("asx:GNP:stock_collector");
        let fetches = AtomicUsize::new(0);

        let err = run(&store, FreshnessPolicy::new(24, false), &fetches).await.unwrap_err();

        assert!(matches!(err.root(), EngineError::Persistence(_)));
        assert!(err.to_string().contains("saving asx_stock_collector/asx:GNP:stock_collector"));
        assert_eq!(inner.document_count(), 0);
    }

    #[tokio::test]
    async fn guard_fetch_times_out_and_cancels() {
        let err = guard_fetch(&CancellationToken::new(), Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert!(err.is_transient());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = guard_fetch(&cancel, Duration::from_secs(5), std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
