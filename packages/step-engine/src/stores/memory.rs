//! In-memory storage implementations for testing and development.
//!
//! Not suitable for production as data is lost on restart. Locks are
//! std `RwLock`s held only for the duration of a single map operation;
//! a poisoned lock is recovered rather than propagated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::jobs::{JobLogEntry, JobStatus, LogLevel, QueueJob};
use crate::security::KeyValueStore;
use crate::traits::documents::{DocumentStore, SearchOptions, SearchService};
use crate::traits::queue::JobRecordStore;
use crate::types::Document;

// ============================================================================
// Job records
// ============================================================================

#[derive(Default)]
struct JobTable {
    jobs: HashMap<Uuid, QueueJob>,
    /// Insertion order, for oldest-first child listings
    order: Vec<Uuid>,
}

/// In-memory job record store.
///
/// Transitions are checked and applied under one write lock, so concurrent
/// completions observe a single consistent status per job.
#[derive(Default)]
pub struct MemoryJobStore {
    table: RwLock<JobTable>,
    logs: RwLock<Vec<JobLogEntry>>,
    sequence: AtomicU64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .contains_key(&id)
    }

    pub fn job_count(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).jobs.len()
    }

    /// All jobs in insertion order.
    pub fn jobs(&self) -> Vec<QueueJob> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .cloned()
            .collect()
    }

    fn with_job<T>(&self, id: Uuid, f: impl FnOnce(&mut QueueJob) -> Result<T>) -> Result<T> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let job = table.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        f(job)
    }
}

#[async_trait]
impl JobRecordStore for MemoryJobStore {
    async fn insert_job(&self, job: &QueueJob) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if table.jobs.insert(job.id, job.clone()).is_none() {
            table.order.push(job.id);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>> {
        Ok(self
            .table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .get(&id)
            .cloned())
    }

    async fn transition(&self, id: Uuid, to: JobStatus, at: DateTime<Utc>) -> Result<QueueJob> {
        self.with_job(id, |job| {
            job.apply_transition(to, at)?;
            Ok(job.clone())
        })
    }

    async fn fail(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<QueueJob> {
        self.with_job(id, |job| {
            job.apply_transition(JobStatus::Failed, at)?;
            job.error = Some(error.to_string());
            Ok(job.clone())
        })
    }

    async fn set_error(&self, id: Uuid, error: &str) -> Result<()> {
        self.with_job(id, |job| {
            job.error = Some(error.to_string());
            Ok(())
        })
    }

    async fn set_result(&self, id: Uuid, result: &serde_json::Value) -> Result<()> {
        self.with_job(id, |job| {
            job.result = Some(result.clone());
            Ok(())
        })
    }

    async fn set_progress(&self, id: Uuid, current: i64, total: i64) -> Result<()> {
        self.with_job(id, |job| {
            job.progress_current = current;
            job.progress_total = total;
            Ok(())
        })
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        phase: &str,
    ) -> Result<JobLogEntry> {
        if !self.contains(job_id) {
            return Err(EngineError::JobNotFound(job_id));
        }
        let entry = JobLogEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            job_id,
            level,
            message: message.to_string(),
            phase: phase.to_string(),
            timestamp: Utc::now(),
        };
        self.logs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(entry)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<QueueJob>> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .filter(|job| job.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>> {
        let mut logs: Vec<JobLogEntry> = self
            .logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by_key(|entry| entry.sequence);
        Ok(logs)
    }
}

// ============================================================================
// Documents
// ============================================================================

/// In-memory document store with upsert-by-source-key semantics.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<Uuid, Document>>,
    saves: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of `save_document` calls (inserts and updates).
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        docs
    }

    /// Seed a document as-is (no upsert matching). Test helper.
    pub fn insert(&self, doc: Document) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc.id, doc);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_document_by_source(&self, source_type: &str, source_id: &str) -> Result<Option<Document>> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|d| d.source_type == source_type && d.source_id == source_id)
            .cloned())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn save_document(&self, doc: &Document) -> Result<Document> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        self.saves.fetch_add(1, Ordering::SeqCst);

        let existing = doc.source_key().and_then(|key| {
            documents
                .values()
                .find(|d| d.source_type == key.source_type && d.source_id == key.source_id)
                .map(|d| (d.id, d.created_at))
        });

        let mut stored = doc.clone();
        if let Some((id, created_at)) = existing {
            stored.id = id;
            stored.created_at = created_at;
        } else if let Some(previous) = documents.get(&doc.id) {
            stored.created_at = previous.created_at;
        }
        stored.updated_at = Utc::now();

        documents.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl SearchService for MemoryDocumentStore {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<Document>> {
        let needle = query.trim().to_lowercase();
        let hits = self
            .documents()
            .into_iter()
            .filter(|d| options.tags.iter().all(|tag| d.tags.contains(tag)))
            .filter(|d| {
                needle.is_empty()
                    || d.title.to_lowercase().contains(&needle)
                    || d.content_markdown.to_lowercase().contains(&needle)
            });

        Ok(if options.limit > 0 {
            hits.take(options.limit).collect()
        } else {
            hits.collect()
        })
    }
}

// ============================================================================
// Key/value credentials
// ============================================================================

#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(source_id: &str, title: &str) -> Document {
        Document::builder()
            .source_type("local_dir")
            .source_id(source_id)
            .title(title)
            .build()
    }

    #[tokio::test]
    async fn save_upserts_by_source_key() {
        let store = MemoryDocumentStore::new();
        let first = store.save_document(&doc("a.md", "v1")).await.unwrap();
        let second = store.save_document(&doc("a.md", "v2")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.document_count(), 1);
        assert_eq!(store.save_count(), 2);
        let stored = store.get_document_by_source("local_dir", "a.md").await.unwrap().unwrap();
        assert_eq!(stored.title, "v2");
    }

    #[tokio::test]
    async fn save_without_source_key_upserts_by_id() {
        let store = MemoryDocumentStore::new();
        let mut d = Document::builder().source_type("").source_id("").title("v1").build();
        store.save_document(&d).await.unwrap();
        d.title = "v2".into();
        store.save_document(&d).await.unwrap();

        assert_eq!(store.document_count(), 1);
        assert_eq!(store.get_document(d.id).await.unwrap().unwrap().title, "v2");
    }

    #[tokio::test]
    async fn search_filters_by_all_tags_and_limit() {
        let store = MemoryDocumentStore::new();
        let mut a = doc("a", "Portfolio");
        a.tags = vec!["portfolio".into(), "smsf".into()];
        let mut b = doc("b", "Portfolio two");
        b.tags = vec!["portfolio".into()];
        store.save_document(&a).await.unwrap();
        store.save_document(&b).await.unwrap();

        let hits = store
            .search("", &SearchOptions::with_tags(["portfolio", "smsf"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, "a");

        let limited = store
            .search("portfolio", &SearchOptions::with_tags(["portfolio"]).limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn transition_on_missing_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store
            .transition(Uuid::new_v4(), JobStatus::Running, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_completions_leave_one_terminal_status() {
        let store = std::sync::Arc::new(MemoryJobStore::new());
        let job = QueueJob::builder().job_type("t").name("n").build();
        store.insert_job(&job).await.unwrap();
        store.transition(job.id, JobStatus::Running, Utc::now()).await.unwrap();

        let id = job.id;
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let to = if i % 2 == 0 { JobStatus::Completed } else { JobStatus::Failed };
            handles.push(tokio::spawn(async move {
                store.transition(id, to, Utc::now()).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(store.get_job(job.id).await.unwrap().unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn fail_on_terminal_job_leaves_error_untouched() {
        let store = MemoryJobStore::new();
        let job = QueueJob::builder().job_type("t").name("n").build();
        store.insert_job(&job).await.unwrap();
        store.transition(job.id, JobStatus::Running, Utc::now()).await.unwrap();

        let failed = store.fail(job.id, "disk full", Utc::now()).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert!(failed.completed_at.is_some());

        let err = store.fail(job.id, "second reason", Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("disk full"));
    }
}
