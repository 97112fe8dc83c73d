//! Document storage and search boundaries.
//!
//! - `DocumentStore`: keyed upsert/lookup of produced artifacts
//! - `SearchService`: tag-filtered document search used during planning

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Document;

/// Storage for documents produced by workers.
///
/// This is the only shared mutable resource between concurrent workers, so
/// every write is a keyed upsert, never a read-modify-write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Look up the document for a `(source_type, source_id)` pair.
    async fn get_document_by_source(&self, source_type: &str, source_id: &str) -> Result<Option<Document>>;

    /// Look up a document by ID.
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    /// Idempotent upsert.
    ///
    /// Keyed by `(source_type, source_id)` when both are set, otherwise by
    /// `id`. Returns the stored document (its `id` may be the pre-existing
    /// one when an upsert matched by source key).
    async fn save_document(&self, doc: &Document) -> Result<Document>;
}

/// Options for a document search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Every tag must be present on a hit
    pub tags: Vec<String>,

    /// Maximum hits (0 = no limit)
    pub limit: usize,
}

impl SearchOptions {
    pub fn with_tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            limit: 0,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Document search.
#[async_trait]
pub trait SearchService: Send + Sync {
    /// Search documents. An empty query matches everything passing the tag filter.
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<Document>>;
}
