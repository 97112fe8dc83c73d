//! Documents produced by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// A stored artifact. `(source_type, source_id)` is its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Document {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    pub source_type: String,
    pub source_id: String,

    #[builder(default)]
    pub title: String,
    #[builder(default)]
    pub content_markdown: String,

    #[builder(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[builder(default, setter(strip_option))]
    pub url: Option<String>,

    #[builder(default)]
    pub tags: Vec<String>,

    /// Set by the writer in the same save as the content.
    #[builder(default, setter(strip_option))]
    pub last_synced: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// The `(source_type, source_id)` key, if both halves are set.
    pub fn source_key(&self) -> Option<SourceKey> {
        if self.source_type.is_empty() || self.source_id.is_empty() {
            None
        } else {
            Some(SourceKey::new(&self.source_type, &self.source_id))
        }
    }
}

/// Idempotency key for a fetched artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub source_type: String,
    pub source_id: String,
}

impl SourceKey {
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            source_id: source_id.into(),
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_type, self.source_id)
    }
}

/// What an inline execution produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub documents_created: usize,
    pub document_ids: Vec<Uuid>,
    pub source_type: String,
    pub source_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl WorkerOutcome {
    pub fn for_source(source_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, doc: &Document) {
        self.documents_created += 1;
        self.document_ids.push(doc.id);
        self.source_ids.push(doc.source_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_leave_last_synced_unset() {
        let doc = Document::builder()
            .source_type("asx_stock_collector")
            .source_id("asx:GNP:stock_collector")
            .build();
        assert!(doc.last_synced.is_none());
        assert_eq!(
            doc.source_key(),
            Some(SourceKey::new("asx_stock_collector", "asx:GNP:stock_collector"))
        );
    }

    #[test]
    fn source_key_requires_both_halves() {
        let doc = Document::builder().source_type("local_dir").source_id("").build();
        assert!(doc.source_key().is_none());
    }
}
