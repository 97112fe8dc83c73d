//! Work units produced by a worker's planning phase.

use serde::{Deserialize, Serialize};

/// How a step's planned work is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Executed synchronously inside `create_jobs`, no child jobs.
    #[default]
    Inline,
    /// Deferred to queued batch jobs linked to the step job.
    Parallel,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Inline => f.write_str("inline"),
            Strategy::Parallel => f.write_str("parallel"),
        }
    }
}

/// One unit of plannable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique within one planning pass
    pub id: String,

    /// Display name
    pub name: String,

    /// Free-form classification (e.g. file type, "stock", "index")
    #[serde(rename = "type")]
    pub item_type: String,

    /// Per-item parameters
    #[serde(default)]
    pub config: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            item_type: item_type.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Result of a worker's planning phase.
///
/// `P` is the worker family's typed planning data (resolved credentials,
/// parsed tickers, discovered paths). It is carried forward into
/// `create_jobs` so execution never re-derives it.
#[derive(Debug, Clone)]
pub struct InitResult<P> {
    pub work_items: Vec<WorkItem>,

    /// Equals `work_items.len()` whenever items are enumerated up front.
    pub total_count: usize,

    pub strategy: Strategy,

    /// Advisory for the batching/queue layer, not a hard cap.
    pub suggested_concurrency: usize,

    pub plan: P,
}

impl<P> InitResult<P> {
    /// Plan for synchronous execution.
    pub fn inline(work_items: Vec<WorkItem>, plan: P) -> Self {
        Self {
            total_count: work_items.len(),
            work_items,
            strategy: Strategy::Inline,
            suggested_concurrency: 1,
            plan,
        }
    }

    /// Plan for batched queue execution.
    pub fn parallel(work_items: Vec<WorkItem>, suggested_concurrency: usize, plan: P) -> Self {
        Self {
            total_count: work_items.len(),
            work_items,
            strategy: Strategy::Parallel,
            suggested_concurrency: suggested_concurrency.max(1),
            plan,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.work_items.is_empty()
    }

    /// Transform the planning data while keeping the work set.
    pub fn map_plan<Q>(self, f: impl FnOnce(P) -> Q) -> InitResult<Q> {
        InitResult {
            work_items: self.work_items,
            total_count: self.total_count,
            strategy: self.strategy,
            suggested_concurrency: self.suggested_concurrency,
            plan: f(self.plan),
        }
    }

    /// Fallible [`InitResult::map_plan`].
    pub fn try_map_plan<Q, E>(self, f: impl FnOnce(P) -> Result<Q, E>) -> Result<InitResult<Q>, E> {
        Ok(InitResult {
            work_items: self.work_items,
            total_count: self.total_count,
            strategy: self.strategy,
            suggested_concurrency: self.suggested_concurrency,
            plan: f(self.plan)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_total_count_matches_items() {
        let items = vec![WorkItem::new("a", "A", "stock"), WorkItem::new("b", "B", "stock")];
        let result = InitResult::inline(items, ());
        assert_eq!(result.total_count, 2);
        assert_eq!(result.strategy, Strategy::Inline);
        assert_eq!(result.suggested_concurrency, 1);
    }

    #[test]
    fn parallel_concurrency_never_zero() {
        let result = InitResult::parallel(vec![], 0, ());
        assert_eq!(result.suggested_concurrency, 1);
        assert!(result.is_empty());
    }

    #[test]
    fn work_item_serializes_type_field() {
        let item = WorkItem::new("src/main.rs", "main.rs", "rust");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "rust");
    }
}
