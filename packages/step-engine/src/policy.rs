//! Partial-failure policy (dead-man checks).
//!
//! Each worker declares one of two policies:
//!
//! - **BestEffort**: per-item failures are logged and skipped; the step
//!   fails only when nothing succeeded.
//! - **Strict**: the step fails when no artifact was produced or when any
//!   sub-operation failed, even if others succeeded. The expected count is
//!   derived from the same plan that drove execution.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{EngineError, Result};

/// How a worker treats per-item failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    BestEffort,
    Strict,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::BestEffort => write!(f, "best_effort"),
            FailurePolicy::Strict => write!(f, "strict"),
        }
    }
}

/// One named component of an expected artifact count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedPart {
    pub label: String,
    pub count: usize,
}

/// Expected number of produced artifacts, with a per-source breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedCount {
    parts: Vec<ExpectedPart>,
}

impl ExpectedCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, label: impl Into<String>, count: usize) -> Self {
        self.parts.push(ExpectedPart {
            label: label.into(),
            count,
        });
        self
    }

    pub fn total(&self) -> usize {
        self.parts.iter().map(|p| p.count).sum()
    }

    pub fn parts(&self) -> &[ExpectedPart] {
        &self.parts
    }
}

impl std::fmt::Display for ExpectedCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|p| format!("{}={}", p.label, p.count))
            .collect();
        write!(f, "{}", rendered.join(", "))
    }
}

/// A failed sub-operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFailure {
    pub label: String,
    pub error: String,
}

/// Per-sub-operation results collected during an inline execution.
#[derive(Debug, Clone, Default)]
pub struct OutcomeTally {
    successes: Vec<String>,
    failures: Vec<SubFailure>,
    /// Durable artifacts produced (saved or reused from cache)
    produced: usize,
}

impl OutcomeTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sub-operation succeeded and produced `artifacts` durable documents.
    pub fn success(&mut self, label: impl Into<String>, artifacts: usize) {
        self.successes.push(label.into());
        self.produced += artifacts;
    }

    pub fn failure(&mut self, label: impl Into<String>, error: impl std::fmt::Display) {
        let label = label.into();
        let error = error.to_string();
        warn!(operation = %label, error = %error, "sub-operation failed");
        self.failures.push(SubFailure { label, error });
    }

    /// Record `result` as a success producing one artifact, or as a failure.
    pub fn record<T>(&mut self, label: impl Into<String>, result: &Result<T>) {
        match result {
            Ok(_) => self.success(label, 1),
            Err(e) => self.failure(label, e),
        }
    }

    pub fn attempted(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn succeeded(&self) -> usize {
        self.successes.len()
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn failures(&self) -> &[SubFailure] {
        &self.failures
    }

    pub fn merge(&mut self, other: OutcomeTally) {
        self.successes.extend(other.successes);
        self.failures.extend(other.failures);
        self.produced += other.produced;
    }
}

/// Outcome of a passing policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub succeeded: usize,
    pub produced: usize,
    /// Tolerated failures (best-effort only)
    pub warnings: Vec<String>,
}

impl FailurePolicy {
    /// Decide whether the step's output can be trusted.
    ///
    /// `expected` is only consulted by the strict policy.
    pub fn verify(&self, tally: &OutcomeTally, expected: Option<&ExpectedCount>) -> Result<PolicyVerdict> {
        let warnings: Vec<String> = tally
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.label, f.error))
            .collect();

        match self {
            FailurePolicy::BestEffort => {
                if tally.attempted() > 0 && tally.succeeded() == 0 {
                    let last_error = tally
                        .failures
                        .last()
                        .map(|f| f.error.clone())
                        .unwrap_or_default();
                    error!(attempted = tally.attempted(), "every sub-operation failed");
                    return Err(EngineError::AllFailed {
                        attempted: tally.attempted(),
                        last_error,
                    });
                }
                Ok(PolicyVerdict {
                    succeeded: tally.succeeded(),
                    produced: tally.produced,
                    warnings,
                })
            }
            FailurePolicy::Strict => {
                let expected_total = expected.map(ExpectedCount::total).unwrap_or(tally.attempted());
                if tally.produced == 0 || !tally.failures.is_empty() || tally.produced < expected_total {
                    let breakdown = expected
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("attempted={}", tally.attempted()));
                    error!(
                        expected = expected_total,
                        actual = tally.produced,
                        failures = tally.failures.len(),
                        "dead-man check tripped"
                    );
                    return Err(EngineError::DeadMan {
                        expected: expected_total,
                        actual: tally.produced,
                        breakdown,
                        failures: warnings,
                    });
                }
                Ok(PolicyVerdict {
                    succeeded: tally.succeeded(),
                    produced: tally.produced,
                    warnings: Vec::new(),
                })
            }
        }
    }
}
