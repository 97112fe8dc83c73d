//! Job definitions and their steps.
//!
//! A definition is immutable once a run starts. Steps are read-only during
//! execution; each worker parses its step's `config` into its own typed,
//! validated config struct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// JSON object holding opaque per-step parameters.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// What the orchestrator does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Keep running independent sibling steps
    Continue,
    /// Halt the definition
    #[default]
    Fail,
}

/// One stage of a job definition, bound to a worker type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,

    /// Selects the worker
    #[serde(rename = "type")]
    pub step_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub config: ConfigMap,

    #[serde(default)]
    pub on_error: ErrorStrategy,
}

impl JobStep {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            description: None,
            config: ConfigMap::new(),
            on_error: ErrorStrategy::default(),
        }
    }

    /// Set one config key (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parse the step config into a worker's typed config.
    ///
    /// Unknown keys and type mismatches are configuration errors.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.config.clone()))
            .map_err(|e| EngineError::invalid_config(&self.step_type, format!("step '{}': {}", self.name, e)))
    }
}

/// Ordered list of steps plus global tags and variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub name: String,

    pub steps: Vec<JobStep>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Global variables, e.g. `[{ "ticker": "ASX:GNP" }]`
    #[serde(default)]
    pub variables: Vec<ConfigMap>,

    #[serde(default)]
    pub config: ConfigMap,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<JobStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps,
            tags: Vec::new(),
            variables: Vec::new(),
            config: ConfigMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let mut entry = ConfigMap::new();
        entry.insert(key.into(), value.into());
        self.variables.push(entry);
        self
    }

    /// All non-empty string values stored under `key` across variables.
    pub fn variable_strings(&self, key: &str) -> Vec<String> {
        self.variables
            .iter()
            .filter_map(|vars| vars.get(key))
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&JobStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct SampleConfig {
        asx_code: String,
        #[serde(default)]
        force_refresh: bool,
    }

    #[test]
    fn parse_config_applies_defaults() {
        let step = JobStep::new("fetch", "asx_stock_collector").with("asx_code", "GNP");
        let config: SampleConfig = step.parse_config().unwrap();
        assert_eq!(config.asx_code, "GNP");
        assert!(!config.force_refresh);
    }

    #[test]
    fn parse_config_rejects_unknown_keys() {
        let step = JobStep::new("fetch", "asx_stock_collector")
            .with("asx_code", "GNP")
            .with("cache_hourz", 4);
        let err = step.parse_config::<SampleConfig>().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("cache_hourz"));
    }

    #[test]
    fn definition_deserializes_step_type() {
        let json = serde_json::json!({
            "name": "daily",
            "steps": [{ "name": "files", "type": "local_dir", "config": { "dir_path": "/tmp" } }],
            "variables": [{ "ticker": "ASX:GNP" }, { "asx_code": "bhp" }]
        });
        let def: JobDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.steps[0].step_type, "local_dir");
        assert_eq!(def.steps[0].on_error, ErrorStrategy::Fail);
        assert_eq!(def.variable_strings("ticker"), vec!["ASX:GNP"]);
        assert_eq!(def.variable_strings("asx_code"), vec!["bhp"]);
    }
}
