//! Credential handling with secure memory.
//!
//! API keys referenced by step configs are resolved in a fixed order:
//! environment variable, then the key/value store, then the config
//! fallback. Resolved values are held in `SecretString` so they never
//! appear in logs or error messages.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretBox};
use tracing::debug;

use crate::error::{EngineError, Result};

/// A secret string that won't be logged or displayed.
pub struct SecretString(SecretBox<str>);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(Box::from(value.into().as_str())))
    }

    /// Expose the secret value for use.
    ///
    /// Only call this when actually using the secret (e.g., in an API request).
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Key/value store holding user-managed credentials.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Name inside a `{name}` placeholder, if `value` is one.
pub fn placeholder_name(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.len() > 2 && value.starts_with('{') && value.ends_with('}') {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}

/// Resolves named API keys: env, then KV store, then fallback.
#[derive(Clone)]
pub struct ApiKeyResolver {
    env_prefix: String,
    kv: Option<Arc<dyn KeyValueStore>>,
}

impl ApiKeyResolver {
    pub fn new(env_prefix: impl Into<String>, kv: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            env_prefix: env_prefix.into(),
            kv,
        }
    }

    /// Environment variable consulted for `name`: `<PREFIX>_<NAME>`.
    pub fn env_var_name(&self, name: &str) -> String {
        format!("{}_{}", self.env_prefix, name.to_uppercase())
    }

    /// Resolve `name` against the process environment.
    pub async fn resolve(&self, name: &str, fallback: Option<&str>) -> Result<SecretString> {
        self.resolve_with(name, fallback, |var| std::env::var(var).ok()).await
    }

    /// Resolve a step's `api_key` value: a literal, or a `{name}` reference.
    pub async fn resolve_config_value(&self, value: &str) -> Result<SecretString> {
        match placeholder_name(value) {
            Some(name) => self.resolve(name, None).await,
            None if !value.trim().is_empty() => Ok(SecretString::new(value.trim())),
            None => Err(EngineError::MissingCredential {
                name: "api_key".into(),
            }),
        }
    }

    async fn resolve_with<F>(&self, name: &str, fallback: Option<&str>, env: F) -> Result<SecretString>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = self.env_var_name(name);
        if let Some(value) = env(&var).filter(|v| !v.is_empty()) {
            debug!(key = %name, source = "env", "Resolved API key");
            return Ok(SecretString::new(value));
        }

        if let Some(kv) = &self.kv {
            match kv.get(name).await {
                Ok(Some(value)) if !value.is_empty() => {
                    debug!(key = %name, source = "kv", "Resolved API key");
                    return Ok(SecretString::new(value));
                }
                Ok(_) => {}
                Err(e) => debug!(key = %name, error = %e, "KV lookup failed, trying fallback"),
            }
        }

        match fallback.filter(|v| !v.is_empty()) {
            Some(value) => Ok(SecretString::new(value)),
            None => Err(EngineError::MissingCredential { name: name.to_string() }),
        }
    }
}

impl fmt::Debug for ApiKeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyResolver")
            .field("env_prefix", &self.env_prefix)
            .field("kv", &self.kv.is_some())
            .finish()
    }
}
