//! Credential resolution and secret handling.

pub mod credentials;

pub use credentials::{placeholder_name, ApiKeyResolver, KeyValueStore, SecretString};
