//! Storage implementations.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryDocumentStore, MemoryJobStore, MemoryKvStore};

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
