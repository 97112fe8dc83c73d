//! Domain data types shared by workers and the engine.

pub mod definition;
pub mod document;
pub mod ticker;
pub mod work;

pub use definition::{ConfigMap, ErrorStrategy, JobDefinition, JobStep};
pub use document::{Document, SourceKey, WorkerOutcome};
pub use ticker::Ticker;
pub use work::{InitResult, Strategy, WorkItem};
