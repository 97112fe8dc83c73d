//! Core trait abstractions for the step engine.
//!
//! These traits define the collaborators that applications implement to
//! provide storage, search, credentials, queueing, and external data.

pub mod documents;
pub mod market;
pub mod queue;
