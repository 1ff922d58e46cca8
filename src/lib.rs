//! Resumable, human-gated pipeline orchestration.
//!
//! A session moves through the gated stages `requirements`, `tech_stack`,
//! `design` and `plan`, pausing at each for an external decision, and then
//! works through the backlog decomposed from the approved plan. See
//! [`pipeline::Engine`] for the entry points.

pub mod config;
pub mod errors;
pub mod events;
pub mod gate;
pub mod janitor;
pub mod logging;
pub mod pipeline;
pub mod revision;
pub mod router;
pub mod server;
pub mod store;
pub mod work;
pub mod worker;

pub use errors::{EngineError, GateError, StoreError, WorkerError};
pub use pipeline::{Engine, EngineSettings};
