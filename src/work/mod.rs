//! The work item loop: a backlog of items taken through generate,
//! quality check, test and integrate, with bounded self-correction.

pub mod backlog;
mod runner;

pub use backlog::{NextAction, blocked_on, decompose, next_action};
pub use runner::step_status;
