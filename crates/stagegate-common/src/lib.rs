//! Shared domain types for the stagegate orchestrator.
//!
//! Everything in this crate is plain data plus small pure helpers: no I/O,
//! no async, no persistence. The engine crate owns every effectful
//! operation and passes these records through its transitions.

pub mod decision;
pub mod event;
pub mod session;
pub mod stage;
pub mod status;
pub mod work_item;

pub use decision::{Decision, DecisionRequest, Transition};
pub use event::{EventKind, PipelineEvent};
pub use session::{
    Artifact, FailureReason, GateResolution, GateToken, PendingGate, RevisionKey, Session,
    SessionId, content_digest,
};
pub use stage::Stage;
pub use status::{GateView, RunState, SessionStatus, SessionSummary};
pub use work_item::{BacklogSummary, WorkItem, WorkItemStatus};
