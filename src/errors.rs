//! Typed error hierarchy for the stagegate engine.
//!
//! One enum per subsystem:
//! - `StoreError`: session persistence and optimistic versioning
//! - `GateError`: resolving an approval gate
//! - `WorkerError`: stage worker and work item subtask calls
//! - `EngineError`: top-level operations, wrapping the others

use stagegate_common::{GateToken, SessionId, Stage};
use thiserror::Error;

/// Errors from a session store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session {id} not found")]
    NotFound { id: SessionId },

    #[error("Session {id} already exists")]
    AlreadyExists { id: SessionId },

    #[error("Version conflict on session {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: SessionId,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to (de)serialize session record: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Errors from resolving an approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("Stale gate token {presented}: the gate was already resolved or reopened")]
    StaleToken { presented: GateToken },

    #[error("No pending gate: session is at stage {stage} and not awaiting a decision")]
    NoPendingGate { stage: Stage },

    #[error("Malformed decision: {reason}")]
    MalformedDecision { reason: String },

    #[error("Session is closed at stage {stage}")]
    SessionClosed { stage: Stage },
}

/// Errors from a stage worker or work item subtask call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Retried by the call policy; never reaches the revision counters.
    #[error("Transient worker failure: {0}")]
    Transient(String),

    #[error("Worker failed: {0}")]
    Permanent(String),

    #[error("Call denied by governor: {0}")]
    Denied(String),

    #[error("Call to {label} deferred {deferrals} times without admission")]
    DeferralsExhausted { label: String, deferrals: u32 },
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from top-level engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Invalid output from {stage} worker: {reason}")]
    InvalidStageOutput { stage: Stage, reason: String },

    #[error("Gave up on session {id} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { id: SessionId, attempts: u32 },

    #[error("No artifact '{key}' in session {id}")]
    ArtifactNotFound { id: SessionId, key: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(StoreError::NotFound { .. }) => "not_found",
            Self::Store(StoreError::VersionConflict { .. }) => "version_conflict",
            Self::Store(_) => "store",
            Self::Gate(GateError::StaleToken { .. }) => "stale_token",
            Self::Gate(GateError::NoPendingGate { .. }) => "no_pending_gate",
            Self::Gate(GateError::MalformedDecision { .. }) => "malformed_decision",
            Self::Gate(GateError::SessionClosed { .. }) => "session_closed",
            Self::Worker(_) => "worker",
            Self::InvalidStageOutput { .. } => "invalid_output",
            Self::ConflictRetriesExhausted { .. } => "conflict_retries_exhausted",
            Self::ArtifactNotFound { .. } => "not_found",
            Self::Other(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::NotFound { .. }) | Self::ArtifactNotFound { .. }
        )
    }
}
