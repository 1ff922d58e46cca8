use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{FailureReason, GateToken, PendingGate, SessionId};
use crate::stage::Stage;
use crate::work_item::BacklogSummary;

/// Coarse run state of a session as seen by an external actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    AwaitingDecision,
    Running,
    Finalized,
    Terminated,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingDecision => "awaiting_decision",
            Self::Running => "running",
            Self::Finalized => "finalized",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Terminated | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The open gate as presented to a decision maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateView {
    pub stage: Stage,
    pub lock_token: GateToken,
    pub payload: Value,
    pub payload_version: u32,
    pub opened_at: DateTime<Utc>,
}

impl From<&PendingGate> for GateView {
    fn from(gate: &PendingGate) -> Self {
        Self {
            stage: gate.stage,
            lock_token: gate.lock_token,
            payload: gate.payload.content.clone(),
            payload_version: gate.payload.version,
            opened_at: gate.opened_at,
        }
    }
}

/// Read-only projection of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub version: u64,
    pub current_stage: Stage,
    pub state: RunState,
    pub pending_gate: Option<GateView>,
    pub completed_stages: Vec<Stage>,
    pub backlog_summary: BacklogSummary,
    pub revision_counts: BTreeMap<String, u32>,
    pub failure: Option<FailureReason>,
    pub last_activity: DateTime<Utc>,
}

/// One row of a session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub current_stage: Stage,
    pub state: RunState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
