use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::stage::Stage;

/// Kind of a pipeline progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Synthetic first event of a subscription carrying current state.
    Snapshot,
    SessionStarted,
    StageStarted,
    GateOpened,
    DecisionApplied,
    DecisionRejected,
    StageApproved,
    RevisionRequested,
    BacklogCreated,
    WorkItemStarted,
    WorkItemStepPassed,
    WorkItemStepFailed,
    WorkItemRevising,
    WorkItemDone,
    WorkItemFailed,
    PipelineDeadlock,
    WorkerRetry,
    SessionFinalized,
    SessionTerminated,
    SessionFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::SessionStarted => "session_started",
            Self::StageStarted => "stage_started",
            Self::GateOpened => "gate_opened",
            Self::DecisionApplied => "decision_applied",
            Self::DecisionRejected => "decision_rejected",
            Self::StageApproved => "stage_approved",
            Self::RevisionRequested => "revision_requested",
            Self::BacklogCreated => "backlog_created",
            Self::WorkItemStarted => "work_item_started",
            Self::WorkItemStepPassed => "work_item_step_passed",
            Self::WorkItemStepFailed => "work_item_step_failed",
            Self::WorkItemRevising => "work_item_revising",
            Self::WorkItemDone => "work_item_done",
            Self::WorkItemFailed => "work_item_failed",
            Self::PipelineDeadlock => "pipeline_deadlock",
            Self::WorkerRetry => "worker_retry",
            Self::SessionFinalized => "session_finalized",
            Self::SessionTerminated => "session_terminated",
            Self::SessionFailed => "session_failed",
        }
    }

    /// No further events follow a terminal event for the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionFinalized | Self::SessionTerminated | Self::SessionFailed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress notification for one session.
///
/// `seq` is assigned by the store when the event is logged and is strictly
/// increasing per session, even across processes sharing one store,
/// so subscribers can order and de-duplicate what they receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub session_id: SessionId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub detail: String,
}

impl PipelineEvent {
    /// Build an event without a sequence number; the emitter assigns it.
    pub fn new(session_id: SessionId, stage: Stage, kind: EventKind) -> Self {
        Self {
            session_id,
            seq: 0,
            timestamp: Utc::now(),
            stage,
            kind,
            item_id: None,
            detail: String::new(),
        }
    }

    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
