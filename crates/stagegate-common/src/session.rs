use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::decision::{Decision, Transition};
use crate::stage::Stage;
use crate::status::{GateView, RunState, SessionStatus, SessionSummary};
use crate::work_item::{BacklogSummary, WorkItem};

/// Opaque identifier of a pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// One-time credential identifying a single open gate instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateToken(Uuid);

impl GateToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GateToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GateToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// SHA-256 hex digest of an artifact's canonical JSON text.
pub fn content_digest(content: &Value) -> String {
    format!("{:x}", Sha256::digest(content.to_string().as_bytes()))
}

/// An opaque stage or work item output with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: Value,
    pub version: u32,
    pub digest: String,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(content: Value, version: u32) -> Self {
        let digest = content_digest(&content);
        Self {
            content,
            version,
            digest,
            produced_at: Utc::now(),
        }
    }
}

/// A suspended gate awaiting exactly one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGate {
    pub stage: Stage,
    pub payload: Artifact,
    pub lock_token: GateToken,
    pub opened_at: DateTime<Utc>,
}

/// Record of an applied gate decision, kept so that a retried identical
/// decision can be answered without being applied twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResolution {
    pub token: GateToken,
    pub stage: Stage,
    pub decision: Decision,
    pub transition: Transition,
    pub resolved_at: DateTime<Utc>,
}

/// Why a session or work item ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    RevisionsExhausted {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    PipelineDeadlock {
        #[serde(default)]
        blocked_on: Vec<String>,
    },
    Timeout {
        idle_secs: u64,
    },
    WorkerError {
        detail: String,
    },
    InvalidOutput {
        detail: String,
    },
    WorkItemsFailed {
        items: Vec<String>,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RevisionsExhausted { key, detail } => match detail {
                Some(d) => write!(f, "revisions-exhausted({}): {}", key, d),
                None => write!(f, "revisions-exhausted({})", key),
            },
            Self::PipelineDeadlock { blocked_on } if blocked_on.is_empty() => {
                f.write_str("pipeline-deadlock")
            }
            Self::PipelineDeadlock { blocked_on } => {
                write!(f, "pipeline-deadlock (blocked on {})", blocked_on.join(", "))
            }
            Self::Timeout { idle_secs } => write!(f, "timeout (idle {}s)", idle_secs),
            Self::WorkerError { detail } => write!(f, "worker-error: {}", detail),
            Self::InvalidOutput { detail } => write!(f, "invalid-output: {}", detail),
            Self::WorkItemsFailed { items } => {
                write!(f, "work-items-failed: {}", items.join(", "))
            }
        }
    }
}

/// Key of a revision counter: a gated stage or a work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevisionKey {
    Stage(Stage),
    WorkItem(String),
}

impl RevisionKey {
    /// Map key used in `revision_counts` and `revision_feedback`.
    pub fn as_key(&self) -> String {
        match self {
            Self::Stage(stage) => stage.as_str().to_string(),
            Self::WorkItem(id) => format!("item:{}", id),
        }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// The unit of durability: full state of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    /// Optimistic concurrency version, owned by the session store.
    pub version: u64,
    pub input_document: String,
    pub current_stage: Stage,
    #[serde(default)]
    pub stage_outputs: BTreeMap<Stage, Artifact>,
    #[serde(default)]
    pub completed_stages: Vec<Stage>,
    #[serde(default)]
    pub pending_gate: Option<PendingGate>,
    #[serde(default)]
    pub revision_feedback: BTreeMap<String, String>,
    #[serde(default)]
    pub work_item_backlog: Vec<WorkItem>,
    #[serde(default)]
    pub revision_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub gate_history: Vec<GateResolution>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(input_document: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            version: 0,
            input_document: input_document.into(),
            current_stage: Stage::Requirements,
            stage_outputs: BTreeMap::new(),
            completed_stages: Vec::new(),
            pending_gate: None,
            revision_feedback: BTreeMap::new(),
            work_item_backlog: Vec::new(),
            revision_counts: BTreeMap::new(),
            gate_history: Vec::new(),
            failure: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Token of the currently open gate.
    pub fn lock_token(&self) -> Option<GateToken> {
        self.pending_gate.as_ref().map(|g| g.lock_token)
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    pub fn is_suspended(&self) -> bool {
        self.pending_gate.is_some()
    }

    /// Append a stage to `completed_stages` unless already present.
    /// Returns whether the stage was appended.
    pub fn mark_completed(&mut self, stage: Stage) -> bool {
        if self.completed_stages.contains(&stage) {
            return false;
        }
        self.completed_stages.push(stage);
        true
    }

    pub fn revision_count(&self, key: &RevisionKey) -> u32 {
        self.revision_counts.get(&key.as_key()).copied().unwrap_or(0)
    }

    pub fn feedback_for(&self, key: &RevisionKey) -> Option<&str> {
        self.revision_feedback.get(&key.as_key()).map(String::as_str)
    }

    pub fn work_item(&self, id: &str) -> Option<&WorkItem> {
        self.work_item_backlog.iter().find(|i| i.id == id)
    }

    pub fn work_item_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.work_item_backlog.iter_mut().find(|i| i.id == id)
    }

    /// Look up an applied decision by the token it was applied with.
    pub fn find_resolution(&self, token: GateToken) -> Option<&GateResolution> {
        self.gate_history.iter().find(|r| r.token == token)
    }

    /// Artifact for a stage name or a work item id.
    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        if let Ok(stage) = key.parse::<Stage>()
            && let Some(artifact) = self.stage_outputs.get(&stage)
        {
            return Some(artifact);
        }
        self.work_item(key).and_then(|item| item.artifact.as_ref())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Move the session to `Failed`, clearing any open gate.
    pub fn fail(&mut self, reason: FailureReason) {
        self.current_stage = Stage::Failed;
        self.pending_gate = None;
        self.failure = Some(reason);
    }

    pub fn run_state(&self) -> RunState {
        match self.current_stage {
            Stage::Finalized => RunState::Finalized,
            Stage::Terminated => RunState::Terminated,
            Stage::Failed => RunState::Failed,
            _ if self.pending_gate.is_some() => RunState::AwaitingDecision,
            _ => RunState::Running,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id,
            version: self.version,
            current_stage: self.current_stage,
            state: self.run_state(),
            pending_gate: self.pending_gate.as_ref().map(GateView::from),
            completed_stages: self.completed_stages.clone(),
            backlog_summary: BacklogSummary::from_items(&self.work_item_backlog),
            revision_counts: self.revision_counts.clone(),
            failure: self.failure.clone(),
            last_activity: self.last_activity,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            current_stage: self.current_stage,
            state: self.run_state(),
            version: self.version,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_session_starts_at_requirements() {
        let session = Session::new("build a todo app");
        assert_eq!(session.current_stage, Stage::Requirements);
        assert!(session.completed_stages.is_empty());
        assert!(session.pending_gate.is_none());
        assert!(session.work_item_backlog.is_empty());
        assert_eq!(session.run_state(), RunState::Running);
    }

    #[test]
    fn mark_completed_never_duplicates() {
        let mut session = Session::new("doc");
        assert!(session.mark_completed(Stage::Requirements));
        assert!(!session.mark_completed(Stage::Requirements));
        assert_eq!(session.completed_stages, vec![Stage::Requirements]);
    }

    #[test]
    fn artifact_digest_is_stable() {
        let a = Artifact::new(json!({"summary": "X"}), 1);
        let b = Artifact::new(json!({"summary": "X"}), 2);
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
        let c = Artifact::new(json!({"summary": "Y"}), 1);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn artifact_lookup_by_stage_or_item() {
        let mut session = Session::new("doc");
        session
            .stage_outputs
            .insert(Stage::Design, Artifact::new(json!({"d": 1}), 1));
        let mut item = WorkItem::new("api", "coder", vec![]);
        item.artifact = Some(Artifact::new(json!("fn main() {}"), 1));
        session.work_item_backlog.push(item);

        assert_eq!(session.artifact("design").unwrap().content["d"], 1);
        assert_eq!(session.artifact("api").unwrap().content, json!("fn main() {}"));
        assert!(session.artifact("plan").is_none());
        assert!(session.artifact("missing").is_none());
    }

    #[test]
    fn revision_keys_do_not_collide() {
        assert_eq!(RevisionKey::Stage(Stage::Plan).as_key(), "plan");
        assert_eq!(RevisionKey::WorkItem("plan".into()).as_key(), "item:plan");
    }

    #[test]
    fn fail_clears_gate_and_records_reason() {
        let mut session = Session::new("doc");
        session.pending_gate = Some(PendingGate {
            stage: Stage::Requirements,
            payload: Artifact::new(json!({}), 1),
            lock_token: GateToken::new(),
            opened_at: Utc::now(),
        });
        session.fail(FailureReason::Timeout { idle_secs: 30 });
        assert_eq!(session.current_stage, Stage::Failed);
        assert!(session.pending_gate.is_none());
        assert_eq!(session.run_state(), RunState::Failed);
        assert_eq!(
            session.failure.as_ref().unwrap().to_string(),
            "timeout (idle 30s)"
        );
    }

    #[test]
    fn session_json_round_trip_keeps_stage_keys() {
        let mut session = Session::new("doc");
        session
            .stage_outputs
            .insert(Stage::TechStack, Artifact::new(json!({"lang": "rust"}), 1));
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"tech_stack\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn deadlock_reason_displays_short_form() {
        let reason = FailureReason::PipelineDeadlock { blocked_on: vec![] };
        assert_eq!(reason.to_string(), "pipeline-deadlock");
        let reason = FailureReason::PipelineDeadlock {
            blocked_on: vec!["a".into()],
        };
        assert!(reason.to_string().starts_with("pipeline-deadlock"));
    }
}
