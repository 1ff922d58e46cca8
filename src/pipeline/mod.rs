//! The stage pipeline controller.
//!
//! An [`Engine`] owns no session state of its own. Every transition is a
//! load, a synchronous mutation and a versioned save through [`Engine::commit`];
//! a version conflict reloads the session and re-applies the whole
//! transition. Worker calls happen outside commits, so a session is never
//! locked while a worker runs.

mod stage;
pub mod transition;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use stagegate_common::{
    Artifact, DecisionRequest, EventKind, GateToken, PipelineEvent, RunState, Session, SessionId,
    SessionStatus, SessionSummary, Stage,
};

use crate::errors::{EngineError, GateError};
use crate::events::EventHub;
use crate::gate::{self, Resolution};
use crate::janitor::{self, SweepReport};
use crate::store::SharedStore;
use crate::worker::{RetryPolicy, Workers};

pub use transition::{Applied, apply_transition};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Limits the engine enforces.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    stage_revisions: BTreeMap<Stage, u32>,
    pub max_stage_revisions: u32,
    pub max_item_revisions: u32,
    /// Reload-and-reapply attempts after a version conflict
    pub conflict_retries: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stage_revisions: BTreeMap::new(),
            max_stage_revisions: 3,
            max_item_revisions: 3,
            conflict_retries: 5,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn with_stage_revisions(mut self, stage: Stage, max: u32) -> Self {
        self.stage_revisions.insert(stage, max);
        self
    }

    pub fn with_max_stage_revisions(mut self, max: u32) -> Self {
        self.max_stage_revisions = max;
        self
    }

    pub fn with_max_item_revisions(mut self, max: u32) -> Self {
        self.max_item_revisions = max;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn max_revisions_for(&self, stage: Stage) -> u32 {
        self.stage_revisions
            .get(&stage)
            .copied()
            .unwrap_or(self.max_stage_revisions)
    }
}

/// Result of a commit closure.
pub(crate) enum Step<R> {
    /// Save the mutated session.
    Save(R),
    /// Leave the stored session alone. The closure must not have mutated it.
    Skip(R),
}

/// Marks a session as being driven; removed on drop.
struct DriveGuard<'a> {
    driving: &'a Mutex<HashSet<SessionId>>,
    id: SessionId,
}

impl<'a> DriveGuard<'a> {
    fn acquire(driving: &'a Mutex<HashSet<SessionId>>, id: SessionId) -> Option<Self> {
        let mut set = driving
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.insert(id).then_some(Self { driving, id })
    }
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.driving
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

pub struct Engine {
    pub(crate) store: SharedStore,
    pub(crate) events: EventHub,
    pub(crate) workers: Workers,
    pub(crate) settings: EngineSettings,
    driving: Mutex<HashSet<SessionId>>,
}

impl Engine {
    pub fn new(store: SharedStore, workers: Workers, settings: EngineSettings) -> Self {
        let events = EventHub::new(store.clone(), DEFAULT_EVENT_BUFFER);
        Self {
            store,
            events,
            workers,
            settings,
            driving: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.events = EventHub::new(self.store.clone(), buffer);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Load, mutate and save `id`, re-applying `apply` on version conflicts.
    pub(crate) async fn commit<R, F>(&self, id: SessionId, mut apply: F) -> Result<(Session, R), EngineError>
    where
        F: FnMut(&mut Session) -> Result<Step<R>, EngineError>,
    {
        let mut conflicts = 0;
        loop {
            let mut session = self.store.load(id).await?;
            let expected = session.version;
            let outcome = match apply(&mut session)? {
                Step::Skip(outcome) => return Ok((session, outcome)),
                Step::Save(outcome) => outcome,
            };
            session.touch(Utc::now());
            match self.store.save(session, expected).await {
                Ok(saved) => return Ok((saved, outcome)),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.settings.conflict_retries {
                        return Err(EngineError::ConflictRetriesExhausted {
                            id,
                            attempts: conflicts,
                        });
                    }
                    tracing::warn!(session = %id, attempt = conflicts, "version conflict, reapplying transition");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) async fn emit(&self, event: PipelineEvent) {
        self.events.emit(event).await;
    }

    /// Create a session for `input_document` at the first stage.
    pub async fn create_session(&self, input_document: impl Into<String>) -> Result<Session, EngineError> {
        let session = self.store.create(Session::new(input_document)).await?;
        tracing::info!(session = %session.session_id, "session started");
        self.emit(PipelineEvent::new(
            session.session_id,
            session.current_stage,
            EventKind::SessionStarted,
        ))
        .await;
        Ok(session)
    }

    /// Create a session and drive it in the background.
    pub async fn start_pipeline(
        self: &Arc<Self>,
        input_document: impl Into<String>,
    ) -> Result<SessionId, EngineError> {
        let session = self.create_session(input_document).await?;
        let id = session.session_id;
        self.spawn_drive(id);
        Ok(id)
    }

    /// Drive `id` on a background task, logging any failure.
    pub fn spawn_drive(self: &Arc<Self>, id: SessionId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drive(id).await {
                tracing::error!(session = %id, error = %e, "pipeline drive failed");
            }
        });
    }

    /// Drive every session that is neither waiting at a gate nor ended,
    /// such as one whose process stopped mid-stage. Returns their ids.
    pub async fn resume_interrupted(self: &Arc<Self>) -> Result<Vec<SessionId>, EngineError> {
        let interrupted: Vec<SessionId> = self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|summary| summary.state == RunState::Running)
            .map(|summary| summary.session_id)
            .collect();
        for id in &interrupted {
            tracing::info!(session = %id, "resuming interrupted session");
            self.spawn_drive(*id);
        }
        Ok(interrupted)
    }

    /// Resume a session that is not waiting at a gate.
    ///
    /// Fails with `SessionClosed` once the session has ended; a suspended
    /// session is returned as is, since only a decision moves it on.
    pub async fn resume(&self, id: SessionId) -> Result<SessionStatus, EngineError> {
        let session = self.store.load(id).await?;
        if session.is_terminal() {
            return Err(GateError::SessionClosed {
                stage: session.current_stage,
            }
            .into());
        }
        self.drive(id).await
    }

    /// Run the session until it waits at a gate or ends.
    ///
    /// Returns immediately with the current status if another task is
    /// already driving the session.
    pub async fn drive(&self, id: SessionId) -> Result<SessionStatus, EngineError> {
        loop {
            {
                let Some(_guard) = DriveGuard::acquire(&self.driving, id) else {
                    return self.get_status(id).await;
                };
                self.run_until_blocked(id).await?;
            }
            // A decision may have landed between the last step and the guard
            // being released; its drive would have bailed out.
            let session = self.store.load(id).await?;
            if session.is_suspended() || session.is_terminal() {
                return Ok(session.status());
            }
        }
    }

    async fn run_until_blocked(&self, id: SessionId) -> Result<(), EngineError> {
        loop {
            let session = self.store.load(id).await?;
            if session.is_terminal() || session.is_suspended() {
                return Ok(());
            }
            match session.current_stage {
                stage if stage.is_gated() => self.run_stage(&session, stage).await?,
                Stage::Generation => self.work_step(&session).await?,
                _ => return Ok(()),
            }
        }
    }

    /// Apply a decision to the open gate of `id`.
    ///
    /// The pipeline is not driven here; callers resume it with
    /// [`Engine::drive`] or [`Engine::spawn_drive`].
    ///
    /// Repeating an applied decision with the same token changes nothing
    /// and returns the session's current status, which may have moved past
    /// the status the decision first produced.
    pub async fn submit_decision(
        &self,
        id: SessionId,
        token: GateToken,
        request: &DecisionRequest,
    ) -> Result<SessionStatus, EngineError> {
        let settings = &self.settings;
        let committed = self
            .commit(id, |session| {
                let now = Utc::now();
                match gate::resolve(session, token, request, now)? {
                    Resolution::Replayed(prior) => Ok(Step::Skip((prior.stage, None))),
                    Resolution::Applied(transition) => {
                        let stage = session.gate_history.last().map(|r| r.stage).unwrap_or(session.current_stage);
                        let feedback = request.feedback.as_deref().map(str::trim);
                        let applied = apply_transition(session, settings, stage, &transition, feedback)?;
                        Ok(Step::Save((stage, Some(applied))))
                    }
                }
            })
            .await;

        let (session, (stage, applied)) = match committed {
            Ok(committed) => committed,
            Err(EngineError::Gate(GateError::MalformedDecision { reason })) => {
                tracing::warn!(session = %id, %reason, "decision rejected");
                let stage = self
                    .store
                    .load(id)
                    .await
                    .map(|s| s.current_stage)
                    .unwrap_or_default();
                self.emit(
                    PipelineEvent::new(id, stage, EventKind::DecisionRejected).with_detail(reason.clone()),
                )
                .await;
                return Err(GateError::MalformedDecision { reason }.into());
            }
            Err(e) => return Err(e),
        };

        let Some(applied) = applied else {
            tracing::info!(session = %id, %token, "decision already applied, replaying result");
            return Ok(session.status());
        };

        tracing::info!(session = %id, %stage, decision = %request.decision, "decision applied");
        self.emit(
            PipelineEvent::new(id, stage, EventKind::DecisionApplied)
                .with_detail(request.decision.trim().to_lowercase()),
        )
        .await;
        self.emit_applied(id, &applied).await;
        Ok(session.status())
    }

    pub(crate) async fn emit_applied(&self, id: SessionId, applied: &Applied) {
        match applied {
            Applied::Advanced { from, to, backlog } => {
                self.emit(
                    PipelineEvent::new(id, *from, EventKind::StageApproved)
                        .with_detail(format!("advancing to {}", to)),
                )
                .await;
                if let Some(count) = backlog {
                    self.emit(
                        PipelineEvent::new(id, *to, EventKind::BacklogCreated)
                            .with_detail(format!("{} work items", count)),
                    )
                    .await;
                }
            }
            Applied::Revising { stage, attempt, max } => {
                self.emit(
                    PipelineEvent::new(id, *stage, EventKind::RevisionRequested)
                        .with_detail(format!("revision {} of {}", attempt, max)),
                )
                .await;
            }
            Applied::Terminated => {
                tracing::info!(session = %id, "session terminated");
                self.emit(PipelineEvent::new(id, Stage::Terminated, EventKind::SessionTerminated))
                    .await;
            }
            Applied::Failed(reason) => {
                tracing::warn!(session = %id, %reason, "session failed");
                self.emit(
                    PipelineEvent::new(id, Stage::Failed, EventKind::SessionFailed)
                        .with_detail(reason.to_string()),
                )
                .await;
            }
        }
    }

    pub async fn get_status(&self, id: SessionId) -> Result<SessionStatus, EngineError> {
        Ok(self.store.load(id).await?.status())
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Session, EngineError> {
        Ok(self.store.load(id).await?)
    }

    /// Artifact of a stage (by name) or a work item (by id).
    pub async fn get_artifact(&self, id: SessionId, key: &str) -> Result<Artifact, EngineError> {
        let session = self.store.load(id).await?;
        session
            .artifact(key)
            .cloned()
            .ok_or_else(|| EngineError::ArtifactNotFound {
                id,
                key: key.to_string(),
            })
    }

    /// Live events, starting with a snapshot of the current state.
    pub async fn stream_events(&self, id: SessionId) -> Result<BoxStream<'static, PipelineEvent>, EngineError> {
        Ok(self.events.subscribe(id).await?)
    }

    /// Persisted events, oldest first.
    pub async fn event_log(&self, id: SessionId) -> Result<Vec<PipelineEvent>, EngineError> {
        self.store.load(id).await?;
        Ok(self.events.history(id).await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, EngineError> {
        Ok(self.store.list().await?)
    }

    /// Fail sessions idle for longer than `idle_timeout`.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Result<SweepReport, EngineError> {
        janitor::sweep(&self.store, &self.events, idle_timeout, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, SessionStore};
    use crate::worker::{ScriptedStageWorker, ScriptedSubtasks, SubtaskRegistry};
    use serde_json::json;

    fn engine_with(stage: ScriptedStageWorker) -> (Arc<Engine>, Arc<ScriptedStageWorker>) {
        let store: SharedStore = Arc::new(MemorySessionStore::new());
        let stage = Arc::new(stage);
        let workers = Workers::new(
            stage.clone(),
            SubtaskRegistry::new(Arc::new(ScriptedSubtasks::new())),
        );
        let settings = EngineSettings::default().with_retry_policy(RetryPolicy::immediate());
        (Arc::new(Engine::new(store, workers, settings)), stage)
    }

    #[test]
    fn settings_fall_back_to_default_stage_limit() {
        let settings = EngineSettings::default()
            .with_max_stage_revisions(4)
            .with_stage_revisions(Stage::Design, 1);
        assert_eq!(settings.max_revisions_for(Stage::Design), 1);
        assert_eq!(settings.max_revisions_for(Stage::Requirements), 4);
    }

    #[tokio::test]
    async fn drive_suspends_at_first_gate() {
        let (engine, worker) =
            engine_with(ScriptedStageWorker::new().with_output(Stage::Requirements, json!({"summary": "X"})));
        let session = engine.create_session("build a thing").await.unwrap();

        let status = engine.drive(session.session_id).await.unwrap();
        assert_eq!(status.state, RunState::AwaitingDecision);
        let gate = status.pending_gate.unwrap();
        assert_eq!(gate.stage, Stage::Requirements);
        assert_eq!(gate.payload, json!({"summary": "X"}));
        assert_eq!(worker.calls_for(Stage::Requirements).len(), 1);
    }

    #[tokio::test]
    async fn drive_of_suspended_session_is_a_no_op() {
        let (engine, worker) = engine_with(ScriptedStageWorker::new());
        let id = engine.create_session("doc").await.unwrap().session_id;
        let first = engine.drive(id).await.unwrap();
        let second = engine.drive(id).await.unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(worker.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_reapplies_after_conflict() {
        let (engine, _) = engine_with(ScriptedStageWorker::new());
        let id = engine.create_session("doc").await.unwrap().session_id;
        let store = engine.store().clone();

        let mut interfered = false;
        let (saved, ()) = engine
            .commit(id, |session| {
                if !interfered {
                    interfered = true;
                    // Simulate another writer landing first.
                    let other = session.clone();
                    let store = store.clone();
                    let expected = other.version;
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current()
                            .block_on(store.save(other, expected))
                    })
                    .unwrap();
                }
                session.revision_feedback.insert("design".into(), "x".into());
                Ok(Step::Save(()))
            })
            .await
            .unwrap();
        assert_eq!(saved.version, 3);
        assert_eq!(saved.revision_feedback["design"], "x");
    }

    #[tokio::test]
    async fn artifact_lookup_reports_missing_keys() {
        let (engine, _) = engine_with(ScriptedStageWorker::new());
        let id = engine.create_session("doc").await.unwrap().session_id;
        engine.drive(id).await.unwrap();

        let artifact = engine.get_artifact(id, "requirements").await.unwrap();
        assert_eq!(artifact.version, 1);
        let err = engine.get_artifact(id, "design").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn resume_drives_an_interrupted_session_to_its_gate() {
        let (engine, _) = engine_with(ScriptedStageWorker::new());
        // Created but never driven, as after a crash before the first stage ran.
        let id = engine.create_session("doc").await.unwrap().session_id;
        assert_eq!(engine.get_status(id).await.unwrap().state, RunState::Running);

        let status = engine.resume(id).await.unwrap();
        assert_eq!(status.state, RunState::AwaitingDecision);
        assert_eq!(status.pending_gate.unwrap().stage, Stage::Requirements);
    }

    #[tokio::test]
    async fn resume_of_ended_session_is_closed() {
        let (engine, _) = engine_with(ScriptedStageWorker::new());
        let id = engine.create_session("doc").await.unwrap().session_id;
        let status = engine.drive(id).await.unwrap();
        let token = status.pending_gate.unwrap().lock_token;
        engine
            .submit_decision(id, token, &DecisionRequest::abort())
            .await
            .unwrap();

        let err = engine.resume(id).await.unwrap_err();
        assert_eq!(err.kind(), "session_closed");
    }

    #[tokio::test]
    async fn resume_interrupted_skips_suspended_and_ended_sessions() {
        let (engine, _) = engine_with(ScriptedStageWorker::new());
        let suspended = engine.create_session("a").await.unwrap().session_id;
        engine.drive(suspended).await.unwrap();
        let interrupted = engine.create_session("b").await.unwrap().session_id;

        let resumed = engine.resume_interrupted().await.unwrap();
        assert_eq!(resumed, vec![interrupted]);

        let mut state = RunState::Running;
        for _ in 0..100 {
            state = engine.get_status(interrupted).await.unwrap().state;
            if state != RunState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, RunState::AwaitingDecision);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (engine, _) = engine_with(ScriptedStageWorker::new());
        let err = engine.get_status(SessionId::new()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
