//! One step of the work item loop per call.
//!
//! The engine calls [`Engine::work_step`] while a session is in the
//! generation stage. Each call commits at least one transition, so the
//! loop always makes progress: a revision is accounted, an item is run
//! to its next resting state, deadlocked items are failed, or the
//! session is finished.

use std::collections::BTreeMap;

use serde_json::Value;
use stagegate_common::{
    Artifact, EventKind, FailureReason, PipelineEvent, RevisionKey, Session, SessionId, Stage,
    WorkItem, WorkItemStatus,
};

use super::backlog::{self, NextAction};
use crate::errors::EngineError;
use crate::pipeline::{Engine, Step};
use crate::revision::{AttemptResult, RevisionController};
use crate::worker::{CallLabel, SubtaskInput, SubtaskOutcome, SubtaskStep, invoke};

/// Item status recorded when `step` fails.
pub fn step_status(step: SubtaskStep) -> WorkItemStatus {
    match step {
        SubtaskStep::Generate | SubtaskStep::QualityCheck => WorkItemStatus::QualityFailed,
        SubtaskStep::Test => WorkItemStatus::TestFailed,
        SubtaskStep::Integrate => WorkItemStatus::IntegrationFailed,
    }
}

fn item_key(id: &str) -> RevisionKey {
    RevisionKey::WorkItem(id.to_string())
}

fn in_generation(session: &Session) -> bool {
    session.current_stage == Stage::Generation
}

/// Result of running an item's steps.
enum RunOutcome {
    Done,
    StepFailed { step: SubtaskStep, detail: String },
    WorkerFailed { step: SubtaskStep, detail: String },
    /// The session left generation while a step ran, e.g. the janitor failed it.
    Abandoned,
}

/// How the session ended once every item settled.
enum Completion {
    Finalized,
    Failed(FailureReason),
}

impl Engine {
    pub(crate) async fn work_step(&self, session: &Session) -> Result<(), EngineError> {
        match backlog::next_action(&session.work_item_backlog) {
            NextAction::Revise(idx) => {
                let id = session.work_item_backlog[idx].id.clone();
                self.revise_item(session.session_id, &id).await
            }
            NextAction::Run(idx) => {
                let id = session.work_item_backlog[idx].id.clone();
                self.run_item(session.session_id, &id).await
            }
            NextAction::Deadlock(pending) => {
                let ids: Vec<String> = pending
                    .iter()
                    .map(|idx| session.work_item_backlog[*idx].id.clone())
                    .collect();
                self.fail_deadlocked(session.session_id, &ids).await
            }
            NextAction::Complete => self.finish_generation(session.session_id).await,
        }
    }

    /// Account for a failed step: retry the item with feedback, or fail it.
    async fn revise_item(&self, id: SessionId, item_id: &str) -> Result<(), EngineError> {
        let controller = RevisionController::new(self.settings.max_item_revisions);
        let key = item_key(item_id);
        let (_, result) = self
            .commit(id, |session| {
                let failed_step = in_generation(session)
                    && session
                        .work_item(item_id)
                        .is_some_and(|i| i.status.is_step_failure());
                if !failed_step {
                    return Ok(Step::Skip(None));
                }
                let detail = session
                    .work_item(item_id)
                    .and_then(|i| i.last_failure.clone())
                    .unwrap_or_default();
                let result = controller.attempt(session, &key);
                match result {
                    AttemptResult::Continue { .. } => {
                        session.revision_feedback.insert(key.as_key(), detail);
                        if let Some(item) = session.work_item_mut(item_id) {
                            item.status = WorkItemStatus::InProgress;
                        }
                    }
                    AttemptResult::Exhausted { attempts } => {
                        if let Some(item) = session.work_item_mut(item_id) {
                            item.status = WorkItemStatus::Failed;
                            item.failure = Some(FailureReason::RevisionsExhausted {
                                key: key.as_key(),
                                detail: Some(if detail.is_empty() {
                                    format!("{} revisions used", attempts)
                                } else {
                                    detail
                                }),
                            });
                        }
                    }
                }
                Ok(Step::Save(Some(result)))
            })
            .await?;

        match result {
            Some(AttemptResult::Continue { attempt }) => {
                tracing::info!(session = %id, item = item_id, attempt, "revising work item");
                self.emit(
                    PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemRevising)
                        .with_item(item_id)
                        .with_detail(format!(
                            "revision {} of {}",
                            attempt,
                            controller.max_revisions()
                        )),
                )
                .await;
            }
            Some(AttemptResult::Exhausted { attempts }) => {
                tracing::warn!(session = %id, item = item_id, attempts, "work item revisions exhausted");
                self.emit(
                    PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemFailed)
                        .with_item(item_id)
                        .with_detail(format!("revisions-exhausted({})", key.as_key())),
                )
                .await;
            }
            None => {}
        }
        Ok(())
    }

    /// Run generate and the checks for one item and commit where it lands.
    async fn run_item(&self, id: SessionId, item_id: &str) -> Result<(), EngineError> {
        let (session, started) = self
            .commit(id, |session| {
                if !in_generation(session) {
                    return Ok(Step::Skip(None));
                }
                match session.work_item(item_id).map(|i| i.status) {
                    Some(WorkItemStatus::Pending) => {
                        if let Some(item) = session.work_item_mut(item_id) {
                            item.status = WorkItemStatus::InProgress;
                        }
                        Ok(Step::Save(Some(true)))
                    }
                    Some(WorkItemStatus::InProgress) => Ok(Step::Skip(Some(false))),
                    _ => Ok(Step::Skip(None)),
                }
            })
            .await?;
        let Some(fresh) = started else {
            return Ok(());
        };
        let Some(item) = session.work_item(item_id).cloned() else {
            return Ok(());
        };
        if fresh {
            self.emit(
                PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemStarted)
                    .with_item(item_id)
                    .with_detail(item.role_tag.clone()),
            )
            .await;
        }

        let context: BTreeMap<Stage, Value> = session
            .completed_stages
            .iter()
            .filter_map(|s| session.stage_outputs.get(s).map(|a| (*s, a.content.clone())))
            .collect();
        let mut input = SubtaskInput {
            session_id: id,
            feedback: session.feedback_for(&item_key(item_id)).map(str::to_string),
            artifact: item.artifact.as_ref().map(|a| a.content.clone()),
            item: item.clone(),
            context,
        };

        match self.run_steps(id, &item, &mut input).await? {
            RunOutcome::Done => self.complete_item(id, item_id).await,
            RunOutcome::StepFailed { step, detail } => {
                self.record_step_failure(id, item_id, step, detail).await
            }
            RunOutcome::WorkerFailed { step, detail } => {
                self.fail_item(id, item_id, step, detail).await
            }
            RunOutcome::Abandoned => {
                tracing::info!(session = %id, item = item_id, "session moved on, dropping work item result");
                Ok(())
            }
        }
    }

    async fn run_steps(
        &self,
        id: SessionId,
        item: &WorkItem,
        input: &mut SubtaskInput,
    ) -> Result<RunOutcome, EngineError> {
        let subtasks = self.workers.subtasks.for_role(&item.role_tag);
        let steps = std::iter::once(SubtaskStep::Generate).chain(SubtaskStep::CHECKS);
        for step in steps {
            let label = CallLabel::new(id, format!("item:{}:{}", item.id, step));
            let call_input = input.clone();
            let invocation = invoke(
                self.workers.governor.as_ref(),
                &self.settings.retry_policy,
                &label,
                || subtasks.run_step(step, &call_input),
            )
            .await;
            if !in_generation(&self.store.load(id).await?) {
                return Ok(RunOutcome::Abandoned);
            }
            if invocation.retries > 0 {
                self.emit(
                    PipelineEvent::new(id, Stage::Generation, EventKind::WorkerRetry)
                        .with_item(&item.id)
                        .with_detail(format!("{}: {} retries", step, invocation.retries)),
                )
                .await;
            }

            match invocation.result {
                Err(e) => {
                    return Ok(RunOutcome::WorkerFailed {
                        step,
                        detail: e.to_string(),
                    });
                }
                Ok(SubtaskOutcome::Fail { detail }) => {
                    return Ok(RunOutcome::StepFailed { step, detail });
                }
                Ok(SubtaskOutcome::Pass { output }) => {
                    if step == SubtaskStep::Generate {
                        let output = output.unwrap_or(Value::Null);
                        self.store_item_artifact(id, &item.id, &output).await?;
                        input.artifact = Some(output);
                    }
                    tracing::debug!(session = %id, item = %item.id, %step, "step passed");
                    self.emit(
                        PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemStepPassed)
                            .with_item(&item.id)
                            .with_detail(step.as_str()),
                    )
                    .await;
                }
            }
        }
        Ok(RunOutcome::Done)
    }

    async fn store_item_artifact(&self, id: SessionId, item_id: &str, output: &Value) -> Result<(), EngineError> {
        self.commit(id, |session| {
            if !in_generation(session) {
                return Ok(Step::Skip(()));
            }
            let Some(item) = session.work_item_mut(item_id) else {
                return Ok(Step::Skip(()));
            };
            let version = item.artifact.as_ref().map(|a| a.version + 1).unwrap_or(1);
            item.artifact = Some(Artifact::new(output.clone(), version));
            Ok(Step::Save(()))
        })
        .await?;
        Ok(())
    }

    async fn complete_item(&self, id: SessionId, item_id: &str) -> Result<(), EngineError> {
        let controller = RevisionController::new(self.settings.max_item_revisions);
        let key = item_key(item_id);
        let (_, done) = self
            .commit(id, |session| {
                if !in_generation(session)
                    || !session
                        .work_item(item_id)
                        .is_some_and(|i| i.status == WorkItemStatus::InProgress)
                {
                    return Ok(Step::Skip(false));
                }
                controller.reset(session, &key);
                session.revision_feedback.remove(&key.as_key());
                if let Some(item) = session.work_item_mut(item_id) {
                    item.status = WorkItemStatus::Done;
                    item.last_failure = None;
                }
                Ok(Step::Save(true))
            })
            .await?;
        if done {
            tracing::info!(session = %id, item = item_id, "work item done");
            self.emit(PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemDone).with_item(item_id))
                .await;
        }
        Ok(())
    }

    async fn record_step_failure(
        &self,
        id: SessionId,
        item_id: &str,
        step: SubtaskStep,
        detail: String,
    ) -> Result<(), EngineError> {
        let (_, recorded) = self
            .commit(id, |session| {
                if !in_generation(session) {
                    return Ok(Step::Skip(false));
                }
                let Some(item) = session
                    .work_item_mut(item_id)
                    .filter(|i| i.status == WorkItemStatus::InProgress)
                else {
                    return Ok(Step::Skip(false));
                };
                item.status = step_status(step);
                item.last_failure = Some(format!("{}: {}", step, detail));
                Ok(Step::Save(true))
            })
            .await?;
        if recorded {
            tracing::info!(session = %id, item = item_id, %step, %detail, "work item step failed");
            self.emit(
                PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemStepFailed)
                    .with_item(item_id)
                    .with_detail(format!("{}: {}", step, detail)),
            )
            .await;
        }
        Ok(())
    }

    /// A worker error is not a quality problem; the item fails without revision.
    async fn fail_item(
        &self,
        id: SessionId,
        item_id: &str,
        step: SubtaskStep,
        detail: String,
    ) -> Result<(), EngineError> {
        let reason = FailureReason::WorkerError {
            detail: format!("{}: {}", step, detail),
        };
        let (_, failed) = self
            .commit(id, |session| {
                if !in_generation(session) {
                    return Ok(Step::Skip(false));
                }
                let Some(item) = session
                    .work_item_mut(item_id)
                    .filter(|i| !i.status.is_terminal())
                else {
                    return Ok(Step::Skip(false));
                };
                item.status = WorkItemStatus::Failed;
                item.failure = Some(reason.clone());
                Ok(Step::Save(true))
            })
            .await?;
        if failed {
            tracing::warn!(session = %id, item = item_id, %reason, "work item failed");
            self.emit(
                PipelineEvent::new(id, Stage::Generation, EventKind::WorkItemFailed)
                    .with_item(item_id)
                    .with_detail(reason.to_string()),
            )
            .await;
        }
        Ok(())
    }

    /// Fail pending items that can never run.
    async fn fail_deadlocked(&self, id: SessionId, pending: &[String]) -> Result<(), EngineError> {
        let (session, changed) = self
            .commit(id, |session| {
                if !in_generation(session) {
                    return Ok(Step::Skip(false));
                }
                let mut changed = false;
                for item_id in pending {
                    let blocked = match session.work_item(item_id) {
                        Some(item) if item.status == WorkItemStatus::Pending => {
                            backlog::blocked_on(&session.work_item_backlog, item)
                        }
                        _ => continue,
                    };
                    if let Some(item) = session.work_item_mut(item_id) {
                        item.status = WorkItemStatus::Failed;
                        item.failure = Some(FailureReason::PipelineDeadlock { blocked_on: blocked });
                        changed = true;
                    }
                }
                Ok(if changed { Step::Save(true) } else { Step::Skip(false) })
            })
            .await?;
        if !changed {
            return Ok(());
        }

        tracing::warn!(session = %id, items = ?pending, "work items deadlocked");
        for item_id in pending {
            let detail = session
                .work_item(item_id)
                .and_then(|i| i.failure.as_ref())
                .map(ToString::to_string)
                .unwrap_or_else(|| "pipeline-deadlock".to_string());
            self.emit(
                PipelineEvent::new(id, Stage::Generation, EventKind::PipelineDeadlock)
                    .with_item(item_id)
                    .with_detail(detail),
            )
            .await;
        }
        Ok(())
    }

    /// Close the session once every item is Done or Failed.
    async fn finish_generation(&self, id: SessionId) -> Result<(), EngineError> {
        let (_, completion) = self
            .commit(id, |session| {
                if !in_generation(session) {
                    return Ok(Step::Skip(None));
                }
                let deadlocked: Vec<String> = session
                    .work_item_backlog
                    .iter()
                    .filter(|i| matches!(i.failure, Some(FailureReason::PipelineDeadlock { .. })))
                    .map(|i| i.id.clone())
                    .collect();
                let failed: Vec<String> = session
                    .work_item_backlog
                    .iter()
                    .filter(|i| i.status == WorkItemStatus::Failed)
                    .map(|i| i.id.clone())
                    .collect();

                let completion = if !deadlocked.is_empty() {
                    Completion::Failed(FailureReason::PipelineDeadlock {
                        blocked_on: deadlocked,
                    })
                } else if !failed.is_empty() {
                    Completion::Failed(FailureReason::WorkItemsFailed { items: failed })
                } else {
                    Completion::Finalized
                };
                match &completion {
                    Completion::Finalized => session.current_stage = Stage::Finalized,
                    Completion::Failed(reason) => session.fail(reason.clone()),
                }
                Ok(Step::Save(Some(completion)))
            })
            .await?;

        match completion {
            Some(Completion::Finalized) => {
                tracing::info!(session = %id, "session finalized");
                self.emit(PipelineEvent::new(id, Stage::Finalized, EventKind::SessionFinalized))
                    .await;
            }
            Some(Completion::Failed(reason)) => {
                tracing::warn!(session = %id, %reason, "session failed");
                self.emit(
                    PipelineEvent::new(id, Stage::Failed, EventKind::SessionFailed)
                        .with_detail(reason.to_string()),
                )
                .await;
            }
            None => {}
        }
        Ok(())
    }
}
