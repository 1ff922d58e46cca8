//! Applying a routed transition to a session.
//!
//! Everything here is synchronous and side-effect free apart from the
//! session it is handed; the engine wraps it in a versioned commit.

use stagegate_common::{FailureReason, RevisionKey, Session, Stage, Transition};

use super::EngineSettings;
use crate::errors::{EngineError, GateError};
use crate::revision::{AttemptResult, RevisionController};
use crate::work::backlog;

/// What applying a transition did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// `from` was approved and the session moved on to `to`.
    Advanced {
        from: Stage,
        to: Stage,
        /// Number of work items created when entering generation
        backlog: Option<usize>,
    },
    /// The stage will be re-run with feedback.
    Revising { stage: Stage, attempt: u32, max: u32 },
    Terminated,
    Failed(FailureReason),
}

impl Applied {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed(_))
    }
}

/// Carry out `transition`, decided at the gate of `stage`.
pub fn apply_transition(
    session: &mut Session,
    settings: &EngineSettings,
    stage: Stage,
    transition: &Transition,
    feedback: Option<&str>,
) -> Result<Applied, EngineError> {
    let key = RevisionKey::Stage(stage);
    match transition {
        Transition::Advance(next) => {
            let controller = RevisionController::new(settings.max_revisions_for(stage));
            session.mark_completed(stage);
            controller.reset(session, &key);
            session.revision_feedback.remove(&key.as_key());
            session.current_stage = *next;

            if *next != Stage::Generation {
                return Ok(Applied::Advanced {
                    from: stage,
                    to: *next,
                    backlog: None,
                });
            }
            let plan = session
                .stage_outputs
                .get(&Stage::Plan)
                .map(|a| a.content.clone())
                .unwrap_or_default();
            match backlog::decompose(&plan) {
                Ok(items) => {
                    let count = items.len();
                    session.work_item_backlog = items;
                    Ok(Applied::Advanced {
                        from: stage,
                        to: *next,
                        backlog: Some(count),
                    })
                }
                Err(detail) => {
                    let reason = FailureReason::InvalidOutput { detail };
                    session.fail(reason.clone());
                    Ok(Applied::Failed(reason))
                }
            }
        }
        Transition::Retry(retry_stage) => {
            let max = settings.max_revisions_for(*retry_stage);
            let controller = RevisionController::new(max);
            let key = RevisionKey::Stage(*retry_stage);
            match controller.attempt(session, &key) {
                AttemptResult::Continue { attempt } => {
                    if let Some(text) = feedback {
                        session
                            .revision_feedback
                            .insert(key.as_key(), text.to_string());
                    }
                    session.current_stage = *retry_stage;
                    Ok(Applied::Revising {
                        stage: *retry_stage,
                        attempt,
                        max,
                    })
                }
                AttemptResult::Exhausted { attempts } => {
                    let reason = FailureReason::RevisionsExhausted {
                        key: key.as_key(),
                        detail: Some(format!("{} revisions used", attempts)),
                    };
                    session.fail(reason.clone());
                    Ok(Applied::Failed(reason))
                }
            }
        }
        Transition::Terminate => {
            session.current_stage = Stage::Terminated;
            session.pending_gate = None;
            Ok(Applied::Terminated)
        }
        Transition::Reject(reason) => Err(GateError::MalformedDecision {
            reason: reason.clone(),
        }
        .into()),
    }
}
