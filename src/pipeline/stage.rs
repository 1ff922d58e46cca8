//! Running one gated stage up to its approval gate.

use chrono::Utc;
use stagegate_common::{Artifact, EventKind, FailureReason, PipelineEvent, Session, SessionId, Stage};

use super::{Engine, Step};
use crate::errors::EngineError;
use crate::gate;
use crate::worker::{CallLabel, StageInput, invoke, validate_stage_output};

/// Whether a session loaded before a worker call can still take its result.
fn still_at(session: &Session, stage: Stage) -> bool {
    session.current_stage == stage && !session.is_suspended()
}

impl Engine {
    /// Invoke the stage worker for `stage` and open its gate on the output.
    pub(crate) async fn run_stage(&self, session: &Session, stage: Stage) -> Result<(), EngineError> {
        let id = session.session_id;
        let input = StageInput::from_session(session, stage);
        tracing::info!(session = %id, %stage, attempt = input.attempt, "running stage worker");
        self.emit(
            PipelineEvent::new(id, stage, EventKind::StageStarted)
                .with_detail(format!("attempt {}", input.attempt)),
        )
        .await;

        let label = CallLabel::new(id, format!("stage:{}", stage));
        let worker = self.workers.stage.clone();
        let invocation = invoke(
            self.workers.governor.as_ref(),
            &self.settings.retry_policy,
            &label,
            || worker.run(stage, &input),
        )
        .await;
        if invocation.retries > 0 {
            self.emit(
                PipelineEvent::new(id, stage, EventKind::WorkerRetry)
                    .with_detail(format!("{} retries", invocation.retries)),
            )
            .await;
        }

        let output = match invocation.result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(session = %id, %stage, error = %e, "stage worker failed");
                return self
                    .fail_stage(id, stage, FailureReason::WorkerError { detail: e.to_string() })
                    .await;
            }
        };
        if let Err(detail) = validate_stage_output(stage, &output) {
            tracing::warn!(session = %id, %stage, %detail, "stage worker returned invalid output");
            return self
                .fail_stage(id, stage, FailureReason::InvalidOutput { detail })
                .await;
        }

        let (_, token) = self
            .commit(id, |session| {
                if !still_at(session, stage) {
                    return Ok(Step::Skip(None));
                }
                let version = session
                    .stage_outputs
                    .get(&stage)
                    .map(|a| a.version + 1)
                    .unwrap_or(1);
                let payload = Artifact::new(output.clone(), version);
                session.stage_outputs.insert(stage, payload.clone());
                Ok(Step::Save(Some(gate::open(session, stage, payload, Utc::now()))))
            })
            .await?;

        match token {
            Some(token) => {
                tracing::info!(session = %id, %stage, "awaiting decision");
                self.emit(
                    PipelineEvent::new(id, stage, EventKind::GateOpened).with_detail(token.to_string()),
                )
                .await;
            }
            None => tracing::debug!(session = %id, %stage, "stage moved on during worker call, output dropped"),
        }
        Ok(())
    }

    async fn fail_stage(
        &self,
        id: SessionId,
        stage: Stage,
        reason: FailureReason,
    ) -> Result<(), EngineError> {
        let (_, failed) = self
            .commit(id, |session| {
                if !still_at(session, stage) {
                    return Ok(Step::Skip(false));
                }
                session.fail(reason.clone());
                Ok(Step::Save(true))
            })
            .await?;
        if failed {
            self.emit(
                PipelineEvent::new(id, Stage::Failed, EventKind::SessionFailed)
                    .with_detail(reason.to_string()),
            )
            .await;
        }
        Ok(())
    }
}
