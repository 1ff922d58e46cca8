//! In-process workers driven by a script of canned responses.
//!
//! Unscripted calls fall back to a deterministic default: stage workers
//! answer with a small JSON object (an empty backlog for `plan`), subtasks
//! pass. Every call is recorded for inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use stagegate_common::Stage;

use super::{StageInput, StageWorker, SubtaskInput, SubtaskOutcome, SubtaskStep, WorkItemSubtasks};
use crate::errors::WorkerError;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct ScriptedStageWorker {
    responses: Mutex<HashMap<Stage, VecDeque<Result<Value, WorkerError>>>>,
    calls: Mutex<Vec<StageInput>>,
}

impl ScriptedStageWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next unanswered call of `stage`.
    pub fn respond(self, stage: Stage, response: Result<Value, WorkerError>) -> Self {
        locked(&self.responses)
            .entry(stage)
            .or_default()
            .push_back(response);
        self
    }

    pub fn with_output(self, stage: Stage, output: Value) -> Self {
        self.respond(stage, Ok(output))
    }

    pub fn calls(&self) -> Vec<StageInput> {
        locked(&self.calls).clone()
    }

    pub fn calls_for(&self, stage: Stage) -> Vec<StageInput> {
        locked(&self.calls)
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    fn default_output(stage: Stage, input: &StageInput) -> Value {
        match stage {
            Stage::Plan => json!({"work_items": []}),
            _ => json!({
                "stage": stage.as_str(),
                "attempt": input.attempt,
                "feedback": input.feedback,
            }),
        }
    }
}

#[async_trait]
impl StageWorker for ScriptedStageWorker {
    async fn run(&self, stage: Stage, input: &StageInput) -> Result<Value, WorkerError> {
        locked(&self.calls).push(input.clone());
        let scripted = locked(&self.responses)
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(Self::default_output(stage, input)))
    }
}

/// A recorded subtask call.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskCall {
    pub item_id: String,
    pub step: SubtaskStep,
    pub feedback: Option<String>,
}

type StepKey = (String, SubtaskStep);

#[derive(Default)]
pub struct ScriptedSubtasks {
    script: Mutex<HashMap<StepKey, VecDeque<Result<SubtaskOutcome, WorkerError>>>>,
    always_fail: Mutex<HashMap<StepKey, String>>,
    delays: Mutex<HashMap<StepKey, Duration>>,
    calls: Mutex<Vec<SubtaskCall>>,
}

impl ScriptedSubtasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next call of `step` on `item_id`.
    pub fn respond(
        self,
        item_id: impl Into<String>,
        step: SubtaskStep,
        outcome: Result<SubtaskOutcome, WorkerError>,
    ) -> Self {
        locked(&self.script)
            .entry((item_id.into(), step))
            .or_default()
            .push_back(outcome);
        self
    }

    /// Make every unscripted call of `step` on `item_id` fail with `detail`.
    pub fn fail_always(self, item_id: impl Into<String>, step: SubtaskStep, detail: impl Into<String>) -> Self {
        locked(&self.always_fail).insert((item_id.into(), step), detail.into());
        self
    }

    /// Hold every call of `step` on `item_id` for `delay` before answering.
    /// The call is recorded when it starts.
    pub fn delay(self, item_id: impl Into<String>, step: SubtaskStep, delay: Duration) -> Self {
        locked(&self.delays).insert((item_id.into(), step), delay);
        self
    }

    pub fn calls(&self) -> Vec<SubtaskCall> {
        locked(&self.calls).clone()
    }

    pub fn calls_for(&self, item_id: &str) -> Vec<SubtaskCall> {
        locked(&self.calls)
            .iter()
            .filter(|c| c.item_id == item_id)
            .cloned()
            .collect()
    }

    async fn answer(&self, step: SubtaskStep, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        let id = input.item.id.clone();
        locked(&self.calls).push(SubtaskCall {
            item_id: id.clone(),
            step,
            feedback: input.feedback.clone(),
        });
        let key = (id, step);
        let delay = locked(&self.delays).get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(outcome) = locked(&self.script)
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        if let Some(detail) = locked(&self.always_fail).get(&key) {
            return Ok(SubtaskOutcome::fail(detail.clone()));
        }
        Ok(match step {
            SubtaskStep::Generate => SubtaskOutcome::pass_with(json!({
                "item": input.item.id,
                "feedback": input.feedback,
            })),
            _ => SubtaskOutcome::pass(),
        })
    }
}

#[async_trait]
impl WorkItemSubtasks for ScriptedSubtasks {
    async fn generate(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.answer(SubtaskStep::Generate, input).await
    }

    async fn check_quality(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.answer(SubtaskStep::QualityCheck, input).await
    }

    async fn test(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.answer(SubtaskStep::Test, input).await
    }

    async fn integrate(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError> {
        self.answer(SubtaskStep::Integrate, input).await
    }
}
