//! Pluggable producers of stage content and work item results.
//!
//! | Trait | Called for | Implementations |
//! |-------|------------|-----------------|
//! | [`StageWorker`] | each run of a gated stage | [`CommandWorker`], [`ScriptedStageWorker`] |
//! | [`WorkItemSubtasks`] | generate, quality check, test, integrate | [`CommandWorker`], [`ScriptedSubtasks`] |
//! | [`Governor`] | admission of every call above | [`Unbounded`], [`ConcurrencyGovernor`] |

pub mod command;
pub mod governor;
pub mod scripted;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagegate_common::{RevisionKey, Session, SessionId, Stage, WorkItem};

use crate::config::StagegateToml;
use crate::errors::WorkerError;
use crate::work::backlog;

pub use command::CommandWorker;
pub use governor::{
    Admission, AdmissionPermit, CallLabel, ConcurrencyGovernor, Governor, Invocation, RetryPolicy,
    Unbounded, invoke,
};
pub use scripted::{ScriptedStageWorker, ScriptedSubtasks, SubtaskCall};

/// Everything a stage worker sees for one run of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub session_id: SessionId,
    pub stage: Stage,
    pub input_document: String,
    /// Approved outputs of the stages before this one
    pub prior_outputs: BTreeMap<Stage, Value>,
    /// The draft being revised, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_draft: Option<Value>,
    /// Revision feedback merged in from the last decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Revisions used so far for this stage
    pub attempt: u32,
}

impl StageInput {
    pub fn from_session(session: &Session, stage: Stage) -> Self {
        let prior_outputs = stage
            .predecessors()
            .iter()
            .filter_map(|s| session.stage_outputs.get(s).map(|a| (*s, a.content.clone())))
            .collect();
        let key = RevisionKey::Stage(stage);
        let feedback = session.feedback_for(&key).map(str::to_string);
        let previous_draft = feedback
            .as_ref()
            .and_then(|_| session.stage_outputs.get(&stage))
            .map(|a| a.content.clone());
        Self {
            session_id: session.session_id,
            stage,
            input_document: session.input_document.clone(),
            prior_outputs,
            previous_draft,
            feedback,
            attempt: session.revision_count(&key),
        }
    }
}

#[async_trait]
pub trait StageWorker: Send + Sync {
    async fn run(&self, stage: Stage, input: &StageInput) -> Result<Value, WorkerError>;
}

/// One verification step of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStep {
    Generate,
    QualityCheck,
    Test,
    Integrate,
}

impl SubtaskStep {
    /// Verification steps run after generation, in order.
    pub const CHECKS: [SubtaskStep; 3] = [Self::QualityCheck, Self::Test, Self::Integrate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::QualityCheck => "quality_check",
            Self::Test => "test",
            Self::Integrate => "integrate",
        }
    }
}

impl std::fmt::Display for SubtaskStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input of every subtask call for a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskInput {
    pub session_id: SessionId,
    pub item: WorkItem,
    /// Failure detail from the previous attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Output under verification; for `generate`, the previous attempt's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Value>,
    /// Approved stage outputs
    #[serde(default)]
    pub context: BTreeMap<Stage, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubtaskOutcome {
    Pass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    Fail {
        detail: String,
    },
}

impl SubtaskOutcome {
    pub fn pass() -> Self {
        Self::Pass { output: None }
    }

    pub fn pass_with(output: Value) -> Self {
        Self::Pass {
            output: Some(output),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self::Fail {
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait WorkItemSubtasks: Send + Sync {
    async fn generate(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError>;
    async fn check_quality(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError>;
    async fn test(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError>;
    async fn integrate(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, WorkerError>;

    async fn run_step(
        &self,
        step: SubtaskStep,
        input: &SubtaskInput,
    ) -> Result<SubtaskOutcome, WorkerError> {
        match step {
            SubtaskStep::Generate => self.generate(input).await,
            SubtaskStep::QualityCheck => self.check_quality(input).await,
            SubtaskStep::Test => self.test(input).await,
            SubtaskStep::Integrate => self.integrate(input).await,
        }
    }
}

/// Subtask implementations selected by work item role tag.
#[derive(Clone)]
pub struct SubtaskRegistry {
    default: Arc<dyn WorkItemSubtasks>,
    roles: HashMap<String, Arc<dyn WorkItemSubtasks>>,
}

impl SubtaskRegistry {
    pub fn new(default: Arc<dyn WorkItemSubtasks>) -> Self {
        Self {
            default,
            roles: HashMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>, subtasks: Arc<dyn WorkItemSubtasks>) -> Self {
        self.roles.insert(role.into(), subtasks);
        self
    }

    pub fn for_role(&self, role: &str) -> Arc<dyn WorkItemSubtasks> {
        self.roles
            .get(role)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// The worker collaborators an engine calls out to.
#[derive(Clone)]
pub struct Workers {
    pub stage: Arc<dyn StageWorker>,
    pub subtasks: SubtaskRegistry,
    pub governor: Arc<dyn Governor>,
}

impl Workers {
    pub fn new(stage: Arc<dyn StageWorker>, subtasks: SubtaskRegistry) -> Self {
        Self {
            stage,
            subtasks,
            governor: Arc::new(Unbounded),
        }
    }

    pub fn with_governor(mut self, governor: Arc<dyn Governor>) -> Self {
        self.governor = governor;
        self
    }

    /// Build process-backed workers from `[workers]`.
    ///
    /// Commands run in `working_dir` (the project directory by default)
    /// under the configured timeout; `max_in_flight` installs a
    /// [`ConcurrencyGovernor`].
    pub fn from_config(toml: &StagegateToml, project_dir: &Path) -> Result<Self> {
        let workers = &toml.workers;
        if workers.stage_command.is_empty() {
            bail!("No stage worker configured: set [workers] stage_command in stagegate.toml");
        }
        let dir = match workers.working_dir {
            Some(ref dir) if dir.is_absolute() => dir.clone(),
            Some(ref dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        };
        let command = |argv: &Vec<String>| -> Result<CommandWorker> {
            let worker = CommandWorker::new(argv.clone())?.with_working_dir(dir.clone());
            Ok(match workers.timeout() {
                Some(limit) => worker.with_timeout(limit),
                None => worker,
            })
        };

        let stage = Arc::new(command(&workers.stage_command)?);
        let default: Arc<dyn WorkItemSubtasks> = if workers.subtask_command.is_empty() {
            stage.clone()
        } else {
            Arc::new(command(&workers.subtask_command)?)
        };
        let mut registry = SubtaskRegistry::new(default);
        for (role, argv) in &workers.roles {
            registry = registry.with_role(role.clone(), Arc::new(command(argv)?));
        }

        let built = Self::new(stage, registry);
        Ok(match workers.max_in_flight {
            0 => built,
            limit => built.with_governor(Arc::new(ConcurrencyGovernor::new(limit))),
        })
    }
}

/// Check a stage worker's output before it is shown at a gate.
pub fn validate_stage_output(stage: Stage, output: &Value) -> Result<(), String> {
    if !output.is_object() {
        return Err(format!(
            "{} output must be a JSON object, got {}",
            stage,
            json_kind(output)
        ));
    }
    if stage == Stage::Plan {
        backlog::decompose(output)?;
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
