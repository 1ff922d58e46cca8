use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// A well-formed decision on an open approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Revise { feedback: String },
    Abort,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Revise { .. } => "revise",
            Self::Abort => "abort",
        }
    }

    pub fn feedback(&self) -> Option<&str> {
        match self {
            Self::Revise { feedback } => Some(feedback),
            _ => None,
        }
    }
}

/// A decision as submitted by an external actor, before validation.
///
/// External actors speak loosely typed payloads; parsing into a [`Decision`]
/// never panics and reports why a payload was unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl DecisionRequest {
    pub fn new(decision: impl Into<String>, feedback: Option<String>) -> Self {
        Self {
            decision: decision.into(),
            feedback,
        }
    }

    pub fn approve() -> Self {
        Self::new("approve", None)
    }

    pub fn revise(feedback: impl Into<String>) -> Self {
        Self::new("revise", Some(feedback.into()))
    }

    pub fn abort() -> Self {
        Self::new("abort", None)
    }

    /// Validate the request into a [`Decision`].
    pub fn parse(&self) -> Result<Decision, String> {
        match self.decision.trim().to_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "revise" | "revision" => {
                let feedback = self
                    .feedback
                    .as_deref()
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| "revise requires non-empty feedback".to_string())?;
                Ok(Decision::Revise {
                    feedback: feedback.to_string(),
                })
            }
            "abort" => Ok(Decision::Abort),
            "" => Err("empty decision; expected approve, revise or abort".to_string()),
            other => Err(format!(
                "unknown decision '{}'; expected approve, revise or abort",
                other
            )),
        }
    }
}

impl From<Decision> for DecisionRequest {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approve => Self::approve(),
            Decision::Revise { feedback } => Self::revise(feedback),
            Decision::Abort => Self::abort(),
        }
    }
}

/// Outcome of routing a decision at a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Approved: move on to the given stage.
    Advance(Stage),
    /// Revision requested: re-run the same stage with feedback.
    Retry(Stage),
    /// Aborted by the decision maker.
    Terminate,
    /// Unusable decision; the gate stays open.
    Reject(String),
}

impl Transition {
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}
