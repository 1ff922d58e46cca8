use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level pipeline stage of a session.
///
/// The first four stages are human-gated: each produces one artifact that
/// must be approved before the session moves on. `Generation` runs the
/// automatic work item loop. The last three are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Requirements,
    TechStack,
    Design,
    Plan,
    Generation,
    Finalized,
    Terminated,
    Failed,
}

impl Stage {
    /// Gated stages in pipeline order.
    pub const GATED: [Stage; 4] = [
        Stage::Requirements,
        Stage::TechStack,
        Stage::Design,
        Stage::Plan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::TechStack => "tech_stack",
            Self::Design => "design",
            Self::Plan => "plan",
            Self::Generation => "generation",
            Self::Finalized => "finalized",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Whether this stage suspends on an approval gate.
    pub fn is_gated(&self) -> bool {
        Self::GATED.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Terminated | Self::Failed)
    }

    /// The stage that follows on approval (or on loop completion for
    /// `Generation`). Terminal stages have no successor.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Requirements => Some(Self::TechStack),
            Self::TechStack => Some(Self::Design),
            Self::Design => Some(Self::Plan),
            Self::Plan => Some(Self::Generation),
            Self::Generation => Some(Self::Finalized),
            Self::Finalized | Self::Terminated | Self::Failed => None,
        }
    }

    /// Gated stages that run before this one.
    pub fn predecessors(&self) -> &'static [Stage] {
        match self {
            Self::Requirements => &[],
            Self::TechStack => &Self::GATED[..1],
            Self::Design => &Self::GATED[..2],
            Self::Plan => &Self::GATED[..3],
            _ => &Self::GATED,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "requirements" => Ok(Self::Requirements),
            "tech_stack" | "techstack" => Ok(Self::TechStack),
            "design" => Ok(Self::Design),
            "plan" => Ok(Self::Plan),
            "generation" => Ok(Self::Generation),
            "finalized" => Ok(Self::Finalized),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gated_stages_advance_in_order() {
        assert_eq!(Stage::Requirements.next(), Some(Stage::TechStack));
        assert_eq!(Stage::TechStack.next(), Some(Stage::Design));
        assert_eq!(Stage::Design.next(), Some(Stage::Plan));
        assert_eq!(Stage::Plan.next(), Some(Stage::Generation));
        assert_eq!(Stage::Generation.next(), Some(Stage::Finalized));
        assert_eq!(Stage::Terminated.next(), None);
    }

    #[test]
    fn only_first_four_stages_are_gated() {
        let gated: Vec<_> = [
            Stage::Requirements,
            Stage::TechStack,
            Stage::Design,
            Stage::Plan,
            Stage::Generation,
            Stage::Finalized,
            Stage::Terminated,
            Stage::Failed,
        ]
        .into_iter()
        .filter(Stage::is_gated)
        .collect();
        assert_eq!(gated, Stage::GATED.to_vec());
    }

    #[test]
    fn predecessors_of_plan() {
        assert_eq!(
            Stage::Plan.predecessors(),
            &[Stage::Requirements, Stage::TechStack, Stage::Design]
        );
        assert!(Stage::Requirements.predecessors().is_empty());
    }

    #[test]
    fn parse_accepts_dashes_and_case() {
        assert_eq!("Tech-Stack".parse::<Stage>().unwrap(), Stage::TechStack);
        assert_eq!("plan".parse::<Stage>().unwrap(), Stage::Plan);
        assert!("review".parse::<Stage>().is_err());
    }

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&Stage::TechStack).unwrap(),
            "\"tech_stack\""
        );
    }
}
