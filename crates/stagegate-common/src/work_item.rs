use serde::{Deserialize, Serialize};

use crate::session::{Artifact, FailureReason};

/// Status of a work item in the generation backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    InProgress,
    QualityFailed,
    TestFailed,
    IntegrationFailed,
    Done,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::QualityFailed => "quality_failed",
            Self::TestFailed => "test_failed",
            Self::IntegrationFailed => "integration_failed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// A verification step failed and the item awaits a revision decision.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::QualityFailed | Self::TestFailed | Self::IntegrationFailed
        )
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of generation work decomposed from the approved plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub role_tag: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: WorkItemStatus,
    #[serde(default)]
    pub revision_count: u32,
    /// Output of the last successful generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Detail of the last failed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, role_tag: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            role_tag: role_tag.into(),
            description: String::new(),
            dependencies,
            status: WorkItemStatus::Pending,
            revision_count: 0,
            artifact: None,
            last_failure: None,
            failure: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Aggregate counts over a backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    /// Items whose last step failed and that await revision.
    pub revising: usize,
    pub done: usize,
    pub failed: usize,
}

impl BacklogSummary {
    pub fn from_items(items: &[WorkItem]) -> Self {
        let mut summary = Self {
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.status {
                WorkItemStatus::Pending => summary.pending += 1,
                WorkItemStatus::InProgress => summary.in_progress += 1,
                WorkItemStatus::Done => summary.done += 1,
                WorkItemStatus::Failed => summary.failed += 1,
                _ => summary.revising += 1,
            }
        }
        summary
    }

    pub fn is_complete(&self) -> bool {
        self.done + self.failed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_each_status() {
        let mut items = vec![
            WorkItem::new("a", "coder", vec![]),
            WorkItem::new("b", "coder", vec![]),
            WorkItem::new("c", "tester", vec![]),
            WorkItem::new("d", "coder", vec![]),
        ];
        items[0].status = WorkItemStatus::Done;
        items[1].status = WorkItemStatus::TestFailed;
        items[2].status = WorkItemStatus::Failed;

        let summary = BacklogSummary::from_items(&items);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.revising, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert!(!summary.is_complete());
    }

    #[test]
    fn empty_backlog_is_complete() {
        assert!(BacklogSummary::from_items(&[]).is_complete());
    }

    #[test]
    fn step_failures_are_not_terminal() {
        for status in [
            WorkItemStatus::QualityFailed,
            WorkItemStatus::TestFailed,
            WorkItemStatus::IntegrationFailed,
        ] {
            assert!(status.is_step_failure());
            assert!(!status.is_terminal());
        }
        assert!(WorkItemStatus::Done.is_terminal());
        assert!(WorkItemStatus::Failed.is_terminal());
    }
}
