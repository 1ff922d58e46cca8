//! Backlog construction and scheduling.
//!
//! Both functions here are pure: [`decompose`] turns an approved plan into
//! work items, [`next_action`] picks what the loop does next.

use std::collections::HashSet;

use serde_json::Value;
use stagegate_common::{WorkItem, WorkItemStatus};

/// Build the backlog from a plan artifact of the form
/// `{"work_items": [{"id", "role", "depends_on"?, "description"?}]}`.
///
/// Ids must be unique and every dependency must name another item.
/// Cycles are accepted here; the loop reports them as a deadlock.
pub fn decompose(plan: &Value) -> Result<Vec<WorkItem>, String> {
    let entries = plan
        .get("work_items")
        .and_then(Value::as_array)
        .ok_or_else(|| "plan output has no work_items array".to_string())?;

    let mut items = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();
    for (i, entry) in entries.iter().enumerate() {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("work_items[{}] has no id", i))?;
        if !seen.insert(id.to_string()) {
            return Err(format!("duplicate work item id '{}'", id));
        }
        let role = entry
            .get("role")
            .or_else(|| entry.get("role_tag"))
            .and_then(Value::as_str)
            .ok_or_else(|| format!("work item '{}' has no role", id))?;
        let dependencies = match entry.get("depends_on").or_else(|| entry.get("dependencies")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(deps)) => deps
                .iter()
                .map(|d| {
                    d.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| format!("work item '{}' has a non-string dependency", id))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(format!("work item '{}' depends_on must be an array", id)),
        };
        let description = entry
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        items.push(WorkItem::new(id, role, dependencies).with_description(description));
    }

    for item in &items {
        for dep in &item.dependencies {
            if dep == &item.id {
                return Err(format!("work item '{}' depends on itself", item.id));
            }
            if !seen.contains(dep) {
                return Err(format!(
                    "work item '{}' depends on unknown item '{}'",
                    item.id, dep
                ));
            }
        }
    }
    Ok(items)
}

/// What the work item loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// A step failed on this item; account for the revision.
    Revise(usize),
    /// Run (or resume) the generate/verify sequence for this item.
    Run(usize),
    /// Items remain pending but none can ever run.
    Deadlock(Vec<usize>),
    /// Every item is Done or Failed.
    Complete,
}

fn dependencies_done(backlog: &[WorkItem], item: &WorkItem) -> bool {
    item.dependencies.iter().all(|dep| {
        backlog
            .iter()
            .any(|other| &other.id == dep && other.status == WorkItemStatus::Done)
    })
}

/// Dependencies of `item` that are not Done.
pub fn blocked_on(backlog: &[WorkItem], item: &WorkItem) -> Vec<String> {
    item.dependencies
        .iter()
        .filter(|dep| {
            !backlog
                .iter()
                .any(|other| &other.id == *dep && other.status == WorkItemStatus::Done)
        })
        .cloned()
        .collect()
}

/// Pick the next action: pending revisions first, then an interrupted
/// run, then the first pending item whose dependencies are all Done.
pub fn next_action(backlog: &[WorkItem]) -> NextAction {
    if let Some(idx) = backlog.iter().position(|i| i.status.is_step_failure()) {
        return NextAction::Revise(idx);
    }
    if let Some(idx) = backlog
        .iter()
        .position(|i| i.status == WorkItemStatus::InProgress)
    {
        return NextAction::Run(idx);
    }
    if let Some(idx) = backlog
        .iter()
        .position(|i| i.status == WorkItemStatus::Pending && dependencies_done(backlog, i))
    {
        return NextAction::Run(idx);
    }
    let pending: Vec<usize> = backlog
        .iter()
        .enumerate()
        .filter(|(_, i)| i.status == WorkItemStatus::Pending)
        .map(|(idx, _)| idx)
        .collect();
    if pending.is_empty() {
        NextAction::Complete
    } else {
        NextAction::Deadlock(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, deps: &[&str], status: WorkItemStatus) -> WorkItem {
        let mut item = WorkItem::new(id, "coder", deps.iter().map(|d| d.to_string()).collect());
        item.status = status;
        item
    }

    #[test]
    fn decompose_reads_items_in_order() {
        let plan = json!({"work_items": [
            {"id": "a", "role": "coder", "description": "models"},
            {"id": "b", "role": "coder", "depends_on": ["a"]},
            {"id": "c", "role_tag": "tester", "dependencies": ["a", "b"]},
        ]});
        let items = decompose(&plan).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].description, "models");
        assert_eq!(items[1].dependencies, vec!["a"]);
        assert_eq!(items[2].role_tag, "tester");
        assert!(items.iter().all(|i| i.status == WorkItemStatus::Pending));
    }

    #[test]
    fn decompose_rejects_bad_plans() {
        assert!(decompose(&json!({})).unwrap_err().contains("work_items"));
        assert!(
            decompose(&json!({"work_items": [{"role": "x"}]}))
                .unwrap_err()
                .contains("no id")
        );
        assert!(
            decompose(&json!({"work_items": [{"id": "a", "role": "x"}, {"id": "a", "role": "x"}]}))
                .unwrap_err()
                .contains("duplicate")
        );
        assert!(
            decompose(&json!({"work_items": [{"id": "a", "role": "x", "depends_on": ["b"]}]}))
                .unwrap_err()
                .contains("unknown item 'b'")
        );
        assert!(
            decompose(&json!({"work_items": [{"id": "a", "role": "x", "depends_on": ["a"]}]}))
                .unwrap_err()
                .contains("itself")
        );
        assert!(
            decompose(&json!({"work_items": [{"id": "a"}]}))
                .unwrap_err()
                .contains("no role")
        );
    }

    #[test]
    fn decompose_accepts_cycles() {
        let plan = json!({"work_items": [
            {"id": "a", "role": "x", "depends_on": ["b"]},
            {"id": "b", "role": "x", "depends_on": ["a"]},
        ]});
        let items = decompose(&plan).unwrap();
        assert_eq!(next_action(&items), NextAction::Deadlock(vec![0, 1]));
    }

    #[test]
    fn runs_first_ready_item() {
        let backlog = vec![
            item("a", &[], WorkItemStatus::Done),
            item("b", &["c"], WorkItemStatus::Pending),
            item("c", &["a"], WorkItemStatus::Pending),
        ];
        assert_eq!(next_action(&backlog), NextAction::Run(2));
    }

    #[test]
    fn revisions_take_priority() {
        let backlog = vec![
            item("a", &[], WorkItemStatus::Pending),
            item("b", &[], WorkItemStatus::InProgress),
            item("c", &[], WorkItemStatus::TestFailed),
        ];
        assert_eq!(next_action(&backlog), NextAction::Revise(2));
    }

    #[test]
    fn interrupted_run_resumes_before_new_work() {
        let backlog = vec![
            item("a", &[], WorkItemStatus::Pending),
            item("b", &[], WorkItemStatus::InProgress),
        ];
        assert_eq!(next_action(&backlog), NextAction::Run(1));
    }

    #[test]
    fn failed_dependency_deadlocks_dependents_only() {
        let backlog = vec![
            item("a", &[], WorkItemStatus::Failed),
            item("b", &["a"], WorkItemStatus::Pending),
            item("c", &[], WorkItemStatus::Pending),
        ];
        // c is independent and still runs first.
        assert_eq!(next_action(&backlog), NextAction::Run(2));

        let backlog = vec![
            item("a", &[], WorkItemStatus::Failed),
            item("b", &["a"], WorkItemStatus::Pending),
            item("c", &[], WorkItemStatus::Done),
        ];
        assert_eq!(next_action(&backlog), NextAction::Deadlock(vec![1]));
        assert_eq!(blocked_on(&backlog, &backlog[1]), vec!["a"]);
    }

    #[test]
    fn complete_when_all_terminal() {
        let backlog = vec![
            item("a", &[], WorkItemStatus::Done),
            item("b", &[], WorkItemStatus::Failed),
        ];
        assert_eq!(next_action(&backlog), NextAction::Complete);
        assert_eq!(next_action(&[]), NextAction::Complete);
    }
}
