//! Bounded revision accounting shared by gated stages and work items.

use stagegate_common::{RevisionKey, Session};

/// Outcome of requesting one more revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// The revision may run; `attempt` is the new count.
    Continue { attempt: u32 },
    /// The limit is spent. The counter is left at the limit.
    Exhausted { attempts: u32 },
}

impl AttemptResult {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Counts revisions per key in `Session::revision_counts` and refuses to
/// go past `max_revisions`, so a count never exceeds the limit.
#[derive(Debug, Clone, Copy)]
pub struct RevisionController {
    max_revisions: u32,
}

impl RevisionController {
    pub fn new(max_revisions: u32) -> Self {
        Self { max_revisions }
    }

    pub fn max_revisions(&self) -> u32 {
        self.max_revisions
    }

    pub fn attempt(&self, session: &mut Session, key: &RevisionKey) -> AttemptResult {
        let current = session.revision_count(key);
        let next = current + 1;
        if next > self.max_revisions {
            return AttemptResult::Exhausted { attempts: current };
        }
        session.revision_counts.insert(key.as_key(), next);
        if let RevisionKey::WorkItem(id) = key
            && let Some(item) = session.work_item_mut(id)
        {
            item.revision_count = next;
        }
        AttemptResult::Continue { attempt: next }
    }

    /// Clear the counter after the guarded operation succeeded.
    pub fn reset(&self, session: &mut Session, key: &RevisionKey) {
        session.revision_counts.remove(&key.as_key());
        if let RevisionKey::WorkItem(id) = key
            && let Some(item) = session.work_item_mut(id)
        {
            item.revision_count = 0;
        }
    }
}
