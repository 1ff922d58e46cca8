//! Idle session sweeping.
//!
//! Gates never expire on their own. When an idle timeout is configured,
//! the janitor fails sessions whose `last_activity` is older than the
//! timeout, writing through the same versioned save as every other
//! transition. A version conflict means the session just moved, so it is
//! left alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use stagegate_common::{EventKind, FailureReason, PipelineEvent, SessionId, Stage};

use crate::errors::{EngineError, StoreError};
use crate::events::EventHub;
use crate::store::SharedStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Non-terminal sessions looked at
    pub examined: usize,
    pub timed_out: Vec<SessionId>,
    /// Sessions that changed while being swept
    pub skipped: usize,
}

pub async fn sweep(
    store: &SharedStore,
    events: &EventHub,
    idle_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<SweepReport, EngineError> {
    let idle_limit = chrono::Duration::from_std(idle_timeout)
        .map_err(|e| anyhow::anyhow!("Idle timeout out of range: {}", e))?;
    let mut report = SweepReport::default();

    for summary in store.list().await? {
        if summary.state.is_terminal() {
            continue;
        }
        report.examined += 1;
        if now - summary.last_activity <= idle_limit {
            continue;
        }

        let mut session = match store.load(summary.session_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        };
        if session.is_terminal() || now - session.last_activity <= idle_limit {
            report.skipped += 1;
            continue;
        }

        let expected = session.version;
        let reason = FailureReason::Timeout {
            idle_secs: idle_timeout.as_secs(),
        };
        session.fail(reason.clone());
        session.touch(now);
        match store.save(session, expected).await {
            Ok(saved) => {
                tracing::info!(session = %saved.session_id, %reason, "idle session timed out");
                events
                    .emit(
                        PipelineEvent::new(saved.session_id, Stage::Failed, EventKind::SessionFailed)
                            .with_detail(reason.to_string()),
                    )
                    .await;
                report.timed_out.push(saved.session_id);
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(session = %summary.session_id, "session changed during sweep, skipping");
                report.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(report)
}

/// Sweep every `interval` until the task is dropped.
pub async fn run_periodic(store: SharedStore, events: EventHub, idle_timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        match sweep(&store, &events, idle_timeout, Utc::now()).await {
            Ok(report) if !report.timed_out.is_empty() => {
                tracing::info!(count = report.timed_out.len(), "janitor failed idle sessions");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "janitor sweep failed"),
        }
    }
}
