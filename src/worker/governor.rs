//! Admission control and transient-failure retry around worker calls.
//!
//! Every stage worker and subtask call goes through [`invoke`]: the
//! governor may grant, defer or deny the call, and transient failures are
//! retried with exponential backoff. None of this is visible to the
//! revision counters.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagegate_common::SessionId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::WorkerError;

/// Identifies a worker call for admission decisions and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLabel {
    pub session_id: SessionId,
    /// e.g. `stage:design` or `item:api:test`
    pub operation: String,
}

impl CallLabel {
    pub fn new(session_id: SessionId, operation: impl Into<String>) -> Self {
        Self {
            session_id,
            operation: operation.into(),
        }
    }
}

impl std::fmt::Display for CallLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.operation)
    }
}

/// Held for the duration of an admitted call.
#[derive(Debug, Default)]
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
pub enum Admission {
    Granted(AdmissionPermit),
    /// Try again after the given delay.
    Deferred(Duration),
    Denied(String),
}

#[async_trait]
pub trait Governor: Send + Sync {
    async fn admit(&self, label: &CallLabel) -> Admission;
}

/// Admits every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

#[async_trait]
impl Governor for Unbounded {
    async fn admit(&self, _label: &CallLabel) -> Admission {
        Admission::Granted(AdmissionPermit::default())
    }
}

/// Caps the number of worker calls in flight across all sessions.
pub struct ConcurrencyGovernor {
    permits: Arc<Semaphore>,
    retry_after: Duration,
}

impl ConcurrencyGovernor {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            retry_after: Duration::from_millis(100),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Governor for ConcurrencyGovernor {
    async fn admit(&self, _label: &CallLabel) -> Admission {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Admission::Granted(AdmissionPermit {
                _permit: Some(permit),
            }),
            Err(tokio::sync::TryAcquireError::NoPermits) => Admission::Deferred(self.retry_after),
            Err(tokio::sync::TryAcquireError::Closed) => {
                Admission::Denied("governor is shut down".to_string())
            }
        }
    }
}

/// Retry and deferral bounds for one worker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_deferrals: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_deferrals: 10,
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

impl RetryPolicy {
    /// No retries and no waiting, for tests.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_deferrals: 0,
        }
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Result of an invoked call with retry bookkeeping.
#[derive(Debug)]
pub struct Invocation<T> {
    pub result: Result<T, WorkerError>,
    pub retries: u32,
    pub deferrals: u32,
}

/// Run `call` under the governor, retrying transient failures.
pub async fn invoke<T, F, Fut>(
    governor: &dyn Governor,
    policy: &RetryPolicy,
    label: &CallLabel,
    mut call: F,
) -> Invocation<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let mut retries = 0;
    let mut deferrals = 0;
    loop {
        let permit = match governor.admit(label).await {
            Admission::Granted(permit) => permit,
            Admission::Deferred(wait) => {
                deferrals += 1;
                if deferrals > policy.max_deferrals {
                    return Invocation {
                        result: Err(WorkerError::DeferralsExhausted {
                            label: label.operation.clone(),
                            deferrals: deferrals - 1,
                        }),
                        retries,
                        deferrals,
                    };
                }
                tracing::debug!(call = %label, ?wait, "worker call deferred");
                tokio::time::sleep(wait).await;
                continue;
            }
            Admission::Denied(reason) => {
                return Invocation {
                    result: Err(WorkerError::Denied(reason)),
                    retries,
                    deferrals,
                };
            }
        };

        let result = call().await;
        drop(permit);

        match result {
            Err(err) if err.is_transient() && retries + 1 < policy.max_attempts => {
                retries += 1;
                let delay = policy.delay_for(retries);
                tracing::warn!(call = %label, retry = retries, ?delay, error = %err, "transient worker failure, retrying");
                tokio::time::sleep(delay).await;
            }
            result => {
                return Invocation {
                    result,
                    retries,
                    deferrals,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn label() -> CallLabel {
        CallLabel::new(SessionId::new(), "stage:design")
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_deferrals: 3,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let invocation = invoke(&Unbounded, &fast_policy(3), &label(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(WorkerError::Transient("busy".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(invocation.result.unwrap(), 2);
        assert_eq!(invocation.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_stop_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let invocation: Invocation<()> = invoke(&Unbounded, &fast_policy(2), &label(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::Transient("busy".into()))
        })
        .await;
        assert!(invocation.result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let invocation: Invocation<()> = invoke(&Unbounded, &fast_policy(5), &label(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::Permanent("bad".into()))
        })
        .await;
        assert_eq!(
            invocation.result.unwrap_err(),
            WorkerError::Permanent("bad".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(invocation.retries, 0);
    }

    #[tokio::test]
    async fn saturated_governor_defers_then_gives_up() {
        let governor = ConcurrencyGovernor::new(1).with_retry_after(Duration::from_millis(1));
        let held = match governor.admit(&label()).await {
            Admission::Granted(permit) => permit,
            other => panic!("Expected Granted, got {:?}", other),
        };
        assert_eq!(governor.available(), 0);

        let invocation: Invocation<()> =
            invoke(&governor, &fast_policy(1), &label(), || async { Ok(()) }).await;
        match invocation.result {
            Err(WorkerError::DeferralsExhausted { deferrals, .. }) => assert_eq!(deferrals, 3),
            other => panic!("Expected DeferralsExhausted, got {:?}", other),
        }
        drop(held);
        assert_eq!(governor.available(), 1);
    }

    #[tokio::test]
    async fn permit_is_released_after_call() {
        let governor = ConcurrencyGovernor::new(1);
        let invocation = invoke(&governor, &fast_policy(1), &label(), || async { Ok(7) }).await;
        assert_eq!(invocation.result.unwrap(), 7);
        assert_eq!(governor.available(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_deferrals: 0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(40), MAX_BACKOFF);
    }
}
