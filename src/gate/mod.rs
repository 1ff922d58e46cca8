//! The approval gate: the only way a session suspends, and the only way
//! a suspended session resumes.
//!
//! [`open`] parks the session on a payload under a fresh one-time token.
//! [`resolve`] accepts exactly one decision for that token; the decision
//! is routed (purely) and recorded in `gate_history`, which is what makes
//! a retried identical decision answer with the prior result instead of
//! applying twice.

use chrono::{DateTime, Utc};
use stagegate_common::{
    Artifact, DecisionRequest, GateResolution, GateToken, PendingGate, Session, Stage, Transition,
};

use crate::errors::GateError;
use crate::router;

/// What a successful [`resolve`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The decision was applied now; the gate is cleared and the caller
    /// must carry out the transition.
    Applied(Transition),
    /// The same decision was already applied with this token. Nothing
    /// was changed.
    Replayed(GateResolution),
}

/// Suspend `session` at `stage` awaiting a decision on `payload`.
pub fn open(session: &mut Session, stage: Stage, payload: Artifact, now: DateTime<Utc>) -> GateToken {
    let token = GateToken::new();
    session.pending_gate = Some(PendingGate {
        stage,
        payload,
        lock_token: token,
        opened_at: now,
    });
    token
}

/// Resolve the open gate with `token` and a raw decision request.
pub fn resolve(
    session: &mut Session,
    token: GateToken,
    request: &DecisionRequest,
    now: DateTime<Utc>,
) -> Result<Resolution, GateError> {
    if let Some(prior) = session.find_resolution(token) {
        return match request.parse() {
            Ok(decision) if decision == prior.decision => Ok(Resolution::Replayed(prior.clone())),
            _ => Err(GateError::StaleToken { presented: token }),
        };
    }

    let gate = match session.pending_gate {
        Some(ref gate) => gate,
        None if session.is_terminal() => {
            return Err(GateError::SessionClosed {
                stage: session.current_stage,
            });
        }
        None => {
            return Err(GateError::NoPendingGate {
                stage: session.current_stage,
            });
        }
    };
    if gate.lock_token != token {
        return Err(GateError::StaleToken { presented: token });
    }
    let stage = gate.stage;

    let transition = router::route(stage, true, request);
    let decision = match (&transition, request.parse()) {
        (Transition::Reject(reason), _) => {
            return Err(GateError::MalformedDecision {
                reason: reason.clone(),
            });
        }
        (_, Ok(decision)) => decision,
        (_, Err(reason)) => return Err(GateError::MalformedDecision { reason }),
    };

    session.pending_gate = None;
    session.gate_history.push(GateResolution {
        token,
        stage,
        decision,
        transition: transition.clone(),
        resolved_at: now,
    });
    Ok(Resolution::Applied(transition))
}
