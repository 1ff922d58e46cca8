//! Decision routing.
//!
//! A pure table from (stage, gate state, decision) to the next
//! [`Transition`]. Routing never touches the session; the gate and the
//! pipeline controller apply whatever transition comes back.

use stagegate_common::{Decision, DecisionRequest, Stage, Transition};

/// Route a raw decision request. Malformed requests become
/// [`Transition::Reject`] carrying the reason; this never panics.
pub fn route(stage: Stage, gate_open: bool, request: &DecisionRequest) -> Transition {
    match request.parse() {
        Ok(decision) => route_decision(stage, gate_open, &decision),
        Err(reason) => Transition::Reject(reason),
    }
}

/// Route an already validated decision.
pub fn route_decision(stage: Stage, gate_open: bool, decision: &Decision) -> Transition {
    if !gate_open {
        return Transition::Reject(format!("no decision is pending at stage {}", stage));
    }
    if !stage.is_gated() {
        return Transition::Reject(format!("stage {} has no approval gate", stage));
    }
    match decision {
        Decision::Approve => match stage.next() {
            Some(next) => Transition::Advance(next),
            None => Transition::Reject(format!("stage {} has no successor", stage)),
        },
        Decision::Revise { feedback } if feedback.trim().is_empty() => {
            Transition::Reject("revise requires non-empty feedback".to_string())
        }
        Decision::Revise { .. } => Transition::Retry(stage),
        Decision::Abort => Transition::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STAGES: [Stage; 8] = [
        Stage::Requirements,
        Stage::TechStack,
        Stage::Design,
        Stage::Plan,
        Stage::Generation,
        Stage::Finalized,
        Stage::Terminated,
        Stage::Failed,
    ];

    fn decisions() -> Vec<Decision> {
        vec![
            Decision::Approve,
            Decision::Revise {
                feedback: "more detail".into(),
            },
            Decision::Abort,
        ]
    }

    #[test]
    fn approve_advances_each_gated_stage() {
        assert_eq!(
            route(Stage::Requirements, true, &DecisionRequest::approve()),
            Transition::Advance(Stage::TechStack)
        );
        assert_eq!(
            route(Stage::TechStack, true, &DecisionRequest::approve()),
            Transition::Advance(Stage::Design)
        );
        assert_eq!(
            route(Stage::Design, true, &DecisionRequest::approve()),
            Transition::Advance(Stage::Plan)
        );
        assert_eq!(
            route(Stage::Plan, true, &DecisionRequest::approve()),
            Transition::Advance(Stage::Generation)
        );
    }

    #[test]
    fn revise_retries_same_stage() {
        for stage in Stage::GATED {
            assert_eq!(
                route(stage, true, &DecisionRequest::revise("too vague")),
                Transition::Retry(stage)
            );
        }
    }

    #[test]
    fn abort_terminates_at_every_gate() {
        for stage in Stage::GATED {
            assert_eq!(
                route(stage, true, &DecisionRequest::abort()),
                Transition::Terminate
            );
        }
    }

    #[test]
    fn table_is_total() {
        for stage in ALL_STAGES {
            for gate_open in [true, false] {
                for decision in decisions() {
                    let transition = route_decision(stage, gate_open, &decision);
                    if !gate_open || !stage.is_gated() {
                        assert!(transition.is_reject(), "{stage} {decision:?}");
                    } else {
                        assert!(!transition.is_reject(), "{stage} {decision:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn malformed_requests_are_rejected_with_reason() {
        match route(Stage::Design, true, &DecisionRequest::new("", None)) {
            Transition::Reject(reason) => assert!(reason.contains("empty")),
            other => panic!("Expected Reject, got {:?}", other),
        }
        match route(Stage::Design, true, &DecisionRequest::new("revise", None)) {
            Transition::Reject(reason) => assert!(reason.contains("feedback")),
            other => panic!("Expected Reject, got {:?}", other),
        }
        match route(Stage::Design, true, &DecisionRequest::new("merge", None)) {
            Transition::Reject(reason) => assert!(reason.contains("merge")),
            other => panic!("Expected Reject, got {:?}", other),
        }
    }

    #[test]
    fn generation_has_no_gate() {
        match route(Stage::Generation, true, &DecisionRequest::approve()) {
            Transition::Reject(reason) => assert!(reason.contains("no approval gate")),
            other => panic!("Expected Reject, got {:?}", other),
        }
    }
}
