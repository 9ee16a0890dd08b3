// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for vap-playground.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{Value, json};

use vap_playground::cluster::ParamsTarget;
use vap_playground::engine::Verdict;
use vap_playground::orchestrator::{
    BlockReason, Command, Disposition, EvaluationEvent, EvaluationPhase, EvaluationRequest,
    EvaluationResult, EvaluationStateMachine, Orchestrator, OrchestratorState, Prerequisite,
    Readiness, ResultOutcome, TransitionCause, determine_event,
};
use vap_playground::policy::{
    DocumentError, DocumentKind, DocumentStore, LAST_APPLIED_ANNOTATION, ParamKindRef, sanitize,
};

// Shared test fixtures (used by unit, functional, and proptest)
#[path = "../common/mod.rs"]
mod common;

use common::PolicyBuilder;

/// Strategy for phases the orchestrator reassesses from.
fn reassessed_phase() -> impl Strategy<Value = EvaluationPhase> {
    prop_oneof![
        Just(EvaluationPhase::AwaitingPrerequisites),
        Just(EvaluationPhase::Evaluating),
        Just(EvaluationPhase::Settled),
        Just(EvaluationPhase::Blocked),
    ]
}

fn any_readiness() -> impl Strategy<Value = Readiness> {
    let reference = ParamKindRef {
        api_version: "v1".to_string(),
        kind: "Foo".to_string(),
    };
    prop_oneof![
        Just(Readiness::Ready),
        Just(Readiness::Pending(vec![Prerequisite::Engine])),
        Just(Readiness::Pending(vec![Prerequisite::Params])),
        Just(Readiness::Pending(vec![
            Prerequisite::Engine,
            Prerequisite::Params
        ])),
        Just(Readiness::Blocked(BlockReason::InvalidPolicy {
            error: DocumentError::MissingField {
                kind: DocumentKind::Policy,
                field: "metadata.name",
            },
        })),
        Just(Readiness::Blocked(BlockReason::InvalidResource {
            error: DocumentError::Empty {
                kind: DocumentKind::Resource,
            },
        })),
        Just(Readiness::Blocked(BlockReason::ParamsUnavailable {
            reference,
            message: "no foos.v1 objects found in the cluster".to_string(),
        })),
        Just(Readiness::Blocked(BlockReason::EngineUnavailable {
            message: "evaluator not found".to_string(),
        })),
    ]
}

fn any_cause() -> impl Strategy<Value = TransitionCause> {
    prop_oneof![
        Just(TransitionCause::Edit),
        Just(TransitionCause::Trigger),
        Just(TransitionCause::Prerequisite),
    ]
}

/// Session inputs for the freshness property.
#[derive(Debug, Clone)]
enum Op {
    /// Replace the resource with one of a few variants; repeats are no-op edits
    EditResource(u8),
    Trigger,
    /// Deliver one of the pending results
    Complete(Index),
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::EditResource),
        Just(Op::Trigger),
        any::<Index>().prop_map(Op::Complete),
    ]
}

fn requests(commands: Vec<Command>) -> impl Iterator<Item = EvaluationRequest> {
    commands.into_iter().filter_map(|c| match c {
        Command::Evaluate(request) => Some(request),
        _ => None,
    })
}

fn answer(request: &EvaluationRequest) -> EvaluationResult {
    let verdict = Verdict::interpret(&request.resource).unwrap();
    EvaluationResult::new(request.seq, ResultOutcome::Verdict(verdict))
}

fn policy_object() -> impl Strategy<Value = Value> {
    (
        "[a-z][a-z0-9-]{0,12}",
        prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..4),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(name, annotations, last_applied, managed, status)| {
            let mut object = PolicyBuilder::new(name)
                .validation("object.spec.replicas <= 5", None)
                .build();
            let mut annotations: BTreeMap<String, String> = annotations;
            if last_applied {
                annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), "{}".to_string());
            }
            if !annotations.is_empty() {
                object["metadata"]["annotations"] = json!(annotations);
            }
            if managed {
                object["metadata"]["managedFields"] = json!([{ "manager": "kubectl" }]);
            }
            if status {
                object["status"] = json!({ "observedGeneration": 3 });
            }
            object
        })
}

proptest! {
    /// Property: whatever order results arrive in, the displayed result answers
    /// the most recent request once everything has completed.
    #[test]
    fn test_latest_request_wins(ops in prop::collection::vec(any_op(), 0..40)) {
        let policy = PolicyBuilder::new("demo").validation("true", None).yaml();
        let mut orchestrator = Orchestrator::new(DocumentStore::new(policy, None));
        orchestrator.start();

        let mut pending: Vec<EvaluationRequest> = requests(orchestrator.engine_loaded()).collect();
        let mut issued: Vec<u64> = pending.iter().map(|r| r.seq).collect();

        for op in ops {
            let commands = match op {
                Op::EditResource(variant) => {
                    let text = format!("kind: Pod\nmetadata:\n  name: pod-{variant}\n");
                    orchestrator.edit(DocumentKind::Resource, text).unwrap()
                }
                Op::Trigger => orchestrator.request_evaluation(),
                Op::Complete(index) => {
                    if !pending.is_empty() {
                        let request = pending.remove(index.index(pending.len()));
                        let disposition = orchestrator.evaluation_completed(answer(&request));
                        if disposition == Disposition::Accepted {
                            prop_assert_eq!(request.seq, orchestrator.last_issued());
                        }
                    }
                    Vec::new()
                }
            };
            for request in requests(commands) {
                issued.push(request.seq);
                pending.push(request);
            }
        }

        prop_assert!(issued.windows(2).all(|w| w[0] < w[1]), "seqs not increasing: {:?}", issued);

        for request in pending.drain(..) {
            orchestrator.evaluation_completed(answer(&request));
        }
        prop_assert_eq!(orchestrator.last_accepted(), Some(orchestrator.last_issued()));
        match orchestrator.state() {
            OrchestratorState::Settled { result } => {
                prop_assert_eq!(result.seq, orchestrator.last_issued());
                prop_assert_eq!(
                    result.outcome.display_text(),
                    orchestrator.store().resource().text()
                );
            }
            other => prop_assert!(false, "expected Settled, got {:?}", other),
        }
    }

    /// Property: every event the orchestrator derives during reassessment has a
    /// transition from the phase it is derived in.
    #[test]
    fn test_determined_events_are_in_table(
        phase in reassessed_phase(),
        readiness in any_readiness(),
        cause in any_cause(),
    ) {
        // A failed engine is detected before any request can be issued
        prop_assume!(!(
            matches!(phase, EvaluationPhase::Evaluating | EvaluationPhase::Settled)
                && matches!(readiness, Readiness::Blocked(BlockReason::EngineUnavailable { .. }))
        ));

        let sm = EvaluationStateMachine::new();
        let event = determine_event(phase, &readiness, cause);
        prop_assert!(
            sm.can_transition(phase, &event),
            "no transition from {} on {}", phase, event
        );
    }

    /// Property: transition checks are deterministic.
    #[test]
    fn test_transitions_deterministic(
        phase in reassessed_phase(),
        readiness in any_readiness(),
        cause in any_cause(),
    ) {
        let sm = EvaluationStateMachine::new();
        let event = determine_event(phase, &readiness, cause);
        prop_assert_eq!(&event, &determine_event(phase, &readiness, cause));
        prop_assert_eq!(sm.can_transition(phase, &event), sm.can_transition(phase, &event));
    }

    /// Property: results only ever enter Settled from Evaluating.
    #[test]
    fn test_result_accepted_only_while_evaluating(phase in reassessed_phase()) {
        let sm = EvaluationStateMachine::new();
        let allowed = sm.can_transition(phase, &EvaluationEvent::ResultAccepted);
        prop_assert_eq!(allowed, phase == EvaluationPhase::Evaluating);
    }

    /// Property: sanitizing strips server-managed fields, keeps everything
    /// else, and is idempotent.
    #[test]
    fn test_sanitize_idempotent(object in policy_object()) {
        let cleaned = sanitize(&object).unwrap();

        prop_assert!(cleaned.get("status").is_none());
        prop_assert!(cleaned["metadata"].get("managedFields").is_none());
        if let Some(annotations) = cleaned["metadata"].get("annotations") {
            prop_assert!(annotations.get(LAST_APPLIED_ANNOTATION).is_none());
            for (key, value) in annotations.as_object().unwrap() {
                prop_assert_eq!(&object["metadata"]["annotations"][key], value);
            }
        }
        prop_assert_eq!(&cleaned["spec"], &object["spec"]);
        prop_assert_eq!(&cleaned["metadata"]["name"], &object["metadata"]["name"]);

        prop_assert_eq!(sanitize(&cleaned).unwrap(), cleaned);
    }

    /// Property: a param-kind reference maps to a collection whose API version
    /// is the one declared.
    #[test]
    fn test_params_target_from_reference(
        group in prop::option::of("[a-z]{1,8}(\\.[a-z]{1,8}){0,2}"),
        version in "v[1-9](beta[1-9])?",
        kind in "[A-Z][a-zA-Z]{0,12}",
    ) {
        let api_version = match &group {
            Some(group) => format!("{group}/{version}"),
            None => version.clone(),
        };
        let target = ParamsTarget::from_reference(&ParamKindRef {
            api_version: api_version.clone(),
            kind: kind.clone(),
        });

        let plural = format!("{}s", kind.to_lowercase());
        prop_assert_eq!(target.api_version(), api_version);
        prop_assert_eq!(&target.group, &group.unwrap_or_default());
        prop_assert_eq!(&target.plural, &plural);
        let expected_suffix = format!("/{version}/{plural}");
        prop_assert!(target.path().ends_with(&expected_suffix));
    }
}
