//! Finite state machine for session evaluation phases.
//!
//! Every phase change of the orchestrator goes through this table, so the
//! allowed lifecycle is declared in one place and each change is validated and
//! logged with the event that caused it. The freshness rule is the guard on
//! `ResultAccepted`.

use std::fmt;

use serde::Serialize;

use super::{BlockReason, Prerequisite};

/// Phase of a session, without the data each state carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationPhase {
    Idle,
    AwaitingPrerequisites,
    Evaluating,
    Settled,
    Blocked,
}

impl fmt::Display for EvaluationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationPhase::Idle => write!(f, "Idle"),
            EvaluationPhase::AwaitingPrerequisites => write!(f, "AwaitingPrerequisites"),
            EvaluationPhase::Evaluating => write!(f, "Evaluating"),
            EvaluationPhase::Settled => write!(f, "Settled"),
            EvaluationPhase::Blocked => write!(f, "Blocked"),
        }
    }
}

/// Events that trigger phase transitions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EvaluationEvent {
    /// The session was opened
    SessionStarted,
    /// The engine or params are still outstanding
    PrerequisitesPending,
    /// Engine ready and params resolved or not required
    PrerequisitesMet,
    /// A document edit produced a new consistent snapshot
    InputChanged,
    /// Explicit request to evaluate the current documents
    EvaluationTriggered,
    /// The result of the outstanding request arrived
    ResultAccepted,
    /// A document does not parse
    InputInvalid,
    /// The params object could not be resolved
    ParamsUnavailable,
    /// The engine failed to load
    EngineUnavailable,
}

impl fmt::Display for EvaluationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationEvent::SessionStarted => write!(f, "SessionStarted"),
            EvaluationEvent::PrerequisitesPending => write!(f, "PrerequisitesPending"),
            EvaluationEvent::PrerequisitesMet => write!(f, "PrerequisitesMet"),
            EvaluationEvent::InputChanged => write!(f, "InputChanged"),
            EvaluationEvent::EvaluationTriggered => write!(f, "EvaluationTriggered"),
            EvaluationEvent::ResultAccepted => write!(f, "ResultAccepted"),
            EvaluationEvent::InputInvalid => write!(f, "InputInvalid"),
            EvaluationEvent::ParamsUnavailable => write!(f, "ParamsUnavailable"),
            EvaluationEvent::EngineUnavailable => write!(f, "EngineUnavailable"),
        }
    }
}

/// What caused the orchestrator to reassess the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// A document was edited
    Edit,
    /// The explicit evaluate trigger
    Trigger,
    /// The engine loaded or params were resolved
    Prerequisite,
}

/// Whether a new request can be issued from the current documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending(Vec<Prerequisite>),
    Blocked(BlockReason),
}

/// Data the guards look at
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext {
    /// Sequence number of the request awaiting its result
    pub outstanding: Option<u64>,
    /// Sequence number of the arriving result
    pub result_seq: Option<u64>,
}

impl TransitionContext {
    pub fn for_result(outstanding: Option<u64>, result_seq: u64) -> Self {
        Self {
            outstanding,
            result_seq: Some(result_seq),
        }
    }

    /// The arriving result answers the outstanding request
    pub fn is_fresh(&self) -> bool {
        self.result_seq.is_some() && self.result_seq == self.outstanding
    }
}

/// A transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: EvaluationPhase,
    pub to: EvaluationPhase,
    pub event: EvaluationEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: EvaluationPhase,
        to: EvaluationPhase,
        event: EvaluationEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: EvaluationPhase,
        to: EvaluationPhase,
        event: EvaluationEvent,
        description: &'static str,
    },
    /// No transition for this event from the current phase
    InvalidTransition {
        current: EvaluationPhase,
        event: EvaluationEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: EvaluationPhase,
        to: EvaluationPhase,
        event: EvaluationEvent,
        reason: String,
    },
}

/// Transition table for session evaluation
pub struct EvaluationStateMachine {
    transitions: Vec<Transition>,
}

impl Default for EvaluationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationStateMachine {
    pub fn new() -> Self {
        use EvaluationEvent as E;
        use EvaluationPhase as P;

        Self {
            transitions: vec![
                // === Idle ===
                Transition::new(
                    P::Idle,
                    P::AwaitingPrerequisites,
                    E::SessionStarted,
                    "Session opened, loading prerequisites",
                ),
                // === AwaitingPrerequisites ===
                Transition::new(
                    P::AwaitingPrerequisites,
                    P::Evaluating,
                    E::PrerequisitesMet,
                    "Prerequisites met, issuing first request",
                ),
                Transition::new(
                    P::AwaitingPrerequisites,
                    P::AwaitingPrerequisites,
                    E::PrerequisitesPending,
                    "Still waiting for prerequisites",
                ),
                Transition::new(
                    P::AwaitingPrerequisites,
                    P::Blocked,
                    E::InputInvalid,
                    "Document invalid while waiting for prerequisites",
                ),
                Transition::new(
                    P::AwaitingPrerequisites,
                    P::Blocked,
                    E::ParamsUnavailable,
                    "Params object could not be resolved",
                ),
                Transition::new(
                    P::AwaitingPrerequisites,
                    P::Blocked,
                    E::EngineUnavailable,
                    "Evaluation engine failed to load",
                ),
                // === Evaluating ===
                Transition::new(
                    P::Evaluating,
                    P::Evaluating,
                    E::InputChanged,
                    "Input changed while evaluating, superseding request",
                ),
                Transition::new(
                    P::Evaluating,
                    P::Evaluating,
                    E::EvaluationTriggered,
                    "Evaluation re-triggered, superseding request",
                ),
                Transition::new(
                    P::Evaluating,
                    P::Settled,
                    E::ResultAccepted,
                    "Result of outstanding request accepted",
                ),
                Transition::new(
                    P::Evaluating,
                    P::AwaitingPrerequisites,
                    E::PrerequisitesPending,
                    "Input now needs a prerequisite, abandoning request",
                ),
                Transition::new(
                    P::Evaluating,
                    P::Blocked,
                    E::InputInvalid,
                    "Document invalid, abandoning request",
                ),
                Transition::new(
                    P::Evaluating,
                    P::Blocked,
                    E::ParamsUnavailable,
                    "Params unavailable, abandoning request",
                ),
                // === Settled ===
                Transition::new(
                    P::Settled,
                    P::Evaluating,
                    E::InputChanged,
                    "Input changed, re-evaluating",
                ),
                Transition::new(
                    P::Settled,
                    P::Evaluating,
                    E::EvaluationTriggered,
                    "Evaluation triggered",
                ),
                Transition::new(
                    P::Settled,
                    P::AwaitingPrerequisites,
                    E::PrerequisitesPending,
                    "Input now needs a prerequisite",
                ),
                Transition::new(P::Settled, P::Blocked, E::InputInvalid, "Document invalid"),
                Transition::new(
                    P::Settled,
                    P::Blocked,
                    E::ParamsUnavailable,
                    "Params unavailable",
                ),
                // === Blocked ===
                Transition::new(
                    P::Blocked,
                    P::Evaluating,
                    E::InputChanged,
                    "Input fixed, evaluating",
                ),
                Transition::new(
                    P::Blocked,
                    P::Evaluating,
                    E::EvaluationTriggered,
                    "Evaluation triggered after block cleared",
                ),
                Transition::new(
                    P::Blocked,
                    P::AwaitingPrerequisites,
                    E::PrerequisitesPending,
                    "Input fixed, waiting for prerequisites",
                ),
                Transition::new(P::Blocked, P::Blocked, E::InputInvalid, "Document still invalid"),
                Transition::new(
                    P::Blocked,
                    P::Blocked,
                    E::ParamsUnavailable,
                    "Params still unavailable",
                ),
                Transition::new(
                    P::Blocked,
                    P::Blocked,
                    E::EngineUnavailable,
                    "Evaluation engine failed to load",
                ),
            ],
        }
    }

    /// Attempt a transition from `current` on `event`
    pub fn transition(
        &self,
        current: EvaluationPhase,
        event: EvaluationEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => match Self::check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: EvaluationPhase, event: &EvaluationEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == *event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: EvaluationPhase) -> Vec<&EvaluationEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == phase)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            EvaluationEvent::ResultAccepted if !ctx.is_fresh() => Some(format!(
                "result {:?} does not answer outstanding request {:?}",
                ctx.result_seq, ctx.outstanding
            )),
            _ => None,
        }
    }
}

/// Determine the event for a reassessment of the session
pub fn determine_event(
    current: EvaluationPhase,
    readiness: &Readiness,
    cause: TransitionCause,
) -> EvaluationEvent {
    match readiness {
        Readiness::Blocked(reason) => match reason {
            BlockReason::InvalidPolicy { .. }
            | BlockReason::InvalidResource { .. }
            | BlockReason::InvalidParams { .. } => EvaluationEvent::InputInvalid,
            BlockReason::ParamsUnavailable { .. } => EvaluationEvent::ParamsUnavailable,
            BlockReason::EngineUnavailable { .. } => EvaluationEvent::EngineUnavailable,
        },
        Readiness::Pending(_) => EvaluationEvent::PrerequisitesPending,
        Readiness::Ready => match (current, cause) {
            (EvaluationPhase::Idle | EvaluationPhase::AwaitingPrerequisites, _) => {
                EvaluationEvent::PrerequisitesMet
            }
            (_, TransitionCause::Trigger) => EvaluationEvent::EvaluationTriggered,
            _ => EvaluationEvent::InputChanged,
        },
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::policy::{DocumentError, DocumentKind};

    fn invalid() -> Readiness {
        Readiness::Blocked(BlockReason::InvalidResource {
            error: DocumentError::Empty {
                kind: DocumentKind::Resource,
            },
        })
    }

    #[test]
    fn test_session_start() {
        let sm = EvaluationStateMachine::new();
        let result = sm.transition(
            EvaluationPhase::Idle,
            EvaluationEvent::SessionStarted,
            &TransitionContext::default(),
        );
        match result {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, EvaluationPhase::Idle);
                assert_eq!(to, EvaluationPhase::AwaitingPrerequisites);
            }
            _ => panic!("Expected successful transition"),
        }
    }

    #[test]
    fn test_result_accepted_guard() {
        let sm = EvaluationStateMachine::new();

        let ctx = TransitionContext::for_result(Some(2), 1);
        let result = sm.transition(EvaluationPhase::Evaluating, EvaluationEvent::ResultAccepted, &ctx);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let ctx = TransitionContext::for_result(None, 1);
        let result = sm.transition(EvaluationPhase::Evaluating, EvaluationEvent::ResultAccepted, &ctx);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let ctx = TransitionContext::for_result(Some(2), 2);
        let result = sm.transition(EvaluationPhase::Evaluating, EvaluationEvent::ResultAccepted, &ctx);
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: EvaluationPhase::Settled,
                ..
            }
        ));
    }

    #[test]
    fn test_results_only_accepted_while_evaluating() {
        let sm = EvaluationStateMachine::new();
        for phase in [
            EvaluationPhase::Idle,
            EvaluationPhase::AwaitingPrerequisites,
            EvaluationPhase::Settled,
            EvaluationPhase::Blocked,
        ] {
            assert!(!sm.can_transition(phase, &EvaluationEvent::ResultAccepted));
        }
    }

    #[test]
    fn test_idle_only_starts() {
        let sm = EvaluationStateMachine::new();
        assert_eq!(
            sm.valid_events(EvaluationPhase::Idle),
            vec![&EvaluationEvent::SessionStarted]
        );
    }

    #[test]
    fn test_edits_supersede_from_every_active_phase() {
        let sm = EvaluationStateMachine::new();
        for phase in [
            EvaluationPhase::Evaluating,
            EvaluationPhase::Settled,
            EvaluationPhase::Blocked,
        ] {
            assert!(sm.can_transition(phase, &EvaluationEvent::InputChanged));
            assert!(sm.can_transition(phase, &EvaluationEvent::EvaluationTriggered));
            assert!(sm.can_transition(phase, &EvaluationEvent::InputInvalid));
        }
    }

    #[test]
    fn test_determine_event_ready() {
        assert_eq!(
            determine_event(
                EvaluationPhase::AwaitingPrerequisites,
                &Readiness::Ready,
                TransitionCause::Prerequisite
            ),
            EvaluationEvent::PrerequisitesMet
        );
        assert_eq!(
            determine_event(EvaluationPhase::Settled, &Readiness::Ready, TransitionCause::Trigger),
            EvaluationEvent::EvaluationTriggered
        );
        assert_eq!(
            determine_event(EvaluationPhase::Evaluating, &Readiness::Ready, TransitionCause::Edit),
            EvaluationEvent::InputChanged
        );
    }

    #[test]
    fn test_determine_event_not_ready() {
        assert_eq!(
            determine_event(
                EvaluationPhase::Settled,
                &Readiness::Pending(vec![Prerequisite::Params]),
                TransitionCause::Edit
            ),
            EvaluationEvent::PrerequisitesPending
        );
        assert_eq!(
            determine_event(EvaluationPhase::Evaluating, &invalid(), TransitionCause::Edit),
            EvaluationEvent::InputInvalid
        );
        assert_eq!(
            determine_event(
                EvaluationPhase::AwaitingPrerequisites,
                &Readiness::Blocked(BlockReason::EngineUnavailable {
                    message: "boom".to_string()
                }),
                TransitionCause::Prerequisite
            ),
            EvaluationEvent::EngineUnavailable
        );
    }
}
