//! The evaluation orchestrator.
//!
//! A synchronous state machine over one session's documents. It never awaits
//! anything itself: every input (edit, trigger, prerequisite completion,
//! engine result) is a method call that updates the state and returns the
//! [`Command`]s the caller must carry out. This keeps the freshness rule and
//! the prerequisite sequencing testable without a runtime.
//!
//! Freshness: each request gets the next sequence number and becomes the
//! outstanding request. A result is accepted only if it answers the
//! outstanding request; every other result is discarded. Moving to `Blocked`
//! or `AwaitingPrerequisites` abandons the outstanding request.

use tracing::{debug, info, warn};

use super::state_machine::{
    EvaluationEvent, EvaluationPhase, EvaluationStateMachine, Readiness, TransitionCause,
    TransitionContext, TransitionResult, determine_event,
};
use super::{
    BlockReason, Command, EvaluationRequest, EvaluationResult, OrchestratorState, Prerequisite,
};
use crate::engine::EngineState;
use crate::policy::{
    DocumentKind, DocumentStore, ParamsState, ResolutionToken, StoreError, parse_params,
};

/// What happened to an arriving result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Discarded,
}

/// Orchestrates evaluation for one session.
pub struct Orchestrator {
    store: DocumentStore,
    machine: EvaluationStateMachine,
    state: OrchestratorState,
    /// Engine state as last reported to this session
    engine: EngineState,
    last_issued: u64,
    outstanding: Option<u64>,
    last_accepted: Option<u64>,
    /// Most recent accepted result, kept while a newer request is in flight
    result: Option<EvaluationResult>,
    next_token: u64,
}

impl Orchestrator {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            store,
            machine: EvaluationStateMachine::new(),
            state: OrchestratorState::Idle,
            engine: EngineState::NotLoaded,
            last_issued: 0,
            outstanding: None,
            last_accepted: None,
            result: None,
            next_token: 0,
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn engine_state(&self) -> &EngineState {
        &self.engine
    }

    /// Sequence number of the last request issued, 0 before the first.
    pub fn last_issued(&self) -> u64 {
        self.last_issued
    }

    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding
    }

    pub fn last_accepted(&self) -> Option<u64> {
        self.last_accepted
    }

    /// The result currently displayed.
    pub fn latest_result(&self) -> Option<&EvaluationResult> {
        self.result.as_ref()
    }

    /// Open the session: request the engine and, if needed, the params object.
    pub fn start(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        let started = self.apply(
            EvaluationEvent::SessionStarted,
            OrchestratorState::AwaitingPrerequisites {
                waiting_for: vec![Prerequisite::Engine],
            },
            &TransitionContext::default(),
        );
        if !started {
            return commands;
        }

        if self.engine == EngineState::NotLoaded {
            self.engine = EngineState::Loading;
            commands.push(Command::LoadEngine);
        }
        self.assess(TransitionCause::Prerequisite, &mut commands);
        commands
    }

    /// Apply an edit to one document.
    ///
    /// An edit that leaves the text unchanged is ignored.
    pub fn edit(&mut self, kind: DocumentKind, text: String) -> Result<Vec<Command>, StoreError> {
        let mut commands = Vec::new();
        if !self.store.edit(kind, text)? {
            debug!(document = %kind, "Edit left document unchanged");
            return Ok(commands);
        }
        if self.state.phase() != EvaluationPhase::Idle {
            self.assess(TransitionCause::Edit, &mut commands);
        }
        Ok(commands)
    }

    /// Explicit evaluate trigger. Behaves like an edit.
    pub fn request_evaluation(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.state.phase() != EvaluationPhase::Idle {
            self.assess(TransitionCause::Trigger, &mut commands);
        }
        commands
    }

    pub fn engine_loaded(&mut self) -> Vec<Command> {
        self.engine = EngineState::Ready;
        let mut commands = Vec::new();
        self.assess(TransitionCause::Prerequisite, &mut commands);
        commands
    }

    pub fn engine_failed(&mut self, message: String) -> Vec<Command> {
        self.engine = EngineState::LoadFailed(message);
        let mut commands = Vec::new();
        self.assess(TransitionCause::Prerequisite, &mut commands);
        commands
    }

    /// Record a params resolution outcome. Superseded resolutions are ignored.
    pub fn params_fetched(
        &mut self,
        token: ResolutionToken,
        outcome: Result<String, String>,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        if !self.store.complete_fetch(token, outcome) {
            debug!(token = token.0, "Discarding superseded params resolution");
            return commands;
        }
        self.assess(TransitionCause::Prerequisite, &mut commands);
        commands
    }

    /// Offer an engine result. Only the answer to the outstanding request is accepted.
    pub fn evaluation_completed(&mut self, result: EvaluationResult) -> Disposition {
        let seq = result.seq;
        let ctx = TransitionContext::for_result(self.outstanding, seq);
        let from = self.state.phase();

        match self
            .machine
            .transition(from, EvaluationEvent::ResultAccepted, &ctx)
        {
            TransitionResult::Success { to, description, .. } => {
                info!(seq, from = %from, to = %to, error = result.outcome.is_error(), "{}", description);
                self.outstanding = None;
                self.last_accepted = Some(seq);
                self.result = Some(result.clone());
                self.state = OrchestratorState::Settled { result };
                Disposition::Accepted
            }
            TransitionResult::GuardFailed { reason, .. } => {
                debug!(seq, %reason, "Discarding stale result");
                Disposition::Discarded
            }
            TransitionResult::InvalidTransition { current, .. } => {
                debug!(seq, phase = %current, "Discarding result, no request outstanding");
                Disposition::Discarded
            }
        }
    }

    /// Re-derive readiness from the documents and move to the matching phase.
    fn assess(&mut self, cause: TransitionCause, commands: &mut Vec<Command>) {
        let readiness = self.readiness(commands);
        let event = determine_event(self.state.phase(), &readiness, cause);
        let seq = self.last_issued + 1;

        let next = match &readiness {
            Readiness::Ready => OrchestratorState::Evaluating { seq },
            Readiness::Pending(waiting_for) => OrchestratorState::AwaitingPrerequisites {
                waiting_for: waiting_for.clone(),
            },
            Readiness::Blocked(reason) => OrchestratorState::Blocked {
                reason: reason.clone(),
            },
        };
        if !self.apply(event, next, &TransitionContext::default()) {
            return;
        }

        match readiness {
            Readiness::Ready => {
                self.last_issued = seq;
                self.outstanding = Some(seq);
                let snapshot = self.store.snapshot();
                commands.push(Command::Evaluate(EvaluationRequest {
                    seq,
                    policy: snapshot.policy,
                    resource: snapshot.resource,
                    params: snapshot.params,
                }));
            }
            Readiness::Pending(_) | Readiness::Blocked(_) => {
                if let Some(abandoned) = self.outstanding.take() {
                    debug!(seq = abandoned, "Abandoning outstanding request");
                }
            }
        }
    }

    /// Check, in order: engine failure, policy, resource, params, engine readiness.
    ///
    /// Starts a params resolution when the policy's param kind differs from the
    /// one the params document was resolved for.
    fn readiness(&mut self, commands: &mut Vec<Command>) -> Readiness {
        if let EngineState::LoadFailed(message) = &self.engine {
            return Readiness::Blocked(BlockReason::EngineUnavailable {
                message: message.clone(),
            });
        }

        let wanted = match self.store.parsed_policy() {
            Ok(policy) => policy.param_kind.clone(),
            Err(error) => {
                return Readiness::Blocked(BlockReason::InvalidPolicy {
                    error: error.clone(),
                });
            }
        };

        if let Err(error) = self.store.resource_check() {
            return Readiness::Blocked(BlockReason::InvalidResource {
                error: error.clone(),
            });
        }

        let mut waiting_for = Vec::new();
        if !matches!(self.engine, EngineState::Ready) {
            waiting_for.push(Prerequisite::Engine);
        }

        match wanted {
            None => {
                if !matches!(self.store.params(), ParamsState::Absent) {
                    debug!("Policy no longer declares a param kind, dropping params");
                    self.store.clear_params();
                }
            }
            Some(reference) if self.store.params().reference() != Some(&reference) => {
                self.next_token += 1;
                let token = ResolutionToken(self.next_token);
                debug!(token = token.0, kind = %reference.kind, "Resolving params");
                self.store.begin_fetch(reference.clone(), token);
                commands.push(Command::ResolveParams { token, reference });
                waiting_for.push(Prerequisite::Params);
            }
            Some(_) => match self.store.params() {
                ParamsState::Fetching { .. } => waiting_for.push(Prerequisite::Params),
                ParamsState::Resolved { document, .. } => {
                    if let Err(error) = parse_params(document.text()) {
                        return Readiness::Blocked(BlockReason::InvalidParams { error });
                    }
                }
                ParamsState::FetchFailed { reference, reason } => {
                    return Readiness::Blocked(BlockReason::ParamsUnavailable {
                        reference: reference.clone(),
                        message: reason.clone(),
                    });
                }
                ParamsState::Absent => {}
            },
        }

        if waiting_for.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Pending(waiting_for)
        }
    }

    /// Validate a transition against the table and enter `next` if allowed.
    fn apply(
        &mut self,
        event: EvaluationEvent,
        next: OrchestratorState,
        ctx: &TransitionContext,
    ) -> bool {
        let current = self.state.phase();
        match self.machine.transition(current, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                event,
                description,
            } if to == next.phase() => {
                if from == to {
                    debug!(phase = %to, event = %event, "{}", description);
                } else {
                    info!(from = %from, to = %to, event = %event, "{}", description);
                }
                self.state = next;
                true
            }
            TransitionResult::Success { to, event, .. } => {
                warn!(phase = %current, event = %event, table = %to, wanted = %next.phase(), "Transition target mismatch");
                false
            }
            TransitionResult::InvalidTransition { current, event } => {
                warn!(phase = %current, event = %event, "Invalid transition ignored");
                false
            }
            TransitionResult::GuardFailed { reason, event, .. } => {
                debug!(phase = %current, event = %event, %reason, "Transition guard failed");
                false
            }
        }
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
    use crate::engine::Verdict;
    use crate::orchestrator::ResultOutcome;
    use crate::policy::{ABSENT_PARAMS, ParamKindRef};

    const POLICY: &str = "metadata:\n  name: demo\nspec:\n  validations:\n  - expression: object.spec.replicas < 5\n";
    const PARAM_POLICY: &str = "metadata:\n  name: demo\nspec:\n  paramKind:\n    apiVersion: v1\n    kind: Foo\n  validations:\n  - expression: 'true'\n";

    fn orchestrator(policy: &str) -> Orchestrator {
        Orchestrator::new(DocumentStore::new(policy, None))
    }

    fn verdict(seq: u64) -> EvaluationResult {
        EvaluationResult::new(
            seq,
            ResultOutcome::Verdict(Verdict::interpret(&format!("seq {seq}")).unwrap()),
        )
    }

    fn evaluate_seq(commands: &[Command]) -> Option<u64> {
        commands.iter().find_map(|c| match c {
            Command::Evaluate(request) => Some(request.seq),
            _ => None,
        })
    }

    fn resolve_token(commands: &[Command]) -> Option<ResolutionToken> {
        commands.iter().find_map(|c| match c {
            Command::ResolveParams { token, .. } => Some(*token),
            _ => None,
        })
    }

    #[test]
    fn test_start_loads_engine() {
        let mut orch = orchestrator(POLICY);
        let commands = orch.start();
        assert_eq!(commands, vec![Command::LoadEngine]);
        assert_eq!(
            orch.state(),
            &OrchestratorState::AwaitingPrerequisites {
                waiting_for: vec![Prerequisite::Engine]
            }
        );
    }

    #[test]
    fn test_first_request_is_seq_one() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        let commands = orch.engine_loaded();
        let Some(Command::Evaluate(request)) = commands.first() else {
            panic!("expected an evaluate command, got {commands:?}");
        };
        assert_eq!(request.seq, 1);
        assert_eq!(request.params, ABSENT_PARAMS);
        assert_eq!(orch.state(), &OrchestratorState::Evaluating { seq: 1 });
        assert_eq!(orch.store().params(), &ParamsState::Absent);
    }

    #[test]
    fn test_edit_supersedes_outstanding_request() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        orch.engine_loaded();

        let commands = orch
            .edit(DocumentKind::Resource, "kind: Pod\n".to_string())
            .unwrap();
        assert_eq!(evaluate_seq(&commands), Some(2));
        assert_eq!(orch.outstanding(), Some(2));

        assert_eq!(orch.evaluation_completed(verdict(1)), Disposition::Discarded);
        assert_eq!(orch.state().phase(), EvaluationPhase::Evaluating);
        assert_eq!(orch.evaluation_completed(verdict(2)), Disposition::Accepted);
        assert_eq!(orch.last_accepted(), Some(2));
        assert_eq!(orch.latest_result().unwrap().seq, 2);
    }

    #[test]
    fn test_unchanged_edit_is_ignored() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        orch.engine_loaded();
        let commands = orch.edit(DocumentKind::Policy, POLICY.to_string()).unwrap();
        assert!(commands.is_empty());
        assert_eq!(orch.last_issued(), 1);
    }

    #[test]
    fn test_trigger_reissues_after_settle() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        orch.engine_loaded();
        orch.evaluation_completed(verdict(1));

        let commands = orch.request_evaluation();
        assert_eq!(evaluate_seq(&commands), Some(2));
        // previous verdict stays visible until the new one lands
        assert_eq!(orch.latest_result().unwrap().seq, 1);
    }

    #[test]
    fn test_invalid_resource_blocks_and_abandons() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        orch.engine_loaded();

        let commands = orch
            .edit(DocumentKind::Resource, "- not\n- a mapping\n".to_string())
            .unwrap();
        assert!(commands.is_empty());
        assert!(matches!(
            orch.state(),
            OrchestratorState::Blocked {
                reason: BlockReason::InvalidResource { .. }
            }
        ));
        assert_eq!(orch.outstanding(), None);
        assert_eq!(orch.evaluation_completed(verdict(1)), Disposition::Discarded);

        let commands = orch
            .edit(DocumentKind::Resource, "kind: Pod\n".to_string())
            .unwrap();
        assert_eq!(evaluate_seq(&commands), Some(2));
    }

    #[test]
    fn test_invalid_policy_at_start() {
        let mut orch = orchestrator("metadata: [");
        let commands = orch.start();
        assert_eq!(commands, vec![Command::LoadEngine]);
        assert!(matches!(
            orch.state(),
            OrchestratorState::Blocked {
                reason: BlockReason::InvalidPolicy { .. }
            }
        ));
        assert!(orch.engine_loaded().is_empty());
        assert_eq!(orch.last_issued(), 0);
    }

    #[test]
    fn test_engine_failure_blocks_for_good() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        orch.engine_failed("evaluator not found".to_string());
        assert!(matches!(
            orch.state(),
            OrchestratorState::Blocked {
                reason: BlockReason::EngineUnavailable { .. }
            }
        ));
        assert!(orch.request_evaluation().is_empty());
        assert!(
            orch.edit(DocumentKind::Resource, "kind: Pod\n".to_string())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_params_resolved_before_evaluation() {
        let mut orch = orchestrator(PARAM_POLICY);
        let commands = orch.start();
        let token = resolve_token(&commands).unwrap();
        assert!(commands.contains(&Command::ResolveParams {
            token,
            reference: ParamKindRef {
                api_version: "v1".to_string(),
                kind: "Foo".to_string()
            }
        }));

        assert!(orch.engine_loaded().is_empty());
        assert_eq!(
            orch.state(),
            &OrchestratorState::AwaitingPrerequisites {
                waiting_for: vec![Prerequisite::Params]
            }
        );

        let commands = orch.params_fetched(token, Ok("limit: 3\n".to_string()));
        let Some(Command::Evaluate(request)) = commands.first() else {
            panic!("expected evaluation once params resolved");
        };
        assert_eq!(request.params, "limit: 3\n");
    }

    #[test]
    fn test_params_failure_blocks_until_reference_changes() {
        let mut orch = orchestrator(PARAM_POLICY);
        let token = resolve_token(&orch.start()).unwrap();
        orch.engine_loaded();
        orch.params_fetched(token, Err("no foos found".to_string()));
        assert!(matches!(
            orch.state(),
            OrchestratorState::Blocked {
                reason: BlockReason::ParamsUnavailable { .. }
            }
        ));

        // neither a trigger nor an unrelated edit retries
        assert!(orch.request_evaluation().is_empty());
        assert!(
            orch.edit(DocumentKind::Resource, "kind: Pod\n".to_string())
                .unwrap()
                .is_empty()
        );

        let edited = PARAM_POLICY.replace("kind: Foo", "kind: Bar");
        let commands = orch.edit(DocumentKind::Policy, edited).unwrap();
        assert!(resolve_token(&commands).is_some());
        assert_eq!(orch.state().phase(), EvaluationPhase::AwaitingPrerequisites);
    }

    #[test]
    fn test_superseded_resolution_is_ignored() {
        let mut orch = orchestrator(PARAM_POLICY);
        let first = resolve_token(&orch.start()).unwrap();
        orch.engine_loaded();

        let edited = PARAM_POLICY.replace("kind: Foo", "kind: Bar");
        let second = resolve_token(&orch.edit(DocumentKind::Policy, edited).unwrap()).unwrap();
        assert_ne!(first, second);

        assert!(orch.params_fetched(first, Ok("stale: true\n".to_string())).is_empty());
        assert!(matches!(orch.store().params(), ParamsState::Fetching { .. }));

        let commands = orch.params_fetched(second, Ok("fresh: true\n".to_string()));
        assert_eq!(evaluate_seq(&commands), Some(1));
    }

    #[test]
    fn test_dropping_param_kind_clears_params() {
        let mut orch = orchestrator(PARAM_POLICY);
        let token = resolve_token(&orch.start()).unwrap();
        orch.engine_loaded();
        orch.params_fetched(token, Ok("limit: 3\n".to_string()));

        let commands = orch.edit(DocumentKind::Policy, POLICY.to_string()).unwrap();
        assert_eq!(orch.store().params(), &ParamsState::Absent);
        let Some(Command::Evaluate(request)) = commands.first() else {
            panic!("expected re-evaluation");
        };
        assert_eq!(request.params, ABSENT_PARAMS);
    }

    #[test]
    fn test_params_edit_reevaluates_and_validates() {
        let mut orch = orchestrator(PARAM_POLICY);
        let token = resolve_token(&orch.start()).unwrap();
        orch.engine_loaded();
        orch.params_fetched(token, Ok("limit: 3\n".to_string()));

        let commands = orch
            .edit(DocumentKind::Params, "limit: 4\n".to_string())
            .unwrap();
        assert_eq!(evaluate_seq(&commands), Some(2));

        orch.edit(DocumentKind::Params, "limit: [".to_string()).unwrap();
        assert!(matches!(
            orch.state(),
            OrchestratorState::Blocked {
                reason: BlockReason::InvalidParams { .. }
            }
        ));
    }

    #[test]
    fn test_params_not_editable_before_resolution() {
        let mut orch = orchestrator(POLICY);
        orch.start();
        let err = orch
            .edit(DocumentKind::Params, "x: 1\n".to_string())
            .unwrap_err();
        assert_eq!(err, StoreError::ParamsNotEditable { state: "absent" });
    }
}
