//! Policy evaluation orchestration.
//!
//! The orchestrator decides when an evaluation is due, sequences the
//! asynchronous prerequisites (engine load, params resolution), snapshots the
//! documents into numbered requests and applies the freshness rule to results:
//! a result is shown only if it answers the most recently issued request.
//!
//! - `state_machine`: phase transition table
//! - `coordinator`: the synchronous orchestrator, driven by events and emitting commands
//! - `session`: the per-session task executing commands and publishing views

pub mod coordinator;
pub mod session;
pub mod state_machine;

pub use coordinator::{Disposition, Orchestrator};
pub use session::{
    DocumentView, ParamsView, PolicyMetadata, Session, SessionContext, SessionError, SessionView,
    open_policy_session,
};
pub use state_machine::{
    EvaluationEvent, EvaluationPhase, EvaluationStateMachine, Readiness, TransitionCause,
    TransitionContext, TransitionResult, determine_event,
};

use std::fmt;

use jiff::Timestamp;
use serde::{Serialize, Serializer};

use crate::engine::Verdict;
use crate::policy::{DocumentError, ParamKindRef, ResolutionToken};

/// Immutable snapshot of the three documents, numbered in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    /// Strictly increasing per session, starting at 1
    pub seq: u64,
    pub policy: String,
    pub resource: String,
    pub params: String,
}

/// What the engine call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResultOutcome {
    Verdict(Verdict),
    Error { message: String },
}

impl ResultOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ResultOutcome::Error { .. })
    }

    /// Text shown in the result pane.
    pub fn display_text(&self) -> &str {
        match self {
            ResultOutcome::Verdict(verdict) => &verdict.rendered,
            ResultOutcome::Error { message } => message,
        }
    }
}

/// Answer to one [`EvaluationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub seq: u64,
    pub outcome: ResultOutcome,
    pub completed_at: Timestamp,
}

impl EvaluationResult {
    pub fn new(seq: u64, outcome: ResultOutcome) -> Self {
        Self {
            seq,
            outcome,
            completed_at: Timestamp::now(),
        }
    }
}

fn serialize_display<S: Serializer, T: fmt::Display>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// Why evaluation cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum BlockReason {
    InvalidPolicy {
        #[serde(serialize_with = "serialize_display")]
        error: DocumentError,
    },
    InvalidResource {
        #[serde(serialize_with = "serialize_display")]
        error: DocumentError,
    },
    InvalidParams {
        #[serde(serialize_with = "serialize_display")]
        error: DocumentError,
    },
    ParamsUnavailable {
        reference: ParamKindRef,
        message: String,
    },
    EngineUnavailable {
        message: String,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::InvalidPolicy { error }
            | BlockReason::InvalidResource { error }
            | BlockReason::InvalidParams { error } => write!(f, "{error}"),
            BlockReason::ParamsUnavailable { reference, message } => write!(
                f,
                "params {}/{} unavailable: {message}",
                reference.api_version, reference.kind
            ),
            BlockReason::EngineUnavailable { message } => write!(f, "{message}"),
        }
    }
}

/// Something evaluation is still waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Prerequisite {
    Engine,
    Params,
}

/// Session-level orchestration state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum OrchestratorState {
    Idle,
    AwaitingPrerequisites {
        #[serde(rename = "waitingFor")]
        waiting_for: Vec<Prerequisite>,
    },
    Evaluating {
        seq: u64,
    },
    Settled {
        result: EvaluationResult,
    },
    Blocked {
        reason: BlockReason,
    },
}

impl OrchestratorState {
    pub fn phase(&self) -> EvaluationPhase {
        match self {
            OrchestratorState::Idle => EvaluationPhase::Idle,
            OrchestratorState::AwaitingPrerequisites { .. } => EvaluationPhase::AwaitingPrerequisites,
            OrchestratorState::Evaluating { .. } => EvaluationPhase::Evaluating,
            OrchestratorState::Settled { .. } => EvaluationPhase::Settled,
            OrchestratorState::Blocked { .. } => EvaluationPhase::Blocked,
        }
    }

    /// Settled or Blocked: nothing in flight will change the state on its own.
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Settled { .. } | OrchestratorState::Blocked { .. }
        )
    }
}

/// Work the session driver must carry out on behalf of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LoadEngine,
    ResolveParams {
        token: ResolutionToken,
        reference: ParamKindRef,
    },
    Evaluate(EvaluationRequest),
}
