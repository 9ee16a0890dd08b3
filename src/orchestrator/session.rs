//! Per-session driver.
//!
//! Each session is one tokio task owning an [`Orchestrator`]. Edits and
//! triggers arrive over an mpsc channel, completions of spawned work (engine
//! load, params resolution, evaluation) over a second one. Events are handled
//! one at a time, so the orchestrator never sees concurrent mutation. After
//! every event the task publishes a [`SessionView`] on a watch channel.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, error, info, warn};
use uuid::Uuid;

use super::{
    Command, Disposition, EvaluationRequest, EvaluationResult, Orchestrator, OrchestratorState,
    ResultOutcome,
};
use crate::cluster::{ClusterSource, ParamsResolver};
use crate::engine::{EngineHandle, EngineState, EvaluatorGateway, GatewayError, Verdict};
use crate::error::{self, Result};
use crate::health::HealthState;
use crate::policy::{
    ABSENT_PARAMS, DocumentKind, DocumentStore, ParamKindRef, ParamsState, ParsedPolicy,
    ResolutionToken, StoreError, sanitize_to_yaml,
};

const INPUT_BUFFER: usize = 32;

/// Process-wide collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub gateway: Arc<EvaluatorGateway>,
    pub resolver: ParamsResolver,
    pub health: Option<Arc<HealthState>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session has ended")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Policy metadata shown above the editors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadata {
    pub name: String,
    /// Validation messages joined with ", "
    pub messages: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_kind: Option<ParamKindRef>,
}

impl From<&ParsedPolicy> for PolicyMetadata {
    fn from(policy: &ParsedPolicy) -> Self {
        Self {
            name: policy.name.clone(),
            messages: policy.messages(),
            param_kind: policy.param_kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentView {
    pub text: String,
    pub dirty: bool,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamsView {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<ParamKindRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ParamsState> for ParamsView {
    fn from(state: &ParamsState) -> Self {
        let (document, error) = match state {
            ParamsState::Resolved { document, .. } => (
                Some(DocumentView {
                    text: document.text().to_string(),
                    dirty: document.is_dirty(),
                    revision: document.revision(),
                }),
                None,
            ),
            ParamsState::FetchFailed { reason, .. } => (None, Some(reason.clone())),
            ParamsState::Absent | ParamsState::Fetching { .. } => (None, None),
        };
        Self {
            state: state.name(),
            reference: state.reference().cloned(),
            document,
            error,
        }
    }
}

/// Everything a display surface needs to render a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: Uuid,
    /// `None` while the policy text does not parse
    pub metadata: Option<PolicyMetadata>,
    pub policy: DocumentView,
    pub resource: DocumentView,
    pub params: ParamsView,
    pub engine: EngineState,
    pub state: OrchestratorState,
    pub last_issued: u64,
    pub last_accepted: Option<u64>,
    /// Latest accepted result; stays visible while a newer request runs
    pub result: Option<EvaluationResult>,
}

impl SessionView {
    fn build(id: Uuid, orchestrator: &Orchestrator) -> Self {
        let store = orchestrator.store();
        let document = |d: &crate::policy::Document| DocumentView {
            text: d.text().to_string(),
            dirty: d.is_dirty(),
            revision: d.revision(),
        };
        Self {
            id,
            metadata: store.parsed_policy().ok().map(PolicyMetadata::from),
            policy: document(store.policy()),
            resource: document(store.resource()),
            params: ParamsView::from(store.params()),
            engine: orchestrator.engine_state().clone(),
            state: orchestrator.state().clone(),
            last_issued: orchestrator.last_issued(),
            last_accepted: orchestrator.last_accepted(),
            result: orchestrator.latest_result().cloned(),
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.state.is_quiescent()
    }
}

enum Input {
    Edit {
        kind: DocumentKind,
        text: String,
        reply: oneshot::Sender<std::result::Result<(), StoreError>>,
    },
    Evaluate {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    EngineLoaded(std::result::Result<EngineHandle, GatewayError>),
    ParamsFetched {
        token: ResolutionToken,
        outcome: std::result::Result<String, String>,
    },
    Evaluated(EvaluationResult),
}

/// Handle to a running session. Dropping it stops the session task.
pub struct Session {
    id: Uuid,
    inputs: mpsc::Sender<Input>,
    view: watch::Receiver<SessionView>,
    task: JoinHandle<()>,
    health: Option<Arc<HealthState>>,
}

impl Session {
    /// Spawn the session task. Must be called within a tokio runtime.
    pub fn start(ctx: SessionContext, store: DocumentStore) -> Self {
        let id = Uuid::new_v4();
        let orchestrator = Orchestrator::new(store);
        let (view_tx, view) = watch::channel(SessionView::build(id, &orchestrator));
        let (inputs, inputs_rx) = mpsc::channel(INPUT_BUFFER);
        let (completions, completions_rx) = mpsc::unbounded_channel();

        if let Some(health) = &ctx.health {
            health.metrics.session_opened();
        }
        let health = ctx.health.clone();

        let driver = Driver {
            id,
            ctx,
            orchestrator,
            engine: None,
            completions,
            view: view_tx,
        };
        let task = tokio::spawn(
            driver
                .run(inputs_rx, completions_rx)
                .instrument(debug_span!("session", session = %id)),
        );

        Self {
            id,
            inputs,
            view,
            task,
            health,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Replace the text of one document.
    pub async fn edit(
        &self,
        kind: DocumentKind,
        text: String,
    ) -> std::result::Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(Input::Edit { kind, text, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    /// Explicit evaluate trigger.
    pub async fn evaluate(&self) -> std::result::Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(Input::Evaluate { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Current view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Wait until the session is Settled or Blocked.
    pub async fn wait_quiescent(&self) -> std::result::Result<SessionView, SessionError> {
        let mut view = self.view.clone();
        let settled = view
            .wait_for(SessionView::is_quiescent)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(settled.clone())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(health) = &self.health {
            health.metrics.session_closed();
        }
    }
}

/// Fetch a policy by name, sanitize it and open a session on it.
pub async fn open_policy_session(
    ctx: &SessionContext,
    cluster: &dyn ClusterSource,
    name: &str,
    resource: Option<String>,
) -> Result<Session> {
    let object = cluster.get_policy(name).await?;
    let policy = sanitize_to_yaml(&object)?;
    let session = Session::start(ctx.clone(), DocumentStore::new(policy, resource));
    info!(session = %session.id(), policy = name, "Opened session");
    Ok(session)
}

struct Driver {
    id: Uuid,
    ctx: SessionContext,
    orchestrator: Orchestrator,
    engine: Option<EngineHandle>,
    completions: mpsc::UnboundedSender<Completion>,
    view: watch::Sender<SessionView>,
}

impl Driver {
    async fn run(
        mut self,
        mut inputs: mpsc::Receiver<Input>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let commands = self.orchestrator.start();
        self.execute(commands);
        self.publish();

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Edit { kind, text, reply }) => {
                        let outcome = self.orchestrator.edit(kind, text).map(|commands| {
                            self.execute(commands);
                        });
                        self.publish();
                        let _ = reply.send(outcome);
                    }
                    Some(Input::Evaluate { reply }) => {
                        let commands = self.orchestrator.request_evaluation();
                        self.execute(commands);
                        self.publish();
                        let _ = reply.send(());
                    }
                    None => break,
                },
                Some(completion) = completions.recv() => {
                    self.complete(completion);
                    self.publish();
                }
            }
        }
        debug!("Session ended");
    }

    fn publish(&self) {
        self.view
            .send_replace(SessionView::build(self.id, &self.orchestrator));
    }

    fn complete(&mut self, completion: Completion) {
        let commands = match completion {
            Completion::EngineLoaded(Ok(handle)) => {
                self.engine = Some(handle);
                self.orchestrator.engine_loaded()
            }
            Completion::EngineLoaded(Err(e)) => self.orchestrator.engine_failed(e.to_string()),
            Completion::ParamsFetched { token, outcome } => {
                self.orchestrator.params_fetched(token, outcome)
            }
            Completion::Evaluated(result) => {
                let seq = result.seq;
                let completed_at = result.completed_at;
                match self.orchestrator.evaluation_completed(result) {
                    Disposition::Accepted => {
                        if let Some(health) = &self.ctx.health {
                            health.touch_evaluation(completed_at);
                        }
                    }
                    Disposition::Discarded => {
                        debug!(seq, "Stale result discarded");
                        if let Some(health) = &self.ctx.health {
                            health.metrics.record_stale_result();
                        }
                    }
                }
                Vec::new()
            }
        };
        self.execute(commands);
    }

    fn execute(&self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::LoadEngine => self.load_engine(),
                Command::ResolveParams { token, reference } => self.resolve_params(token, reference),
                Command::Evaluate(request) => self.evaluate(request),
            }
        }
    }

    fn load_engine(&self) {
        let gateway = self.ctx.gateway.clone();
        let done = self.completions.clone();
        tokio::spawn(async move {
            let _ = done.send(Completion::EngineLoaded(gateway.load().await));
        });
    }

    fn resolve_params(&self, token: ResolutionToken, reference: ParamKindRef) {
        let resolver = self.ctx.resolver.clone();
        let health = self.ctx.health.clone();
        let done = self.completions.clone();
        let span = debug_span!("resolve_params", session = %self.id, token = token.0);

        tokio::spawn(
            async move {
                let outcome = match resolver.resolve(Some(&reference)).await {
                    Ok(params) => Ok(params.unwrap_or_else(|| ABSENT_PARAMS.to_string())),
                    Err(e) => {
                        warn!(error = %e, "Params resolution failed");
                        Err(e.to_string())
                    }
                };
                if let Some(health) = &health {
                    let label = if outcome.is_ok() { "resolved" } else { "failed" };
                    health.metrics.record_params_resolution(label);
                }
                let _ = done.send(Completion::ParamsFetched { token, outcome });
            }
            .instrument(span),
        );
    }

    fn evaluate(&self, request: EvaluationRequest) {
        let seq = request.seq;
        let Some(engine) = self.engine.clone() else {
            // The orchestrator only issues requests once the engine is loaded
            let err = GatewayError::EngineNotReady(self.orchestrator.engine_state().clone());
            if let Some(outcome) = evaluation_outcome(seq, Err(err.into())) {
                let result = EvaluationResult::new(seq, outcome);
                let _ = self.completions.send(Completion::Evaluated(result));
            }
            return;
        };

        let health = self.ctx.health.clone();
        let done = self.completions.clone();
        let span = debug_span!("evaluate", session = %self.id, seq);

        tokio::spawn(
            async move {
                let started = Instant::now();
                let output = engine
                    .evaluate(&request.policy, &request.resource, &request.params)
                    .await
                    .map_err(|e| GatewayError::Engine(e).into());
                let Some(outcome) = evaluation_outcome(seq, output) else {
                    return;
                };
                debug!(error = outcome.is_error(), "Evaluation finished");
                if let Some(health) = &health {
                    let label = if outcome.is_error() { "error" } else { "verdict" };
                    health
                        .metrics
                        .record_evaluation(label, started.elapsed().as_secs_f64());
                }
                let _ = done.send(Completion::Evaluated(EvaluationResult::new(seq, outcome)));
            }
            .instrument(span),
        );
    }
}

/// What a finished evaluation shows. `None` for failures that are logged
/// instead of displayed.
fn evaluation_outcome(seq: u64, output: Result<String>) -> Option<ResultOutcome> {
    match output {
        Ok(output) => Some(match Verdict::interpret(&output) {
            Ok(verdict) => ResultOutcome::Verdict(verdict),
            Err(message) => ResultOutcome::Error { message },
        }),
        Err(error::Error::EvaluationEngine(e)) => Some(ResultOutcome::Error {
            message: e.to_string(),
        }),
        Err(e) if e.is_user_visible() => Some(ResultOutcome::Error {
            message: e.to_string(),
        }),
        Err(e) => {
            error!(seq, error = %e, "Evaluation request dropped");
            None
        }
    }
}
