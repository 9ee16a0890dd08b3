//! Process-wide lifecycle of the evaluation engine.
//!
//! `EngineState` moves NotLoaded -> Loading -> Ready | LoadFailed exactly once.
//! The outcome of the first load is memoised; every later `load()` returns it
//! without touching the engine again. A successful load hands out an
//! [`EngineHandle`], which is the only way sessions reach the engine.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OnceCell, watch};
use tracing::{error, info, instrument};

use super::{EngineError, EvaluationEngine};

/// Lifecycle of the evaluation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum EngineState {
    NotLoaded,
    Loading,
    Ready,
    LoadFailed(String),
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::NotLoaded => write!(f, "NotLoaded"),
            EngineState::Loading => write!(f, "Loading"),
            EngineState::Ready => write!(f, "Ready"),
            EngineState::LoadFailed(_) => write!(f, "LoadFailed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The engine failed to load; evaluation is unavailable for this process
    #[error("evaluation engine unavailable: {0}")]
    LoadFailed(EngineError),

    /// `evaluate` was called before the engine was ready
    #[error("evaluation engine is not ready (state: {0})")]
    EngineNotReady(EngineState),

    /// The engine failed on a given input
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Capability to call a loaded engine.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn EvaluationEngine>,
}

impl EngineHandle {
    /// Evaluate three opaque documents.
    pub async fn evaluate(
        &self,
        policy: &str,
        resource: &str,
        params: &str,
    ) -> Result<String, EngineError> {
        self.engine.evaluate(policy, resource, params).await
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

/// Owns the engine and its lifecycle state.
pub struct EvaluatorGateway {
    engine: Arc<dyn EvaluationEngine>,
    state: watch::Sender<EngineState>,
    loaded: OnceCell<Result<(), EngineError>>,
}

impl EvaluatorGateway {
    pub fn new(engine: Arc<dyn EvaluationEngine>) -> Self {
        let (state, _) = watch::channel(EngineState::NotLoaded);
        Self {
            engine,
            state,
            loaded: OnceCell::new(),
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Watch engine state changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Load the engine, or return the outcome of the load already done.
    ///
    /// Concurrent callers share a single load.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<EngineHandle, GatewayError> {
        let outcome = self
            .loaded
            .get_or_init(|| async {
                self.state.send_replace(EngineState::Loading);
                info!("Loading evaluation engine");
                match self.engine.load().await {
                    Ok(()) => {
                        self.state.send_replace(EngineState::Ready);
                        info!("Evaluation engine ready");
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "Evaluation engine failed to load");
                        self.state.send_replace(EngineState::LoadFailed(e.to_string()));
                        Err(e)
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => Ok(EngineHandle {
                engine: self.engine.clone(),
            }),
            Err(e) => Err(GatewayError::LoadFailed(e.clone())),
        }
    }

    /// Evaluate through the gateway. Fails fast unless the engine is ready.
    pub async fn evaluate(
        &self,
        policy: &str,
        resource: &str,
        params: &str,
    ) -> Result<String, GatewayError> {
        let state = self.state();
        if state != EngineState::Ready {
            return Err(GatewayError::EngineNotReady(state));
        }
        Ok(self.engine.evaluate(policy, resource, params).await?)
    }
}
