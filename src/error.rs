//! Top-level error type.
//!
//! Collects the per-module errors with classification for how they surface.

use thiserror::Error;

use crate::cluster::{ClusterError, ParamsError};
use crate::engine::{EngineError, EngineState, GatewayError};
use crate::orchestrator::SessionError;
use crate::policy::{DocumentError, SanitizeError};

#[derive(Error, Debug)]
pub enum Error {
    /// Cluster read failed
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Policy object from the cluster could not be sanitized
    #[error(transparent)]
    MalformedSource(#[from] SanitizeError),

    /// Document text does not parse
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Params object could not be resolved
    #[error("Params resolution failed: {0}")]
    ParamsResolution(#[from] ParamsError),

    /// Evaluation engine failed to load
    #[error("Evaluation engine failed to load: {0}")]
    EngineLoad(EngineError),

    /// Evaluation requested before the engine was ready
    #[error("Evaluation engine not ready (state: {0})")]
    EngineNotReady(EngineState),

    /// Engine failed on a given input
    #[error("Evaluation failed: {0}")]
    EvaluationEngine(EngineError),

    /// Session task is gone or rejected an edit
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Local file access
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GatewayError> for Error {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::LoadFailed(e) => Error::EngineLoad(e),
            GatewayError::EngineNotReady(state) => Error::EngineNotReady(state),
            GatewayError::Engine(e) => Error::EvaluationEngine(e),
        }
    }
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Cluster(e) => e.is_not_found(),
            Error::ParamsResolution(ParamsError::Cluster { source, .. }) => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the error is meant to be shown to the user.
    ///
    /// `EngineNotReady` means a caller skipped the orchestrator's sequencing;
    /// it is logged, never displayed.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Error::EngineNotReady(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
