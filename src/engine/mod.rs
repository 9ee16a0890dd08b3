//! Evaluation engine boundary.
//!
//! The engine that understands policy expressions lives outside this crate.
//! It is loaded once per process and then called with three opaque text
//! payloads (policy, resource, params), answering with one text payload.
//!
//! - `gateway`: process-wide engine lifecycle and the handle sessions evaluate through
//! - `process`: engine implemented by an external evaluator executable
//! - `verdict`: interpretation and rendering of engine output

pub mod gateway;
pub mod process;
pub mod verdict;

pub use gateway::{EngineHandle, EngineState, EvaluatorGateway, GatewayError};
pub use process::ProcessEngine;
pub use verdict::{EvalEntry, EvaluationResults, Verdict};

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

/// Errors raised by an engine implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be initialized
    #[error("engine failed to load: {0}")]
    Load(String),

    /// The engine rejected or failed on the given input
    #[error("{0}")]
    Evaluation(String),

    /// The engine did not answer in time
    #[error("engine timed out after {0:?}")]
    Timeout(Duration),

    /// Talking to the engine failed
    #[error("engine I/O error: {0}")]
    Io(String),
}

/// An external policy evaluation engine.
pub trait EvaluationEngine: Send + Sync {
    /// Initialize the engine. Called at most once per process by the gateway.
    fn load(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Evaluate a policy against a resource and params object.
    fn evaluate<'a>(
        &'a self,
        policy: &'a str,
        resource: &'a str,
        params: &'a str,
    ) -> BoxFuture<'a, Result<String, EngineError>>;
}
