//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::engine::{EvaluationEngine, ProcessEngine};

/// Evaluator executable looked up on `PATH` when none is configured
pub const DEFAULT_ENGINE_COMMAND: &str = "vap-evaluator";

/// Interactive ValidatingAdmissionPolicy playground
#[derive(Debug, Parser)]
#[command(name = "vap-playground", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the playground HTTP API
    Serve(ServeArgs),
    /// List ValidatingAdmissionPolicies in the cluster
    List,
    /// Evaluate a policy once and print the verdict
    Eval(EvalArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address the HTTP API listens on
    #[arg(long, env = "VAP_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Minutes a session may go unused before it is closed
    #[arg(long, env = "VAP_SESSION_IDLE_MINUTES", default_value_t = 30)]
    pub session_idle_minutes: u64,

    #[command(flatten)]
    pub engine: EngineArgs,
}

impl ServeArgs {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_minutes * 60)
    }
}

#[derive(Debug, Clone, Args)]
pub struct EvalArgs {
    /// Name of the policy to evaluate
    #[arg(long)]
    pub policy: String,

    /// Resource YAML file; defaults to a sample Deployment
    #[arg(long)]
    pub resource: Option<PathBuf>,

    /// Params YAML file replacing the object resolved from the cluster
    #[arg(long)]
    pub params: Option<PathBuf>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Evaluator executable
    #[arg(long = "engine-command", env = "VAP_ENGINE_COMMAND", default_value = DEFAULT_ENGINE_COMMAND)]
    pub command: PathBuf,

    /// Extra arguments passed to the evaluator
    #[arg(
        long = "engine-args",
        env = "VAP_ENGINE_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub args: Vec<String>,

    /// Seconds a single evaluation may take
    #[arg(long = "engine-timeout-secs", env = "VAP_ENGINE_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,
}

impl EngineArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build the process-backed engine these arguments describe.
    pub fn build_engine(&self) -> Arc<dyn EvaluationEngine> {
        Arc::new(ProcessEngine::new(
            self.command.clone(),
            self.args.iter().filter(|a| !a.is_empty()).cloned().collect(),
            self.timeout(),
        ))
    }
}
