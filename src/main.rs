//! vap-playground - interactive ValidatingAdmissionPolicy evaluation.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Runs the HTTP API, or a one-shot `list` / `eval` command

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};

use vap_playground::cli::{evaluate_once, format_policy_table, list_policies, read_document};
use vap_playground::cluster::{ClusterSource, KubeClusterSource, ParamsResolver};
use vap_playground::config::{Cli, Commands, EngineArgs, EvalArgs, ServeArgs};
use vap_playground::engine::EvaluatorGateway;
use vap_playground::health::{HealthState, spawn_readiness_tracker};
use vap_playground::orchestrator::{OrchestratorState, SessionContext};
use vap_playground::server::{AppState, run_server};

/// Grace period for in-flight requests to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("vap_playground=info".parse()?)
        .add_directive("kube=info".parse()?);
    match cli.command {
        Commands::Serve(_) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .init(),
    }

    let client = Client::try_default().await?;
    let cluster: Arc<dyn ClusterSource> = Arc::new(KubeClusterSource::new(client));

    match cli.command {
        Commands::Serve(args) => serve(args, cluster).await,
        Commands::List => {
            let policies = list_policies(cluster.as_ref()).await?;
            print!("{}", format_policy_table(&policies));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Eval(args) => eval(args, cluster).await,
    }
}

fn session_context(
    engine: &EngineArgs,
    cluster: Arc<dyn ClusterSource>,
    health: Option<Arc<HealthState>>,
) -> SessionContext {
    SessionContext {
        gateway: Arc::new(EvaluatorGateway::new(engine.build_engine())),
        resolver: ParamsResolver::new(cluster),
        health,
    }
}

async fn serve(
    args: ServeArgs,
    cluster: Arc<dyn ClusterSource>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    info!("Starting vap-playground");

    let health_state = Arc::new(HealthState::new());
    let context = session_context(&args.engine, cluster.clone(), Some(health_state.clone()));

    // Load the engine up front so readiness reflects it
    let readiness = spawn_readiness_tracker(health_state.clone(), context.gateway.subscribe());
    let loader = {
        let gateway = context.gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.load().await {
                warn!(error = %e, "Evaluation engine unavailable, sessions will be blocked");
            }
        })
    };

    let state = Arc::new(
        AppState::new(cluster, context, health_state.clone())
            .with_session_idle_timeout(args.session_idle_timeout()),
    );
    let server = tokio::spawn(run_server(args.listen, state, async {
        shutdown_signal().await;
        info!("Received shutdown signal, initiating graceful shutdown...");
    }));

    let served = server.await;
    readiness.abort();
    match served {
        Ok(Ok(())) => {
            health_state.set_ready(false).await;
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
        Ok(Err(e)) => {
            error!("API server error: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            error!("API server task panicked: {}", e);
            return Err(e.into());
        }
    }
    loader.abort();

    info!("vap-playground stopped");
    Ok(ExitCode::SUCCESS)
}

async fn eval(
    args: EvalArgs,
    cluster: Arc<dyn ClusterSource>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let resource = match &args.resource {
        Some(path) => Some(read_document(path).await?),
        None => None,
    };
    let params = match &args.params {
        Some(path) => Some(read_document(path).await?),
        None => None,
    };

    let context = session_context(&args.engine, cluster.clone(), None);
    let view = evaluate_once(&context, cluster.as_ref(), &args.policy, resource, params).await?;

    match &view.state {
        OrchestratorState::Settled { result } => {
            print!("{}", result.outcome.display_text());
            if result.outcome.is_error() {
                Ok(ExitCode::from(1))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        OrchestratorState::Blocked { reason } => {
            eprintln!("evaluation blocked: {reason}");
            Ok(ExitCode::from(2))
        }
        other => {
            eprintln!("evaluation did not settle: {:?}", other.phase());
            Ok(ExitCode::from(2))
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; the process cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
