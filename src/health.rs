//! Probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the evaluation engine is loaded)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::engine::EngineState;

/// Labels for outcome-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

/// Shared metrics for the playground
pub struct Metrics {
    /// Evaluations completed, by outcome (`verdict` or `error`)
    pub evaluations_total: Family<OutcomeLabels, Counter>,
    /// Results that arrived after a newer request was issued
    pub stale_results_total: Counter,
    /// Engine call duration histogram
    pub evaluation_duration_seconds: Histogram,
    /// Params resolutions, by outcome (`resolved` or `failed`)
    pub params_resolutions_total: Family<OutcomeLabels, Counter>,
    /// Sessions currently open
    pub active_sessions: Gauge,
    /// Unix time of the last accepted evaluation
    pub last_evaluation_timestamp_seconds: Gauge,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let evaluations_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "vap_playground_evaluations",
            "Total number of completed evaluations",
            evaluations_total.clone(),
        );

        let stale_results_total = Counter::default();
        registry.register(
            "vap_playground_stale_results",
            "Total number of evaluation results discarded as stale",
            stale_results_total.clone(),
        );

        let evaluation_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "vap_playground_evaluation_duration_seconds",
            "Duration of engine evaluations in seconds",
            evaluation_duration_seconds.clone(),
        );

        let params_resolutions_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "vap_playground_params_resolutions",
            "Total number of params object resolutions",
            params_resolutions_total.clone(),
        );

        let active_sessions = Gauge::default();
        registry.register(
            "vap_playground_active_sessions",
            "Number of open playground sessions",
            active_sessions.clone(),
        );

        let last_evaluation_timestamp_seconds = Gauge::default();
        registry.register(
            "vap_playground_last_evaluation_timestamp_seconds",
            "Unix time of the last accepted evaluation result",
            last_evaluation_timestamp_seconds.clone(),
        );

        Self {
            evaluations_total,
            stale_results_total,
            evaluation_duration_seconds,
            params_resolutions_total,
            active_sessions,
            last_evaluation_timestamp_seconds,
            registry,
        }
    }

    /// Record a completed evaluation
    pub fn record_evaluation(&self, outcome: &str, duration_secs: f64) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.evaluations_total.get_or_create(&labels).inc();
        self.evaluation_duration_seconds.observe(duration_secs);
    }

    /// Record a result dropped by the freshness rule
    pub fn record_stale_result(&self) {
        self.stale_results_total.inc();
    }

    /// Record a params resolution
    pub fn record_params_resolution(&self, outcome: &str) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.params_resolutions_total.get_or_create(&labels).inc();
    }

    pub fn session_opened(&self) {
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the probes
pub struct HealthState {
    /// Whether the evaluation engine is loaded
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the service as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the service is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember when a result was last accepted
    pub fn touch_evaluation(&self, at: jiff::Timestamp) {
        self.metrics
            .last_evaluation_timestamp_seconds
            .set(at.as_second());
    }
}

/// Keep readiness in step with the engine state: ready exactly while the
/// engine is loaded.
pub fn spawn_readiness_tracker(
    state: Arc<HealthState>,
    mut engine: watch::Receiver<EngineState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let ready = *engine.borrow_and_update() == EngineState::Ready;
            state.set_ready(ready).await;
            if engine.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the engine is loaded.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the probe and metrics router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
