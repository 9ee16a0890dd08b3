//! HTTP API of the playground.
//!
//! Sessions live in memory until deleted or left unused for the idle timeout.
//! Probe and metrics routes from [`crate::health`] are served on the same
//! listener.

pub mod error;
mod handlers;

pub use error::ApiError;
pub use handlers::CreateSession;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post, put},
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cluster::ClusterSource;
use crate::health::{self, HealthState};
use crate::orchestrator::{Session, SessionContext};

/// Sessions unused for this long are closed
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct SessionEntry {
    session: Arc<Session>,
    last_seen: Instant,
}

/// Shared state for API handlers
pub struct AppState {
    pub cluster: Arc<dyn ClusterSource>,
    pub context: SessionContext,
    pub health: Arc<HealthState>,
    session_idle_timeout: Duration,
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

impl AppState {
    pub fn new(
        cluster: Arc<dyn ClusterSource>,
        context: SessionContext,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            cluster,
            context,
            health,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn insert_session(&self, session: Session) {
        let entry = SessionEntry {
            session: Arc::new(session),
            last_seen: Instant::now(),
        };
        self.sessions.write().await.insert(entry.session.id(), entry);
    }

    /// Look up a session and mark it as used. The lock is released on return.
    async fn session(&self, id: Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id)?;
        entry.last_seen = Instant::now();
        Some(entry.session.clone())
    }

    async fn remove_session(&self, id: Uuid) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    /// Close sessions unused for longer than the idle timeout.
    pub async fn expire_idle_sessions(&self) -> usize {
        let timeout = self.session_idle_timeout;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let keep = entry.last_seen.elapsed() <= timeout;
            if !keep {
                info!(session = %id, "Closing idle session");
            }
            keep
        });
        before - sessions.len()
    }
}

/// Periodically close idle sessions.
pub fn spawn_session_reaper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = (state.session_idle_timeout / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = state.expire_idle_sessions().await;
            if expired > 0 {
                debug!(expired, "Expired idle sessions");
            }
        }
    })
}

/// Create the API router, including probe and metrics routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let health = state.health.clone();
    Router::new()
        .route("/api/policies", get(handlers::list_policies))
        .route("/api/policies/{name}", get(handlers::get_policy))
        .route("/api/sessions", post(handlers::create_session))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/api/sessions/{id}/documents/{kind}",
            put(handlers::put_document),
        )
        .route(
            "/api/sessions/{id}/evaluate",
            post(handlers::trigger_evaluation),
        )
        .with_state(state)
        .merge(health::create_router(health))
}

/// Serve the API until `shutdown` resolves
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let reaper = spawn_session_reaper(state.clone());
    let app = create_router(state);

    info!(%addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    reaper.abort();

    served
}
