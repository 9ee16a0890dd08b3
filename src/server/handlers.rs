//! HTTP handlers for policies and sessions.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::AppState;
use super::error::ApiError;
use crate::cluster::PolicySummary;
use crate::orchestrator::{PolicyMetadata, SessionView, open_policy_session};
use crate::policy::{DocumentKind, ParsedPolicy, sanitize};

/// Body of `POST /api/sessions`
#[derive(Debug, Deserialize)]
pub struct CreateSession {
    /// Policy name in the cluster
    pub policy: String,
    /// Resource YAML; the sample Deployment when absent
    #[serde(default)]
    pub resource: Option<String>,
}

pub(super) async fn list_policies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PolicySummary>>, ApiError> {
    let policies = state
        .cluster
        .list_policies()
        .await
        .map_err(crate::Error::from)?;
    let summaries: Vec<_> = policies.iter().filter_map(PolicySummary::from_object).collect();
    debug!(count = summaries.len(), "Listed policies");
    Ok(Json(summaries))
}

#[instrument(skip(state))]
pub(super) async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<PolicyMetadata>, ApiError> {
    let object = state
        .cluster
        .get_policy(&name)
        .await
        .map_err(crate::Error::from)?;
    let cleaned = sanitize(&object).map_err(crate::Error::from)?;
    let parsed = ParsedPolicy::from_object(&cleaned).map_err(crate::Error::from)?;
    Ok(Json(PolicyMetadata::from(&parsed)))
}

#[instrument(skip(state, body), fields(policy = %body.policy))]
pub(super) async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSession>,
) -> Result<impl IntoResponse, ApiError> {
    let session = open_policy_session(
        &state.context,
        state.cluster.as_ref(),
        &body.policy,
        body.resource,
    )
    .await?;
    let view = session.view();
    state.insert_session(session).await;
    Ok((StatusCode::CREATED, Json(view)))
}

pub(super) async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state.session(id).await.ok_or_else(|| not_found(id))?;
    Ok(Json(session.view()))
}

pub(super) async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.remove_session(id).await {
        info!(session = %id, "Closed session");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}

#[instrument(skip(state, text))]
pub(super) async fn put_document(
    State(state): State<Arc<AppState>>,
    Path((id, kind)): Path<(Uuid, DocumentKind)>,
    text: String,
) -> Result<Json<SessionView>, ApiError> {
    let session = state.session(id).await.ok_or_else(|| not_found(id))?;
    session.edit(kind, text).await?;
    Ok(Json(session.view()))
}

pub(super) async fn trigger_evaluation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state.session(id).await.ok_or_else(|| not_found(id))?;
    session.evaluate().await?;
    Ok(Json(session.view()))
}

fn not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("session {id}"))
}
