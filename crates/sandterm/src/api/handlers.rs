//! REST handlers for session and sandbox administration.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::container::ContainerRecord;
use crate::session::{Discovery, Session};
use crate::telemetry::SystemSnapshot;

use super::error::{ApiError, ApiResult};
use super::identity::UserIdentity;
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
    pub attached: usize,
    pub uptime_seconds: u64,
}

/// Health check endpoint (public).
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.engine.registry().len(),
        attached: state.engine.bridge().attached_count(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// List the caller's sessions.
#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: UserIdentity,
) -> Json<Vec<Session>> {
    let mut sessions = state.engine.sessions().list_for_user(user.id());
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(sessions)
}

/// Look up a session owned by the caller. Other users' sessions read as
/// not found.
fn owned_session(state: &AppState, user: &UserIdentity, session_id: &str) -> ApiResult<Session> {
    state
        .engine
        .sessions()
        .get(session_id)
        .filter(|s| s.user_id == user.id())
        .ok_or_else(|| ApiError::not_found(format!("session {session_id}")))
}

/// Get one of the caller's sessions.
#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn get_session(
    State(state): State<AppState>,
    user: UserIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    owned_session(&state, &user, &session_id).map(Json)
}

/// Close one of the caller's sessions and stop its sandbox.
#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn delete_session(
    State(state): State<AppState>,
    user: UserIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_session(&state, &user, &session_id)?;
    if !state.engine.sessions().close_session(&session_id).await {
        return Err(ApiError::not_found(format!("session {session_id}")));
    }
    info!(session_id = %session_id, "session closed via API");
    Ok(StatusCode::NO_CONTENT)
}

/// Sandboxes on the runtime, split into tracked and orphaned.
#[instrument(skip(state, _user))]
pub async fn list_sandboxes(
    State(state): State<AppState>,
    _user: UserIdentity,
) -> ApiResult<Json<Discovery>> {
    let discovery = state.engine.manager().discover_sandboxes().await?;
    Ok(Json(discovery))
}

/// Stop an orphaned sandbox container.
#[instrument(skip(state), fields(user_id = %user.id()))]
pub async fn terminate_orphan(
    State(state): State<AppState>,
    user: UserIdentity,
    Path(container_id): Path<String>,
) -> ApiResult<Json<ContainerRecord>> {
    let record = state.engine.manager().terminate_orphan(&container_id).await?;
    info!(container = %record.name, "orphan terminated via API");
    Ok(Json(record))
}

/// Latest resource snapshot.
pub async fn telemetry(
    State(state): State<AppState>,
    _user: UserIdentity,
) -> Json<SystemSnapshot> {
    Json(state.engine.telemetry().snapshot())
}
