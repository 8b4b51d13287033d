// handlers/sessions.rs

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::instrument;

use crate::services::session_registry::SessionInfo;
use crate::types::AppState;

#[instrument(skip_all)]
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.sessions().await)
}

#[instrument(skip_all)]
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get_dash_unit(&id) {
        Some(unit) => Json(unit.info().await).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
