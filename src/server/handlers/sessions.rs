use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.conversations.exists(&session_id).await {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }
    let turns = state.conversations.history(&session_id).await;
    Ok(Json(json!({"session_id": session_id, "turns": turns})))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.conversations.remove(&session_id).await {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }
    Ok(Json(json!({"status": "deleted"})))
}
