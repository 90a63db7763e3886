use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let factory = state.engine.factory();
    Json(json!({
        "status": "ok",
        "store": factory.kind(),
        "generation": factory.generation()
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.engine.stats().await?;
    Ok(Json(stats))
}
