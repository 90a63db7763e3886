use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use super::documents::IngestRequest;
use crate::core::errors::ApiError;
use crate::state::AppState;

/// Queue ingestion in the background and return the job id immediately.
pub async fn submit_ingest(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.documents.is_empty() {
        return Err(ApiError::BadRequest("No documents provided".to_string()));
    }
    // Progress is polled through the job registry instead.
    let (job_id, _done) = state.jobs.submit_ingest(payload.documents).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"job_id": job_id, "status": "queued"})),
    ))
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .jobs
        .status(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;
    Ok(Json(record))
}
