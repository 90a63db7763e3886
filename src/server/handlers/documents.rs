use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::rag::chunker::documents_from_text;
use crate::rag::DocumentRecord;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub documents: Vec<DocumentRecord>,
}

#[derive(Debug, Deserialize)]
pub struct IngestTextRequest {
    pub filename: String,
    pub text: String,
    #[serde(default)]
    pub file_type: Option<String>,
}

pub async fn add_documents(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.documents.is_empty() {
        return Err(ApiError::BadRequest("No documents provided".to_string()));
    }
    let report = state.engine.add_documents(payload.documents).await?;
    Ok(Json(report))
}

pub async fn add_text(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IngestTextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let records = documents_from_text(
        &payload.filename,
        payload.file_type.as_deref(),
        &payload.text,
        &state.config.chunking,
    );
    if records.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "No text content in {}",
            payload.filename
        )));
    }

    let chunks = records.len();
    tracing::info!("Ingesting {} chunks from {}", chunks, payload.filename);
    let report = state.engine.add_documents(records).await?;
    Ok(Json(json!({
        "filename": payload.filename,
        "chunks": chunks,
        "report": report
    })))
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let documents = state.engine.all_documents().await?;
    Ok(Json(json!({
        "total": documents.len(),
        "documents": documents
    })))
}

pub async fn clear_store(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.engine.clear().await?;
    Ok(Json(json!({
        "status": "cleared",
        "generation": state.engine.factory().generation()
    })))
}
