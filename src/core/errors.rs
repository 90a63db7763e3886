use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the retrieval stack (embedding, stores, generation).
#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Config(String),

    /// The embedding model could not be loaded. Fatal to store construction.
    #[error("failed to load embedding model: {0}")]
    EmbeddingModel(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The persisted store was built by a different embedding model.
    #[error("store was built with model '{stored}' ({stored_dimension}d) but '{active}' ({active_dimension}d) is active")]
    ModelMismatch {
        stored: String,
        stored_dimension: usize,
        active: String,
        active_dimension: usize,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RagError {
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        RagError::Store(err.to_string())
    }

    pub fn snapshot<E: std::fmt::Display>(err: E) -> Self {
        RagError::Snapshot(err.to_string())
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::Store(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::InvalidInput(msg) => ApiError::BadRequest(msg),
            RagError::EmbeddingModel(_) | RagError::ModelMismatch { .. } => {
                tracing::error!("Store unavailable: {}", err);
                ApiError::ServiceUnavailable
            }
            other => ApiError::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_maps_to_bad_request() {
        let api: ApiError = RagError::InvalidInput("lengths differ".to_string()).into();
        assert!(matches!(api, ApiError::BadRequest(msg) if msg == "lengths differ"));
    }

    #[test]
    fn model_mismatch_maps_to_unavailable() {
        let api: ApiError = RagError::ModelMismatch {
            stored: "a".to_string(),
            stored_dimension: 3,
            active: "b".to_string(),
            active_dimension: 4,
        }
        .into();
        assert!(matches!(api, ApiError::ServiceUnavailable));
    }

    #[test]
    fn response_status_follows_variant() {
        let response = ApiError::NotFound("job".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
