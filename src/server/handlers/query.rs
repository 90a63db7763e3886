use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::core::errors::ApiError;
use crate::rag::{Answer, ConversationTurn};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub answer: Answer,
}

fn require_text(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_text(&payload.query, "query")?;
    let k = payload.k.unwrap_or(state.config.rag.default_k);
    let answer = state.engine.answer(payload.query.trim(), k).await?;
    Ok(Json(answer))
}

/// One chat turn. Without a `session_id` a new session is started; the
/// turn is recorded only after an answer was produced.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_text(&payload.message, "message")?;

    let session_id = match payload.session_id {
        Some(id) if state.conversations.exists(&id).await => id,
        Some(id) => return Err(ApiError::NotFound(format!("Session {} not found", id))),
        None => state.conversations.create_session().await,
    };

    let history = state.conversations.history(&session_id).await;
    let message = payload.message.trim().to_string();
    let answer = state.engine.chat(&message, &history).await?;

    state
        .conversations
        .append(
            &session_id,
            ConversationTurn {
                human: message,
                assistant: answer.answer.clone(),
            },
        )
        .await;

    Ok(Json(ChatResponse { session_id, answer }))
}
