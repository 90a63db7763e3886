//! Process-scoped chat sessions. Nothing here outlives the process.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Turns of history considered when building chat retrieval and prompts.
pub const HISTORY_WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub human: String,
    pub assistant: String,
}

#[derive(Default)]
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.write().await.insert(id.clone(), Vec::new());
        id
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Full history of a session; unknown sessions have none.
    pub async fn history(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn append(&self, session_id: &str, turn: ConversationTurn) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
