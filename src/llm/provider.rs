use async_trait::async_trait;

use super::types::ChatRequest;
use crate::core::errors::RagError;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// provider name used in logs
    fn name(&self) -> &str;

    /// chat completion (non-streaming); returns the assistant text
    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, RagError>;
}

/// Whether a generation error means the provider is shedding load.
pub fn is_overloaded(err: &RagError) -> bool {
    err.to_string().to_lowercase().contains("overloaded")
}
