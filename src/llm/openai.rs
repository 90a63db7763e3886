use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::provider::LlmProvider;
use super::types::ChatRequest;
use crate::core::config::LlmConfig;
use crate::core::errors::RagError;

/// Some routers answer 529 when every upstream replica is saturated.
const STATUS_OVERLOADED: u16 = 529;

/// Client for OpenAI-compatible `POST {base_url}/chat/completions` endpoints,
/// such as the Hugging Face inference router.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(&config.base_url, config.api_key.clone())
    }
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    if status.as_u16() == STATUS_OVERLOADED || body.to_lowercase().contains("overloaded") {
        format!("provider overloaded ({}): {}", status, body)
    } else {
        format!("provider returned {}: {}", status, body)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, RagError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = json!({
            "model": model_id,
            "messages": request.messages,
            "stream": false,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature {
                obj.insert("temperature".to_string(), json!(t));
            }
            if let Some(t) = request.max_tokens {
                obj.insert("max_tokens".to_string(), json!(t));
            }
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req
            .send()
            .await
            .map_err(|err| RagError::Generation(err.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(RagError::Generation(describe_failure(status, &text)));
        }

        let payload: CompletionResponse = res
            .json()
            .await
            .map_err(|err| RagError::Generation(err.to_string()))?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::is_overloaded;

    #[test]
    fn overload_status_is_recognised() {
        let message = describe_failure(StatusCode::from_u16(529).unwrap(), "busy");
        assert!(is_overloaded(&RagError::Generation(message)));

        let message = describe_failure(StatusCode::SERVICE_UNAVAILABLE, "Model is Overloaded");
        assert!(is_overloaded(&RagError::Generation(message)));

        let message = describe_failure(StatusCode::UNAUTHORIZED, "bad token");
        assert!(!is_overloaded(&RagError::Generation(message)));
    }

    #[test]
    fn completion_payload_without_content_is_empty() {
        let payload: CompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(payload.choices[0].message.content.is_none());
    }
}
