use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{check_dimensions, EmbeddingProvider};
use crate::core::config::EmbeddingConfig;
use crate::core::errors::RagError;

/// Client for an OpenAI-compatible `POST {base_url}/embeddings` endpoint.
pub struct RemoteEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    client: Client,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    /// Probe the endpoint once to learn the output dimension. A failed probe
    /// means the model is unavailable and is reported as such.
    pub async fn connect(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let mut embedder = Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            dimension: 0,
            client: Client::new(),
        };

        let probe = embedder
            .request(&["dimension probe".to_string()])
            .await
            .map_err(|err| {
                RagError::EmbeddingModel(format!("{} at {}: {}", embedder.model, embedder.base_url, err))
            })?;
        let dimension = probe.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(RagError::EmbeddingModel(format!(
                "{} returned an empty embedding",
                embedder.model
            )));
        }
        embedder.dimension = dimension;
        Ok(embedder)
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": inputs,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request
            .send()
            .await
            .map_err(|err| RagError::Embedding(err.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "embedding endpoint returned {}: {}",
                status, text
            )));
        }

        let payload: EmbeddingsResponse = res
            .json()
            .await
            .map_err(|err| RagError::Embedding(err.to_string()))?;
        if payload.data.len() != inputs.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                payload.data.len()
            )));
        }

        Ok(order_by_index(payload.data))
    }
}

fn order_by_index(mut items: Vec<EmbeddingItem>) -> Vec<Vec<f32>> {
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index);
    }
    items.into_iter().map(|item| item.embedding).collect()
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(texts).await?;
        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_items_follow_their_index() {
        let payload: EmbeddingsResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[0.5,0.5]},{"index":0,"embedding":[1.0,0.0]}]}"#,
        )
        .unwrap();

        let ordered = order_by_index(payload.data);
        assert_eq!(ordered, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_model_error() {
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = RemoteEmbedder::connect(&config).await.err().unwrap();
        assert!(matches!(err, RagError::EmbeddingModel(_)));
    }
}
