//! Text-to-vector providers shared by both store engines.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::config::EmbeddingConfig;
use crate::core::errors::RagError;

mod hashing;
#[cfg(feature = "local-embeddings")]
mod local;
mod remote;

pub use hashing::HashingEmbedder;
#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;
pub use remote::RemoteEmbedder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint.
    Remote,
    /// In-process model, requires the `local-embeddings` feature.
    Local,
    /// Deterministic feature hashing, no model download.
    Hashing,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Encode a batch of texts. Output order matches input order and every
    /// vector has exactly `dimension()` entries.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    async fn encode_one(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut vectors = self.encode(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Embedding("provider returned no vector".to_string()))
    }
}

/// Build the configured provider. Load failures surface as
/// [`RagError::EmbeddingModel`].
pub async fn load_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, RagError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Remote => Arc::new(RemoteEmbedder::connect(config).await?),
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedder::new(config.dimension)?),
        EmbeddingProviderKind::Local => load_local(config).await?,
    };

    tracing::info!(
        "Embedding provider ready: {} ({}d)",
        provider.model_name(),
        provider.dimension()
    );
    Ok(provider)
}

#[cfg(feature = "local-embeddings")]
async fn load_local(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, RagError> {
    Ok(Arc::new(LocalEmbedder::load(config).await?))
}

#[cfg(not(feature = "local-embeddings"))]
async fn load_local(_config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, RagError> {
    Err(RagError::EmbeddingModel(
        "local embeddings require building with the `local-embeddings` feature".to_string(),
    ))
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

pub(crate) fn check_dimensions(vectors: &[Vec<f32>], expected: usize) -> Result<(), RagError> {
    for vector in vectors {
        if vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn check_dimensions_rejects_short_vectors() {
        let err = check_dimensions(&[vec![0.0; 4], vec![0.0; 3]], 4).unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[cfg(not(feature = "local-embeddings"))]
    #[tokio::test]
    async fn local_provider_without_feature_fails_to_load() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::Local,
            ..EmbeddingConfig::default()
        };
        let err = load_provider(&config).await.err().unwrap();
        assert!(matches!(err, RagError::EmbeddingModel(_)));
    }
}
