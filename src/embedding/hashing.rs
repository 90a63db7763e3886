use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{normalize, EmbeddingProvider};
use crate::core::errors::RagError;

/// Signed feature hashing over lowercase alphanumeric tokens.
///
/// Texts sharing vocabulary land close together, which is enough for offline
/// deployments and for exercising the stores without a model.
pub struct HashingEmbedder {
    model: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self, RagError> {
        if dimension == 0 {
            return Err(RagError::EmbeddingModel(
                "hashing embedder needs a non-zero dimension".to_string(),
            ));
        }
        Ok(Self {
            model: format!("hashing-{}", dimension),
            dimension,
        })
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}
