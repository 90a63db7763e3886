use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::{check_dimensions, EmbeddingProvider};
use crate::core::config::EmbeddingConfig;
use crate::core::errors::RagError;

/// In-process sentence embedder backed by fastembed's ONNX models.
pub struct LocalEmbedder {
    model_name: String,
    dimension: usize,
    model: Arc<Mutex<TextEmbedding>>,
}

impl LocalEmbedder {
    pub async fn load(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let model_name = config.model.clone();
        let model_kind = parse_model(&model_name)?;
        let show_progress = config.show_download_progress;

        let (model, dimension) = tokio::task::spawn_blocking(move || {
            let mut text_model = TextEmbedding::try_new(
                InitOptions::new(model_kind).with_show_download_progress(show_progress),
            )
            .map_err(|err| RagError::EmbeddingModel(err.to_string()))?;

            let probe = text_model
                .embed(vec!["dimension probe"], None)
                .map_err(|err| RagError::EmbeddingModel(err.to_string()))?;
            let dimension = probe.first().map(Vec::len).unwrap_or(0);
            Ok::<_, RagError>((text_model, dimension))
        })
        .await
        .map_err(|err| RagError::EmbeddingModel(err.to_string()))??;

        if dimension == 0 {
            return Err(RagError::EmbeddingModel(format!(
                "{} produced an empty embedding",
                model_name
            )));
        }

        Ok(Self {
            model_name,
            dimension,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn parse_model(name: &str) -> Result<EmbeddingModel, RagError> {
    let short = name.rsplit('/').next().unwrap_or(name).to_lowercase();
    match short.as_str() {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l12-v2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
        _ => Err(RagError::EmbeddingModel(format!(
            "unsupported local embedding model '{}'",
            name
        ))),
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let inputs = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| RagError::Embedding("embedding model lock poisoned".to_string()))?;
            guard
                .embed(inputs, None)
                .map_err(|err| RagError::Embedding(err.to_string()))
        })
        .await
        .map_err(|err| RagError::Embedding(err.to_string()))??;

        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_map_with_or_without_org_prefix() {
        assert!(matches!(
            parse_model("sentence-transformers/all-MiniLM-L6-v2"),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_model("BAAI/bge-small-en-v1.5"),
            Ok(EmbeddingModel::BGESmallENV15)
        ));
        assert!(parse_model("unknown/model").is_err());
    }

    #[tokio::test]
    #[ignore = "downloads the model"]
    async fn loads_default_model() {
        let embedder = LocalEmbedder::load(&EmbeddingConfig::default()).await.unwrap();
        assert_eq!(embedder.dimension(), 384);
    }
}
