//! VectorStore trait, the common interface over both storage engines.
//!
//! Engines embed their own inputs through the shared [`EmbeddingProvider`],
//! so callers only deal in text and metadata.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::RagError;
use crate::embedding::EmbeddingProvider;

/// Flat attribution metadata attached to every chunk.
pub type Metadata = Map<String, Value>;

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Embedded SQLite database, durable on every write.
    Sqlite,
    /// In-memory flat index persisted as an explicit snapshot.
    Flat,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Sqlite => "sqlite",
            StoreKind::Flat => "flat",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub document: String,
    pub metadata: Metadata,
    /// Similarity in `[0, 1]`, higher is closer.
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_documents: usize,
    pub index_size: usize,
    pub dimension: usize,
    pub model: String,
    #[serde(rename = "type")]
    pub kind: StoreKind,
}

/// Outcome of one `add_documents` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReport {
    pub requested: usize,
    pub added: usize,
    pub skipped_batches: usize,
    pub dropped_empty: usize,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Embed and insert chunks in batches. A failing batch is logged and
    /// skipped; the call only errors on invalid input.
    async fn add_documents(
        &self,
        contents: Vec<String>,
        metadatas: Vec<Metadata>,
    ) -> Result<AddReport, RagError>;

    /// Up to `k` results by descending score. Empty stores return nothing.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RagError>;

    async fn save(&self) -> Result<(), RagError>;

    async fn load(&self) -> Result<(), RagError>;

    /// Every chunk in insertion order. Costs O(corpus).
    async fn get_all_documents(&self) -> Result<Vec<DocumentRecord>, RagError>;

    async fn get_stats(&self) -> Result<StoreStats, RagError>;

    /// Destroy all persisted and in-memory state.
    async fn wipe(&self) -> Result<(), RagError>;
}

/// Chunks accepted for insertion after validation.
pub(crate) struct PreparedBatch {
    pub items: Vec<(String, Metadata)>,
    pub dropped_empty: usize,
}

/// Pair contents with metadata, rejecting length mismatches and nested
/// metadata values. Blank contents are dropped together with their metadata.
pub(crate) fn prepare_batch(
    contents: Vec<String>,
    metadatas: Vec<Metadata>,
) -> Result<PreparedBatch, RagError> {
    if contents.len() != metadatas.len() {
        return Err(RagError::InvalidInput(format!(
            "got {} contents but {} metadata records",
            contents.len(),
            metadatas.len()
        )));
    }
    for metadata in &metadatas {
        validate_metadata(metadata)?;
    }

    let mut items = Vec::with_capacity(contents.len());
    let mut dropped_empty = 0;
    for (content, metadata) in contents.into_iter().zip(metadatas) {
        if content.trim().is_empty() {
            dropped_empty += 1;
            continue;
        }
        items.push((content, metadata));
    }
    if dropped_empty > 0 {
        tracing::warn!("Dropped {} empty chunk(s) before indexing", dropped_empty);
    }

    Ok(PreparedBatch {
        items,
        dropped_empty,
    })
}

fn validate_metadata(metadata: &Metadata) -> Result<(), RagError> {
    for (key, value) in metadata {
        if value.is_object() || value.is_array() {
            return Err(RagError::InvalidInput(format!(
                "metadata '{}' must be a scalar value",
                key
            )));
        }
    }
    Ok(())
}

/// Embed `texts` and check the result against the provider's dimension.
pub(crate) async fn embed_batch(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, RagError> {
    let vectors = embedder.encode(texts).await?;
    if vectors.len() != texts.len() {
        return Err(RagError::Embedding(format!(
            "expected {} vectors, got {}",
            texts.len(),
            vectors.len()
        )));
    }
    crate::embedding::check_dimensions(&vectors, embedder.dimension())?;
    Ok(vectors)
}

/// Map a raw similarity onto `[0, 1]`. NaN collapses to 0.
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Convert a cosine distance into a similarity score.
pub fn similarity_from_distance(distance: f32) -> f32 {
    clamp_score(1.0 - distance)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Stable descending sort by score, cut to `k`.
pub(crate) fn rank(results: &mut Vec<RetrievalResult>, k: usize) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(k);
}
