//! Test doubles shared by the store, factory and engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::store::Metadata;
use crate::core::errors::RagError;
use crate::embedding::{EmbeddingProvider, HashingEmbedder};
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};

pub fn hashing(dimension: usize) -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingEmbedder::new(dimension).unwrap())
}

pub fn meta(value: Value) -> Metadata {
    value.as_object().cloned().unwrap_or_default()
}

/// Hashing embedder that fails any batch containing the word `POISON`.
pub struct PoisonEmbedder {
    inner: HashingEmbedder,
}

impl PoisonEmbedder {
    pub fn new(dimension: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(Self {
            inner: HashingEmbedder::new(dimension).unwrap(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for PoisonEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.iter().any(|text| text.contains("POISON")) {
            return Err(RagError::Embedding("poisoned batch".to_string()));
        }
        self.inner.encode(texts).await
    }
}

/// Maps every text to the same unit vector, so every match scores 1.0.
pub struct ConstantEmbedder {
    dimension: usize,
}

impl ConstantEmbedder {
    pub fn new(dimension: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(Self { dimension })
    }
}

#[async_trait]
impl EmbeddingProvider for ConstantEmbedder {
    fn model_name(&self) -> &str {
        "constant"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let mut unit = vec![0.0; self.dimension];
        unit[0] = 1.0;
        Ok(vec![unit; texts.len()])
    }
}

/// Hashing embedder that remembers every text it was asked to encode.
pub struct RecordingEmbedder {
    inner: HashingEmbedder,
    seen: Mutex<Vec<String>>,
}

impl RecordingEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HashingEmbedder::new(dimension).unwrap(),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for RecordingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        self.seen.lock().unwrap().extend(texts.iter().cloned());
        self.inner.encode(texts).await
    }
}

/// Generator double that replays a fixed reply (or error) and records calls.
pub struct ScriptedGenerator {
    reply: Result<String, String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(ChatRequest, String)>>,
}

impl ScriptedGenerator {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(error.to_string()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|(request, _)| request.messages.clone())
            .unwrap_or_default()
    }

    pub fn last_model(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|(_, model)| model.clone())
    }
}

#[async_trait]
impl LlmProvider for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((request, model_id.to_string()));
        self.reply.clone().map_err(RagError::Generation)
    }
}
