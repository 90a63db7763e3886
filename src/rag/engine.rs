//! Retrieval-augmented answering over the shared vector store.
//!
//! The engine asks the [`StoreFactory`] for the store on every call, so a
//! reset performed anywhere is picked up by the next operation. Generation
//! failures never escape: callers always receive a well-formed [`Answer`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context_builder::{
    build_chat_messages, build_retrieval_query, calculate_confidence, create_prompt,
    prepare_context, preview, ContextSettings,
};
use super::conversation::ConversationTurn;
use super::factory::StoreFactory;
use super::store::{AddReport, DocumentRecord, Metadata, RetrievalResult, StoreStats, VectorStore};
use crate::core::errors::RagError;
use crate::llm::{is_overloaded, ChatMessage, ChatRequest, LlmProvider};

pub const NO_INFORMATION_ANSWER: &str = "I don't have enough information to answer your question.";
pub const OVERLOADED_ANSWER: &str = "Model is overloaded – please retry shortly.";
pub const NO_CONTEXT_FOUND: &str = "No context found.";

/// Sources reported with an answer.
const MAX_SOURCES: usize = 3;
/// Chunks retrieved per chat turn.
const CHAT_RETRIEVAL_K: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 250,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Metadata>,
    pub confidence: f32,
    pub context_used: String,
}

impl Answer {
    fn no_information() -> Self {
        Self {
            answer: NO_INFORMATION_ANSWER.to_string(),
            sources: Vec::new(),
            confidence: 0.0,
            context_used: String::new(),
        }
    }
}

pub struct RagEngine {
    factory: Arc<StoreFactory>,
    llm: Arc<dyn LlmProvider>,
    generation: GenerationSettings,
    context: ContextSettings,
}

impl RagEngine {
    pub fn new(
        factory: Arc<StoreFactory>,
        llm: Arc<dyn LlmProvider>,
        generation: GenerationSettings,
        context: ContextSettings,
    ) -> Self {
        Self {
            factory,
            llm,
            generation,
            context,
        }
    }

    pub fn factory(&self) -> &Arc<StoreFactory> {
        &self.factory
    }

    async fn store(&self) -> Result<Arc<dyn VectorStore>, RagError> {
        self.factory.get_store().await
    }

    /// Index records and persist them before returning.
    pub async fn add_documents(&self, records: Vec<DocumentRecord>) -> Result<AddReport, RagError> {
        if records.is_empty() {
            return Ok(AddReport::default());
        }

        let store = self.store().await?;
        let (contents, metadatas): (Vec<String>, Vec<Metadata>) = records
            .into_iter()
            .map(|record| (record.content, record.metadata))
            .unzip();
        let report = store.add_documents(contents, metadatas).await?;
        store.save().await?;
        Ok(report)
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        self.store().await?.search(query, k).await
    }

    /// Search failures degrade to an empty result so the answer path
    /// still produces an answer.
    async fn retrieve_or_empty(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        let store = self.store().await?;
        match store.search(query, k).await {
            Ok(results) => Ok(results),
            Err(err) => {
                tracing::warn!("Retrieval failed, answering without context: {}", err);
                Ok(Vec::new())
            }
        }
    }

    /// Single-shot question answering over the top `k` chunks.
    ///
    /// Only store acquisition errors (unusable embedding model, model
    /// mismatch) are returned as `Err`.
    pub async fn answer(&self, query: &str, k: usize) -> Result<Answer, RagError> {
        let results = self.retrieve_or_empty(query, k).await?;
        if results.is_empty() {
            tracing::warn!("No documents retrieved for query: {}", query);
            return Ok(Answer::no_information());
        }

        let context = prepare_context(&results, &self.context);
        let prompt = create_prompt(query, &context);
        let answer = self.generate(vec![ChatMessage::user(prompt)]).await;

        Ok(Answer {
            answer,
            sources: sources(&results),
            confidence: calculate_confidence(&results),
            context_used: preview(&context, &self.context),
        })
    }

    /// Conversational answering; only the most recent turns of `history`
    /// shape retrieval and the prompt.
    pub async fn chat(&self, query: &str, history: &[ConversationTurn]) -> Result<Answer, RagError> {
        let retrieval_query = build_retrieval_query(history, query);
        let results = self
            .retrieve_or_empty(&retrieval_query, CHAT_RETRIEVAL_K)
            .await?;

        let (prompt, context_used) = if results.is_empty() {
            tracing::warn!("No documents retrieved; answering without context");
            (query.to_string(), NO_CONTEXT_FOUND.to_string())
        } else {
            let context = prepare_context(&results, &self.context);
            let used = preview(&context, &self.context);
            (create_prompt(query, &context), used)
        };

        let answer = self.generate(build_chat_messages(history, prompt)).await;

        Ok(Answer {
            answer,
            sources: sources(&results),
            confidence: calculate_confidence(&results),
            context_used,
        })
    }

    async fn generate(&self, messages: Vec<ChatMessage>) -> String {
        tracing::info!(
            "Calling {} ({} messages)",
            self.llm.name(),
            messages.len()
        );
        let request = ChatRequest::new(messages)
            .with_sampling(self.generation.max_tokens, self.generation.temperature);

        match self.llm.chat(request, &self.generation.model).await {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("Generation failed: {}", err);
                if is_overloaded(&err) {
                    OVERLOADED_ANSWER.to_string()
                } else {
                    format!("LLM error: {}", err)
                }
            }
        }
    }

    /// Wipe every chunk and start over with a fresh store.
    pub async fn clear(&self) -> Result<(), RagError> {
        tracing::warn!("Clearing vector store");
        self.factory.reset().await?;
        self.store().await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, RagError> {
        self.store().await?.get_stats().await
    }

    /// Every indexed chunk. Costs O(corpus).
    pub async fn all_documents(&self) -> Result<Vec<DocumentRecord>, RagError> {
        tracing::info!("Retrieving all documents");
        self.store().await?.get_all_documents().await
    }
}

fn sources(results: &[RetrievalResult]) -> Vec<Metadata> {
    results
        .iter()
        .take(MAX_SOURCES)
        .map(|result| result.metadata.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use crate::embedding::EmbeddingProvider;
    use crate::llm::ChatRole;
    use crate::rag::store::StoreKind;
    use crate::rag::test_support::{hashing, meta, ConstantEmbedder, RecordingEmbedder, ScriptedGenerator};
    use serde_json::json;
    use std::path::Path;

    fn factory(root: &Path, kind: StoreKind, embedder: Arc<dyn EmbeddingProvider>) -> Arc<StoreFactory> {
        let config = StoreConfig {
            kind,
            sqlite_path: root.join("rag.db"),
            flat_path: root.join("flat_store"),
            batch_size: 100,
            refresh_on_query: false,
        };
        Arc::new(StoreFactory::with_embedder(config, embedder))
    }

    fn engine(factory: Arc<StoreFactory>, llm: Arc<ScriptedGenerator>) -> RagEngine {
        RagEngine::new(
            factory,
            llm,
            GenerationSettings {
                model: "test-model".to_string(),
                ..GenerationSettings::default()
            },
            ContextSettings::default(),
        )
    }

    fn record(content: &str, metadata: serde_json::Value) -> DocumentRecord {
        DocumentRecord {
            content: content.to_string(),
            metadata: meta(metadata),
        }
    }

    #[tokio::test]
    async fn empty_store_gives_canned_answer_without_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = ScriptedGenerator::replying("unused");
        let engine = engine(factory(tmp.path(), StoreKind::Flat, hashing(32)), llm.clone());

        let answer = engine.answer("anything?", 5).await.unwrap();

        assert_eq!(answer.answer, NO_INFORMATION_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(answer.context_used, "");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn single_chunk_scenario_attributes_source() {
        for kind in [StoreKind::Sqlite, StoreKind::Flat] {
            let tmp = tempfile::tempdir().unwrap();
            let llm = ScriptedGenerator::replying("Blue.");
            let engine = engine(factory(tmp.path(), kind, ConstantEmbedder::new(8)), llm.clone());

            engine
                .add_documents(vec![record("The sky is blue.", json!({"filename": "a.txt"}))])
                .await
                .unwrap();

            let retrieved = engine.retrieve("What color is the sky?", 5).await.unwrap();
            assert_eq!(retrieved.len(), 1);
            assert_eq!(retrieved[0].document, "The sky is blue.");
            assert!((retrieved[0].score - 1.0).abs() < 1e-6);

            let answer = engine.answer("What color is the sky?", 5).await.unwrap();
            assert_eq!(answer.answer, "Blue.");
            assert_eq!(answer.sources, vec![meta(json!({"filename": "a.txt"}))]);
            assert!((answer.confidence - 1.0).abs() < 1e-6);
            assert_eq!(answer.context_used, "The sky is blue.");

            let messages = llm.last_messages();
            assert_eq!(messages.len(), 1);
            assert!(messages[0].content.contains("Context:\nThe sky is blue."));
            assert_eq!(llm.last_model().as_deref(), Some("test-model"));
        }
    }

    #[tokio::test]
    async fn sources_are_capped_at_three() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(
            factory(tmp.path(), StoreKind::Flat, ConstantEmbedder::new(4)),
            ScriptedGenerator::replying("ok"),
        );
        let records = (0..5)
            .map(|i| record(&format!("chunk {}", i), json!({"chunk_id": i})))
            .collect();
        engine.add_documents(records).await.unwrap();

        let answer = engine.answer("q", 5).await.unwrap();
        assert_eq!(answer.sources.len(), 3);
        assert_eq!(answer.sources[0]["chunk_id"], 0);
    }

    #[tokio::test]
    async fn generation_errors_become_answers() {
        let tmp = tempfile::tempdir().unwrap();
        let store = factory(tmp.path(), StoreKind::Flat, ConstantEmbedder::new(4));
        let overloaded = engine(
            Arc::clone(&store),
            ScriptedGenerator::failing("provider overloaded (529): busy"),
        );
        overloaded
            .add_documents(vec![record("fact", json!({}))])
            .await
            .unwrap();

        let answer = overloaded.answer("q", 5).await.unwrap();
        assert_eq!(answer.answer, OVERLOADED_ANSWER);
        assert!(answer.confidence > 0.0);

        let broken = engine(store, ScriptedGenerator::failing("bad token"));
        let answer = broken.answer("q", 5).await.unwrap();
        assert_eq!(answer.answer, "LLM error: generation failed: bad token");
    }

    #[tokio::test]
    async fn chat_uses_last_three_turns_for_retrieval_and_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = RecordingEmbedder::new(32);
        let llm = ScriptedGenerator::replying("sure");
        let engine = engine(
            factory(tmp.path(), StoreKind::Flat, recorder.clone()),
            llm.clone(),
        );
        engine
            .add_documents(vec![record("Rust ownership", json!({"filename": "r.md"}))])
            .await
            .unwrap();

        let history: Vec<ConversationTurn> = (1..=5)
            .map(|i| ConversationTurn {
                human: format!("question {}", i),
                assistant: format!("reply {}", i),
            })
            .collect();
        let answer = engine.chat("and ownership?", &history).await.unwrap();

        let retrieval_query = recorder.seen().last().cloned().unwrap();
        assert!(retrieval_query.starts_with("Human: question 3"));
        assert!(!retrieval_query.contains("question 2"));
        assert!(retrieval_query.ends_with("Human: and ownership?"));

        let messages = llm.last_messages();
        assert_eq!(messages.len(), 7);
        assert_eq!(messages[0].content, "question 3");
        assert_eq!(messages[5].role, ChatRole::Assistant);
        assert!(messages[6].content.contains("Question:\nand ownership?"));
        assert_eq!(answer.sources.len(), 1);
    }

    #[tokio::test]
    async fn chat_without_context_sends_bare_question() {
        let tmp = tempfile::tempdir().unwrap();
        let llm = ScriptedGenerator::replying("hello");
        let engine = engine(factory(tmp.path(), StoreKind::Sqlite, hashing(16)), llm.clone());

        let answer = engine.chat("hi there", &[]).await.unwrap();

        assert_eq!(answer.answer, "hello");
        assert_eq!(answer.context_used, NO_CONTEXT_FOUND);
        assert_eq!(answer.confidence, 0.0);
        assert!(answer.sources.is_empty());
        assert_eq!(llm.last_messages(), vec![ChatMessage::user("hi there")]);
    }

    #[tokio::test]
    async fn clear_twice_leaves_empty_usable_store() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(
            factory(tmp.path(), StoreKind::Flat, hashing(32)),
            ScriptedGenerator::replying("ok"),
        );
        engine
            .add_documents(vec![record("to forget", json!({}))])
            .await
            .unwrap();

        engine.clear().await.unwrap();
        engine.clear().await.unwrap();

        assert_eq!(engine.stats().await.unwrap().total_documents, 0);
        assert!(engine.all_documents().await.unwrap().is_empty());
        engine
            .add_documents(vec![record("remember me", json!({}))])
            .await
            .unwrap();
        assert_eq!(engine.stats().await.unwrap().total_documents, 1);
    }

    #[tokio::test]
    async fn empty_ingestion_touches_nothing() {
        for kind in [StoreKind::Sqlite, StoreKind::Flat] {
            let tmp = tempfile::tempdir().unwrap();
            let store = factory(tmp.path(), kind, hashing(16));
            let engine = engine(Arc::clone(&store), ScriptedGenerator::replying("ok"));

            let report = engine.add_documents(Vec::new()).await.unwrap();

            assert_eq!(report, AddReport::default());
            assert!(!tmp.path().join("flat_store").exists());
            assert_eq!(engine.stats().await.unwrap().total_documents, 0);
        }
    }

    #[tokio::test]
    async fn ingestion_is_saved_before_returning() {
        let tmp = tempfile::tempdir().unwrap();
        let first = engine(
            factory(tmp.path(), StoreKind::Flat, hashing(32)),
            ScriptedGenerator::replying("ok"),
        );
        first
            .add_documents(vec![record("persisted", json!({"filename": "p.txt"}))])
            .await
            .unwrap();

        let second = engine(
            factory(tmp.path(), StoreKind::Flat, hashing(32)),
            ScriptedGenerator::replying("ok"),
        );
        let documents = second.all_documents().await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].content, "persisted");
    }
}
