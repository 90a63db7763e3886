//! Retrieval-augmented generation.
//!
//! - `store`: the `VectorStore` contract shared by both engines
//! - `sqlite` / `flat`: the two interchangeable store engines
//! - `factory`: shared store slot with reset and generation tracking
//! - `engine`: answer and chat pipelines over the active store

pub mod chunker;
pub mod context_builder;
pub mod conversation;
pub mod engine;
pub mod factory;
pub mod flat;
pub mod sqlite;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use context_builder::ContextSettings;
pub use conversation::{ConversationStore, ConversationTurn};
pub use engine::{Answer, GenerationSettings, RagEngine};
pub use factory::StoreFactory;
pub use store::{
    AddReport, DocumentRecord, Metadata, RetrievalResult, StoreKind, StoreStats, VectorStore,
    DEFAULT_BATCH_SIZE,
};
