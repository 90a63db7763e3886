//! Retrieval-augmented question answering over an evolving document corpus.

pub mod core;
pub mod embedding;
pub mod jobs;
pub mod llm;
pub mod rag;
pub mod server;
pub mod state;
