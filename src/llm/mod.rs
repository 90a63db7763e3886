pub mod openai;
pub mod provider;
pub mod types;

pub use openai::OpenAiCompatProvider;
pub use provider::{is_overloaded, LlmProvider};
pub use types::{ChatMessage, ChatRequest, ChatRole};
