pub mod paths;
pub mod service;
pub mod settings;
pub mod validation;

pub use paths::AppPaths;
pub use service::ConfigService;
pub use settings::{
    AppConfig, ChunkingConfig, EmbeddingConfig, JobsConfig, LlmConfig, RagConfig, ServerConfig,
    StoreConfig,
};
pub use validation::validate_config;
