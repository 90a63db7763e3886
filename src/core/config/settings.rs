use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::paths::AppPaths;
use super::service::ConfigService;
use super::validation::validate_config;
use crate::core::errors::RagError;
use crate::embedding::EmbeddingProviderKind;
use crate::rag::{ContextSettings, GenerationSettings, StoreKind};

/// Placeholder shipped in sample configs; treated the same as a missing key.
const API_KEY_PLACEHOLDER: &str = "YOUR_TOKEN";

/// Typed view over the merged configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub store: StoreConfig,
    pub rag: RagConfig,
    pub chunking: ChunkingConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Inference provider appended to the model id for routers that need it.
    pub provider: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Some("featherless-ai".to_string()),
            model: "inclusionAI/Ling-1T".to_string(),
            api_key: None,
            base_url: "https://router.huggingface.co/v1".to_string(),
            max_tokens: 250,
            temperature: 0.7,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "****"))
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl LlmConfig {
    /// Model identifier sent on the wire, `model:provider` when routed.
    pub fn model_id(&self) -> String {
        match self.provider.as_deref().map(str::trim) {
            Some(provider) if !provider.is_empty() && !self.model.contains(':') => {
                format!("{}:{}", self.model, provider)
            }
            _ => self.model.clone(),
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            model: self.model_id(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Output width of the hashing provider. Other providers report their own.
    pub dimension: usize,
    pub show_download_progress: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Remote,
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            base_url: "http://127.0.0.1:1234/v1".to_string(),
            api_key: None,
            dimension: 384,
            show_download_progress: false,
        }
    }
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "****"))
            .field("dimension", &self.dimension)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub sqlite_path: PathBuf,
    pub flat_path: PathBuf,
    pub batch_size: usize,
    /// Reload the flat snapshot before a query when another process saved a newer one.
    pub refresh_on_query: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sqlite,
            sqlite_path: PathBuf::new(),
            flat_path: PathBuf::new(),
            batch_size: crate::rag::DEFAULT_BATCH_SIZE,
            refresh_on_query: true,
        }
    }
}

impl StoreConfig {
    fn resolve_paths(&mut self, paths: &AppPaths) {
        self.sqlite_path = if self.sqlite_path.as_os_str().is_empty() {
            paths.default_sqlite_path()
        } else {
            paths.resolve(&self.sqlite_path)
        };
        self.flat_path = if self.flat_path.as_os_str().is_empty() {
            paths.default_flat_dir()
        } else {
            paths.resolve(&self.flat_path)
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub default_k: usize,
    pub max_context_chars: usize,
    pub min_fragment_chars: usize,
    pub preview_chars: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        let context = ContextSettings::default();
        Self {
            default_k: 5,
            max_context_chars: context.max_context_chars,
            min_fragment_chars: context.min_fragment_chars,
            preview_chars: context.preview_chars,
        }
    }
}

impl RagConfig {
    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            max_context_chars: self.max_context_chars,
            min_fragment_chars: self.min_fragment_chars,
            preview_chars: self.preview_chars,
            ..ContextSettings::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub workers: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

impl AppConfig {
    pub fn from_service(service: &ConfigService) -> Result<Self, RagError> {
        Self::from_value(service.load_config(), service.paths())
    }

    /// Validate, deserialize and resolve a merged config tree.
    ///
    /// Missing LLM credentials are fatal here so the server never binds
    /// without a usable generator.
    pub fn from_value(mut raw: Value, paths: &AppPaths) -> Result<Self, RagError> {
        normalize_enum_values(&mut raw);
        validate_config(&raw)?;

        let mut config: AppConfig =
            serde_json::from_value(raw).map_err(|err| RagError::Config(err.to_string()))?;
        config.store.resolve_paths(paths);
        config.require_llm_credentials()?;
        Ok(config)
    }

    fn require_llm_credentials(&self) -> Result<(), RagError> {
        let key_missing = self
            .llm
            .api_key
            .as_deref()
            .map(str::trim)
            .map_or(true, |key| key.is_empty() || key == API_KEY_PLACEHOLDER);
        if key_missing {
            return Err(RagError::Config(
                "llm.api_key is not set (use LLM_API_KEY or HF_API_TOKEN)".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(RagError::Config(
                "llm.model is not set (use LLM_MODEL)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lowercase enum-valued keys and map legacy store names onto the engines.
fn normalize_enum_values(raw: &mut Value) {
    if let Some(kind) = raw.pointer_mut("/store/kind") {
        if let Some(text) = kind.as_str() {
            let normalized = match text.trim().to_lowercase().as_str() {
                "chroma" => "sqlite".to_string(),
                "faiss" => "flat".to_string(),
                other => other.to_string(),
            };
            *kind = Value::String(normalized);
        }
    }
    if let Some(provider) = raw.pointer_mut("/embedding/provider") {
        if let Some(text) = provider.as_str() {
            *provider = Value::String(text.trim().to_lowercase());
        }
    }
}
