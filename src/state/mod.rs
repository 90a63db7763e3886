use std::sync::Arc;

use crate::core::config::{AppConfig, AppPaths, ConfigService};
use crate::jobs::JobRunner;
use crate::llm::{LlmProvider, OpenAiCompatProvider};
use crate::rag::{ConversationStore, RagEngine, StoreFactory};

pub mod error;

pub use error::InitializationError;

/// Shared state handed to every route.
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config_service: ConfigService,
    pub config: AppConfig,
    pub engine: Arc<RagEngine>,
    pub conversations: ConversationStore,
    pub jobs: JobRunner,
}

impl AppState {
    /// Loads and validates configuration, then wires the store factory,
    /// generator and engine together.
    ///
    /// A configuration problem is fatal. The store itself is built lazily;
    /// a failed warm-up is logged and retried by the first request.
    pub async fn initialize(paths: Arc<AppPaths>) -> Result<Arc<Self>, InitializationError> {
        let config_service = ConfigService::new(paths.clone());
        let config = AppConfig::from_service(&config_service)
            .map_err(|e| InitializationError::Config(e.into()))?;

        let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatProvider::from_config(&config.llm));
        let factory = Arc::new(StoreFactory::new(
            config.store.clone(),
            config.embedding.clone(),
        ));

        let state = Self::from_parts(paths, config_service, config, factory, llm);

        match state.engine.factory().get_store().await {
            Ok(store) => tracing::info!("Vector store ready ({})", store.kind()),
            Err(err) => tracing::error!("Vector store unavailable at startup: {}", err),
        }

        Ok(Arc::new(state))
    }

    pub fn from_parts(
        paths: Arc<AppPaths>,
        config_service: ConfigService,
        config: AppConfig,
        factory: Arc<StoreFactory>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let engine = Arc::new(RagEngine::new(
            factory,
            llm,
            config.llm.generation_settings(),
            config.rag.context_settings(),
        ));
        let jobs = JobRunner::new(engine.clone(), config.jobs.workers);

        Self {
            paths,
            config_service,
            config,
            engine,
            conversations: ConversationStore::new(),
            jobs,
        }
    }
}
