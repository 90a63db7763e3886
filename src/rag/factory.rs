//! Lazily constructed, resettable store handle.
//!
//! One async mutex guards the slot. `get_store` builds the configured engine
//! at most once while holding it; `reset` takes the handle out, wipes the
//! backing storage and bumps the generation before releasing it, so no caller
//! can acquire a half-wiped store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use super::flat::FlatStore;
use super::sqlite::SqliteStore;
use super::store::{StoreKind, VectorStore};
use crate::core::config::{EmbeddingConfig, StoreConfig};
use crate::core::errors::RagError;
use crate::embedding::{load_provider, EmbeddingProvider};

pub struct StoreFactory {
    config: StoreConfig,
    embedding: EmbeddingConfig,
    embedder: OnceCell<Arc<dyn EmbeddingProvider>>,
    slot: Mutex<Option<Arc<dyn VectorStore>>>,
    generation: AtomicU64,
}

impl StoreFactory {
    pub fn new(config: StoreConfig, embedding: EmbeddingConfig) -> Self {
        Self {
            config,
            embedding,
            embedder: OnceCell::new(),
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Factory with an already loaded embedding provider.
    pub fn with_embedder(config: StoreConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            embedding: EmbeddingConfig::default(),
            embedder: OnceCell::new_with(Some(embedder)),
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.config.kind
    }

    /// Incremented by every completed reset.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The embedding provider, loaded on first use and kept across resets.
    pub async fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>, RagError> {
        self.embedder
            .get_or_try_init(|| load_provider(&self.embedding))
            .await
            .cloned()
    }

    /// Return the live store, constructing and loading it on first use.
    pub async fn get_store(&self) -> Result<Arc<dyn VectorStore>, RagError> {
        let mut slot = self.slot.lock().await;
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }

        let store = self.construct().await?;
        *slot = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Drop the live handle and destroy all persisted chunks. The next
    /// `get_store` builds a fresh, empty store.
    pub async fn reset(&self) -> Result<(), RagError> {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(store) => store.wipe().await?,
            None => self.purge().await?,
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "Reset {} store (generation {})",
            self.config.kind,
            generation
        );
        Ok(())
    }

    async fn construct(&self) -> Result<Arc<dyn VectorStore>, RagError> {
        let embedder = self.embedder().await?;
        let store: Arc<dyn VectorStore> = match self.config.kind {
            StoreKind::Sqlite => Arc::new(self.open_sqlite(embedder).await?),
            StoreKind::Flat => Arc::new(FlatStore::new(
                self.config.flat_path.clone(),
                embedder,
                self.config.batch_size,
                self.config.refresh_on_query,
            )),
        };

        match store.load().await {
            Ok(()) => {}
            Err(err @ RagError::ModelMismatch { .. }) => return Err(err),
            Err(err) => {
                tracing::warn!(
                    "Could not load {} store, continuing with an empty one: {}",
                    self.config.kind,
                    err
                );
            }
        }

        let stats = store.get_stats().await?;
        tracing::info!(
            "Opened {} store with {} chunks ({}, {}d)",
            stats.kind,
            stats.total_documents,
            stats.model,
            stats.dimension
        );
        Ok(store)
    }

    /// Open the database; an unreadable file is moved aside and replaced.
    async fn open_sqlite(
        &self,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<SqliteStore, RagError> {
        let path = self.config.sqlite_path.clone();
        match SqliteStore::open(path.clone(), Arc::clone(&embedder), self.config.batch_size).await
        {
            Ok(store) => Ok(store),
            Err(err @ RagError::ModelMismatch { .. }) => Err(err),
            Err(err) if !path.exists() => Err(err),
            Err(err) => {
                let quarantined = quarantine_path(&path);
                tracing::warn!(
                    "Could not open sqlite store at {} ({}); moving it to {} and starting empty",
                    path.display(),
                    err,
                    quarantined.display()
                );
                tokio::fs::rename(&path, &quarantined).await?;
                SqliteStore::purge(&path).await?;
                SqliteStore::open(path, embedder, self.config.batch_size).await
            }
        }
    }

    async fn purge(&self) -> Result<(), RagError> {
        match self.config.kind {
            StoreKind::Sqlite => SqliteStore::purge(&self.config.sqlite_path).await,
            StoreKind::Flat => FlatStore::purge(&self.config.flat_path).await,
        }
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".corrupt-{}", stamp));
    PathBuf::from(name)
}
