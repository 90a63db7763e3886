//! SQLite-backed vector store.
//!
//! Chunk text, metadata and little-endian f32 embeddings live in one WAL-mode
//! database; similarity is brute-force cosine over all rows. Every batch is
//! committed before `add_documents` returns, so `save`/`load` have nothing
//! to do.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::store::{
    clamp_score, cosine_similarity, embed_batch, prepare_batch, rank, AddReport, DocumentRecord,
    Metadata, RetrievalResult, StoreKind, StoreStats, VectorStore,
};
use crate::core::errors::RagError;
use crate::embedding::EmbeddingProvider;

const SIMILARITY_METRIC: &str = "cosine";

pub struct SqliteStore {
    pool: SqlitePool,
    db_path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl SqliteStore {
    /// Open (or create) the database and bind it to `embedder`. A database
    /// built by another model is refused with [`RagError::ModelMismatch`].
    pub async fn open(
        db_path: PathBuf,
        embedder: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Result<Self, RagError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            db_path,
            embedder,
            batch_size: batch_size.max(1),
        };
        store.init_schema().await?;
        store.check_model().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn init_schema(&self) -> Result<(), RagError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS store_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                model TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                metric TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the active model on first open; refuse a different one later.
    async fn check_model(&self) -> Result<(), RagError> {
        let row = sqlx::query("SELECT model, dimension FROM store_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        let active = self.embedder.model_name().to_string();
        let active_dimension = self.embedder.dimension();

        match row {
            Some(row) => {
                let stored: String = row.get("model");
                let stored_dimension: i64 = row.get("dimension");
                let stored_dimension = stored_dimension as usize;
                if stored != active || stored_dimension != active_dimension {
                    return Err(RagError::ModelMismatch {
                        stored,
                        stored_dimension,
                        active,
                        active_dimension,
                    });
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO store_meta (id, model, dimension, metric) VALUES (1, ?1, ?2, ?3)",
                )
                .bind(&active)
                .bind(active_dimension as i64)
                .bind(SIMILARITY_METRIC)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, RagError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn insert_batch(&self, batch: &[(String, Metadata)]) -> Result<usize, RagError> {
        let texts: Vec<String> = batch.iter().map(|(content, _)| content.clone()).collect();
        let vectors = embed_batch(self.embedder.as_ref(), &texts).await?;

        let mut tx = self.pool.begin().await?;
        for ((content, metadata), vector) in batch.iter().zip(&vectors) {
            let metadata_str = serde_json::to_string(metadata).map_err(RagError::store)?;
            sqlx::query(
                "INSERT INTO chunks (id, content, metadata, embedding) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(content)
            .bind(&metadata_str)
            .bind(serialize_embedding(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(batch.len())
    }

    /// Remove the database and its WAL side files without opening it.
    pub async fn purge(db_path: &Path) -> Result<(), RagError> {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = db_path.as_os_str().to_os_string();
            name.push(suffix);
            match tokio::fs::remove_file(PathBuf::from(name)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn decode_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_default()
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    async fn add_documents(
        &self,
        contents: Vec<String>,
        metadatas: Vec<Metadata>,
    ) -> Result<AddReport, RagError> {
        let requested = contents.len();
        let prepared = prepare_batch(contents, metadatas)?;
        let mut report = AddReport {
            requested,
            dropped_empty: prepared.dropped_empty,
            ..AddReport::default()
        };
        if prepared.items.is_empty() {
            return Ok(report);
        }

        for (index, batch) in prepared.items.chunks(self.batch_size).enumerate() {
            match self.insert_batch(batch).await {
                Ok(added) => report.added += added,
                Err(err) => {
                    report.skipped_batches += 1;
                    tracing::warn!(
                        "Skipping batch {} ({} chunks) in sqlite store: {}",
                        index,
                        batch.len(),
                        err
                    );
                }
            }
        }

        tracing::info!(
            "Added {}/{} chunks to sqlite store",
            report.added,
            report.requested
        );
        Ok(report)
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        if k == 0 || self.count().await? == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.encode_one(query).await?;
        let rows = sqlx::query("SELECT content, metadata, embedding FROM chunks ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<RetrievalResult> = rows
            .iter()
            .map(|row| {
                let embedding_bytes: Vec<u8> = row.get("embedding");
                let stored = deserialize_embedding(&embedding_bytes);
                let metadata_str: String = row.get("metadata");
                RetrievalResult {
                    document: row.get("content"),
                    metadata: decode_metadata(&metadata_str),
                    score: clamp_score(cosine_similarity(&query_embedding, &stored)),
                }
            })
            .collect();

        rank(&mut scored, k);
        Ok(scored)
    }

    async fn save(&self) -> Result<(), RagError> {
        tracing::debug!("sqlite store commits on write; nothing to save");
        Ok(())
    }

    async fn load(&self) -> Result<(), RagError> {
        tracing::debug!("sqlite store is loaded on open");
        Ok(())
    }

    async fn get_all_documents(&self) -> Result<Vec<DocumentRecord>, RagError> {
        let rows = sqlx::query("SELECT content, metadata FROM chunks ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let metadata_str: String = row.get("metadata");
                DocumentRecord {
                    content: row.get("content"),
                    metadata: decode_metadata(&metadata_str),
                }
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<StoreStats, RagError> {
        let count = self.count().await?;
        Ok(StoreStats {
            total_documents: count,
            index_size: count,
            dimension: self.embedder.dimension(),
            model: self.embedder.model_name().to_string(),
            kind: StoreKind::Sqlite,
        })
    }

    async fn wipe(&self) -> Result<(), RagError> {
        sqlx::query("DROP TABLE IF EXISTS chunks")
            .execute(&self.pool)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS store_meta")
            .execute(&self.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        self.pool.close().await;

        Self::purge(&self.db_path).await?;
        tracing::info!("Wiped sqlite store at {}", self.db_path.display());
        Ok(())
    }
}
