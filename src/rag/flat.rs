//! Flat in-memory vector index with directory snapshots.
//!
//! Vectors are unit-normalised rows of an `Array2<f32>`, so the inner product
//! is cosine similarity. Nothing is durable until [`VectorStore::save`], which
//! writes `index.bin` and `documents.json` into a staging directory and swaps
//! it in by rename. An interrupted swap leaves a `.previous` directory that
//! the next load or save restores.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use fs2::FileExt;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::{
    clamp_score, embed_batch, prepare_batch, AddReport, DocumentRecord, Metadata,
    RetrievalResult, StoreKind, StoreStats, VectorStore,
};
use crate::core::errors::RagError;
use crate::embedding::{normalize, EmbeddingProvider};

const INDEX_FILE: &str = "index.bin";
const DOCUMENTS_FILE: &str = "documents.json";
const INDEX_MAGIC: &[u8; 8] = b"RAGFLAT1";
/// magic + generation uuid + dimension (u32) + row count (u64)
const HEADER_LEN: usize = 8 + 16 + 4 + 8;

struct FlatIndex {
    vectors: Array2<f32>,
}

impl FlatIndex {
    fn new(dimension: usize) -> Self {
        Self {
            vectors: Array2::zeros((0, dimension)),
        }
    }

    fn dimension(&self) -> usize {
        self.vectors.ncols()
    }

    fn len(&self) -> usize {
        self.vectors.nrows()
    }

    fn push(&mut self, vector: &[f32]) -> Result<(), RagError> {
        self.vectors
            .push_row(ArrayView1::from(vector))
            .map_err(RagError::store)
    }

    /// Exhaustive inner-product search; ties keep insertion order.
    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let scores = self.vectors.dot(&ArrayView1::from(query));
        let mut hits: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k.min(self.len()));
        hits
    }

    fn encode(&self, generation: Uuid) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend_from_slice(generation.as_bytes());
        bytes.extend_from_slice(&(self.dimension() as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in self.vectors.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<(SnapshotHeader, Self), RagError> {
        let header = SnapshotHeader::decode(bytes)?;
        let body = &bytes[HEADER_LEN..];
        let expected = header
            .count
            .checked_mul(header.dimension)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| RagError::Snapshot("index header size overflows".to_string()))?;
        if body.len() != expected {
            return Err(RagError::Snapshot(format!(
                "index body has {} bytes, expected {}",
                body.len(),
                expected
            )));
        }

        let values: Vec<f32> = body
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let vectors = Array2::from_shape_vec((header.count, header.dimension), values)
            .map_err(RagError::snapshot)?;
        Ok((header, Self { vectors }))
    }
}

struct SnapshotHeader {
    generation: Uuid,
    dimension: usize,
    count: usize,
}

impl SnapshotHeader {
    fn decode(bytes: &[u8]) -> Result<Self, RagError> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != INDEX_MAGIC {
            return Err(RagError::Snapshot("index file has no valid header".to_string()));
        }
        let generation = Uuid::from_slice(&bytes[8..24]).map_err(RagError::snapshot)?;

        let mut dimension = [0u8; 4];
        dimension.copy_from_slice(&bytes[24..28]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[28..36]);

        let dimension = u32::from_le_bytes(dimension) as usize;
        let count = usize::try_from(u64::from_le_bytes(count))
            .map_err(|_| RagError::Snapshot("index row count does not fit in memory".to_string()))?;
        if dimension == 0 {
            return Err(RagError::Snapshot("index header has zero dimension".to_string()));
        }

        Ok(Self {
            generation,
            dimension,
            count,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotDocuments {
    generation: String,
    model: String,
    ids: Vec<String>,
    documents: Vec<String>,
    metadata: Vec<Metadata>,
}

struct Snapshot {
    header: SnapshotHeader,
    index: FlatIndex,
    documents: SnapshotDocuments,
}

/// On-disk locations derived from the configured snapshot directory.
#[derive(Clone)]
struct SnapshotPaths {
    dir: PathBuf,
    parent: PathBuf,
    previous: PathBuf,
    lock: PathBuf,
    staging_prefix: String,
}

impl SnapshotPaths {
    fn new(dir: &Path) -> Self {
        let parent = dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "flat_store".to_string());

        Self {
            dir: dir.to_path_buf(),
            previous: parent.join(format!(".{}.previous", name)),
            lock: parent.join(format!(".{}.lock", name)),
            staging_prefix: format!(".{}.staging-", name),
            parent,
        }
    }

    /// Exclusive advisory lock shared by every process using this directory.
    fn lock(&self) -> Result<SnapshotLock, RagError> {
        fs::create_dir_all(&self.parent)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock)?;
        FileExt::lock_exclusive(&file)?;
        Ok(SnapshotLock { file })
    }

    /// Finish or roll back an interrupted swap and drop abandoned staging dirs.
    /// Caller holds the lock.
    fn recover(&self) -> Result<(), RagError> {
        if self.previous.exists() {
            if self.dir.exists() {
                fs::remove_dir_all(&self.previous)?;
            } else {
                tracing::warn!(
                    "Restoring flat snapshot from {} after an interrupted save",
                    self.previous.display()
                );
                fs::rename(&self.previous, &self.dir)?;
            }
        }
        self.remove_staging()
    }

    fn remove_staging(&self) -> Result<(), RagError> {
        let entries = match fs::read_dir(&self.parent) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&self.staging_prefix)
            {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<(), RagError> {
        let _lock = self.lock()?;
        for dir in [&self.dir, &self.previous] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.remove_staging()
    }
}

struct SnapshotLock {
    file: File,
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), RagError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn write_snapshot(
    paths: &SnapshotPaths,
    index_bytes: &[u8],
    documents_bytes: &[u8],
) -> Result<(), RagError> {
    let _lock = paths.lock()?;
    paths.recover()?;

    let staging = paths
        .parent
        .join(format!("{}{}", paths.staging_prefix, Uuid::new_v4()));
    fs::create_dir_all(&staging)?;
    write_synced(&staging.join(INDEX_FILE), index_bytes)?;
    write_synced(&staging.join(DOCUMENTS_FILE), documents_bytes)?;

    if paths.dir.exists() {
        fs::rename(&paths.dir, &paths.previous)?;
    }
    if let Err(err) = fs::rename(&staging, &paths.dir) {
        if paths.previous.exists() {
            let _ = fs::rename(&paths.previous, &paths.dir);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(err.into());
    }
    if paths.previous.exists() {
        fs::remove_dir_all(&paths.previous)?;
    }
    Ok(())
}

fn read_snapshot(paths: &SnapshotPaths) -> Result<Option<Snapshot>, RagError> {
    let _lock = paths.lock()?;
    paths.recover()?;

    let index_path = paths.dir.join(INDEX_FILE);
    let documents_path = paths.dir.join(DOCUMENTS_FILE);
    match (index_path.exists(), documents_path.exists()) {
        (false, false) => return Ok(None),
        (true, true) => {}
        (has_index, _) => {
            let missing = if has_index { DOCUMENTS_FILE } else { INDEX_FILE };
            return Err(RagError::Snapshot(format!(
                "{} is missing from {}",
                missing,
                paths.dir.display()
            )));
        }
    }

    let (header, index) = FlatIndex::decode(&fs::read(&index_path)?)?;
    let documents: SnapshotDocuments =
        serde_json::from_slice(&fs::read(&documents_path)?).map_err(RagError::snapshot)?;

    if documents.generation != header.generation.to_string() {
        return Err(RagError::Snapshot(
            "index and documents come from different saves".to_string(),
        ));
    }
    let counts = [
        header.count,
        documents.ids.len(),
        documents.documents.len(),
        documents.metadata.len(),
    ];
    if counts.iter().any(|count| *count != header.count) {
        return Err(RagError::Snapshot(format!(
            "inconsistent snapshot cardinalities (index, ids, documents, metadata) = {:?}",
            counts
        )));
    }

    Ok(Some(Snapshot {
        header,
        index,
        documents,
    }))
}

/// Generation of the snapshot on disk, read from the index header only.
fn read_generation(dir: &Path) -> Option<Uuid> {
    let mut file = File::open(dir.join(INDEX_FILE)).ok()?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).ok()?;
    SnapshotHeader::decode(&header).ok().map(|h| h.generation)
}

struct FlatState {
    index: FlatIndex,
    ids: Vec<String>,
    documents: Vec<String>,
    metadata: Vec<Metadata>,
    /// Generation of the snapshot this state was loaded from or saved as.
    generation: Option<Uuid>,
    /// Holds writes not yet saved.
    dirty: bool,
}

impl FlatState {
    fn empty(dimension: usize) -> Self {
        Self {
            index: FlatIndex::new(dimension),
            ids: Vec::new(),
            documents: Vec::new(),
            metadata: Vec::new(),
            generation: None,
            dirty: false,
        }
    }

    fn append(
        &mut self,
        batch: &[(String, Metadata)],
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize, RagError> {
        let dimension = self.index.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        for ((content, metadata), vector) in batch.iter().zip(&vectors) {
            self.index.push(vector)?;
            self.ids.push(Uuid::new_v4().to_string());
            self.documents.push(content.clone());
            self.metadata.push(metadata.clone());
        }
        self.dirty = true;
        Ok(batch.len())
    }
}

pub struct FlatStore {
    paths: SnapshotPaths,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    refresh_on_query: bool,
    state: RwLock<FlatState>,
    /// Serialises add/save/load/wipe within the process.
    writer: tokio::sync::Mutex<()>,
}

impl FlatStore {
    pub fn new(
        dir: PathBuf,
        embedder: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        refresh_on_query: bool,
    ) -> Self {
        let dimension = embedder.dimension();
        Self {
            paths: SnapshotPaths::new(&dir),
            embedder,
            batch_size: batch_size.max(1),
            refresh_on_query,
            state: RwLock::new(FlatState::empty(dimension)),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.paths.dir
    }

    /// Remove a snapshot directory without constructing a store.
    pub async fn purge(dir: &Path) -> Result<(), RagError> {
        let paths = SnapshotPaths::new(dir);
        tokio::task::spawn_blocking(move || paths.remove_all())
            .await
            .map_err(RagError::store)?
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, FlatState>, RagError> {
        self.state
            .read()
            .map_err(|_| RagError::Store("flat index lock poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, FlatState>, RagError> {
        self.state
            .write()
            .map_err(|_| RagError::Store("flat index lock poisoned".to_string()))
    }

    fn len(&self) -> Result<usize, RagError> {
        Ok(self.read_state()?.index.len())
    }

    fn append_batch(
        &self,
        batch: &[(String, Metadata)],
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize, RagError> {
        self.write_state()?.append(batch, vectors)
    }

    async fn embed_normalized(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let mut vectors = embed_batch(self.embedder.as_ref(), texts).await?;
        for vector in vectors.iter_mut() {
            normalize(vector);
        }
        Ok(vectors)
    }

    /// Caller holds `writer`.
    async fn load_locked(&self) -> Result<(), RagError> {
        let paths = self.paths.clone();
        let snapshot = tokio::task::spawn_blocking(move || read_snapshot(&paths))
            .await
            .map_err(RagError::snapshot)??;

        let Some(snapshot) = snapshot else {
            tracing::info!(
                "No flat snapshot at {}; starting empty",
                self.paths.dir.display()
            );
            return Ok(());
        };

        let active = self.embedder.model_name();
        let active_dimension = self.embedder.dimension();
        if snapshot.documents.model != active || snapshot.header.dimension != active_dimension {
            return Err(RagError::ModelMismatch {
                stored: snapshot.documents.model,
                stored_dimension: snapshot.header.dimension,
                active: active.to_string(),
                active_dimension,
            });
        }

        let count = snapshot.header.count;
        let mut state = self.write_state()?;
        *state = FlatState {
            index: snapshot.index,
            ids: snapshot.documents.ids,
            documents: snapshot.documents.documents,
            metadata: snapshot.documents.metadata,
            generation: Some(snapshot.header.generation),
            dirty: false,
        };
        tracing::info!(
            "Loaded flat snapshot with {} chunks from {}",
            count,
            self.paths.dir.display()
        );
        Ok(())
    }

    /// Pick up a snapshot saved by another process, unless local writes are
    /// pending or a local writer is busy.
    async fn refresh_if_stale(&self) {
        let Ok(_writer) = self.writer.try_lock() else {
            return;
        };
        let current = {
            let Ok(state) = self.read_state() else {
                return;
            };
            if state.dirty {
                return;
            }
            state.generation
        };

        let dir = self.paths.dir.clone();
        let on_disk = tokio::task::spawn_blocking(move || read_generation(&dir))
            .await
            .ok()
            .flatten();

        if let Some(generation) = on_disk {
            if Some(generation) != current {
                tracing::info!("Flat snapshot changed on disk; reloading");
                if let Err(err) = self.load_locked().await {
                    tracing::warn!("Keeping in-memory flat index, reload failed: {}", err);
                }
            }
        }
    }
}

#[async_trait]
impl VectorStore for FlatStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Flat
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

        let _writer = self.writer.lock().await;
        for (index, batch) in prepared.items.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|(content, _)| content.clone()).collect();
            let appended = match self.embed_normalized(&texts).await {
                Ok(vectors) => self.append_batch(batch, vectors),
                Err(err) => Err(err),
            };
            match appended {
                Ok(added) => report.added += added,
                Err(err) => {
                    report.skipped_batches += 1;
                    tracing::warn!(
                        "Skipping batch {} ({} chunks) in flat store: {}",
                        index,
                        batch.len(),
                        err
                    );
                }
            }
        }

        tracing::info!(
            "Added {}/{} chunks to flat store",
            report.added,
            report.requested
        );
        Ok(report)
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if self.refresh_on_query {
            self.refresh_if_stale().await;
        }
        if self.len()? == 0 {
            return Ok(Vec::new());
        }

        let mut query_vector = self.embedder.encode_one(query).await?;
        crate::embedding::check_dimensions(
            std::slice::from_ref(&query_vector),
            self.embedder.dimension(),
        )?;
        normalize(&mut query_vector);

        let state = self.read_state()?;
        Ok(state
            .index
            .search(&query_vector, k)
            .into_iter()
            .map(|(row, score)| RetrievalResult {
                document: state.documents[row].clone(),
                metadata: state.metadata[row].clone(),
                score: clamp_score(score),
            })
            .collect())
    }

    async fn save(&self) -> Result<(), RagError> {
        let _writer = self.writer.lock().await;
        let generation = Uuid::new_v4();

        let (index_bytes, documents_bytes, count) = {
            let state = self.read_state()?;
            let documents = SnapshotDocuments {
                generation: generation.to_string(),
                model: self.embedder.model_name().to_string(),
                ids: state.ids.clone(),
                documents: state.documents.clone(),
                metadata: state.metadata.clone(),
            };
            let documents_bytes = serde_json::to_vec(&documents).map_err(RagError::snapshot)?;
            (
                state.index.encode(generation),
                documents_bytes,
                state.documents.len(),
            )
        };

        let paths = self.paths.clone();
        tokio::task::spawn_blocking(move || {
            write_snapshot(&paths, &index_bytes, &documents_bytes)
        })
        .await
        .map_err(RagError::snapshot)??;

        let mut state = self.write_state()?;
        state.generation = Some(generation);
        state.dirty = false;
        tracing::info!(
            "Saved flat snapshot with {} chunks to {}",
            count,
            self.paths.dir.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<(), RagError> {
        let _writer = self.writer.lock().await;
        self.load_locked().await
    }

    async fn get_all_documents(&self) -> Result<Vec<DocumentRecord>, RagError> {
        let state = self.read_state()?;
        Ok(state
            .documents
            .iter()
            .zip(&state.metadata)
            .map(|(content, metadata)| DocumentRecord {
                content: content.clone(),
                metadata: metadata.clone(),
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<StoreStats, RagError> {
        let state = self.read_state()?;
        Ok(StoreStats {
            total_documents: state.documents.len(),
            index_size: state.index.len(),
            dimension: self.embedder.dimension(),
            model: self.embedder.model_name().to_string(),
            kind: StoreKind::Flat,
        })
    }

    async fn wipe(&self) -> Result<(), RagError> {
        let _writer = self.writer.lock().await;
        let paths = self.paths.clone();
        tokio::task::spawn_blocking(move || paths.remove_all())
            .await
            .map_err(RagError::store)??;

        *self.write_state()? = FlatState::empty(self.embedder.dimension());
        tracing::info!("Wiped flat store at {}", self.paths.dir.display());
        Ok(())
    }
}
