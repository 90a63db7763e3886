//! Background ingestion jobs.
//!
//! Jobs run as spawned tokio tasks; a semaphore caps how many ingest at once.
//! Each job goes through the engine and so acquires its own store handle
//! from the factory. Jobs run to completion and are never cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, RwLock, Semaphore};
use uuid::Uuid;

use crate::rag::{AddReport, DocumentRecord, RagEngine};

/// How long finished jobs stay queryable.
const DEFAULT_RETENTION_MINUTES: i64 = 60;

/// What a job submitter eventually receives.
pub type JobOutcome = Result<AddReport, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed { added: usize },
    Failed { error: String },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(flatten)]
    pub status: JobStatus,
    pub documents: usize,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type Registry = Arc<RwLock<HashMap<String, JobRecord>>>;

#[derive(Clone)]
pub struct JobRunner {
    engine: Arc<RagEngine>,
    permits: Arc<Semaphore>,
    jobs: Registry,
    retention: Duration,
}

impl JobRunner {
    pub fn new(engine: Arc<RagEngine>, workers: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            retention: Duration::minutes(DEFAULT_RETENTION_MINUTES),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Queue `records` for ingestion and return the job id together with a
    /// receiver that resolves once the job finishes.
    pub async fn submit_ingest(
        &self,
        records: Vec<DocumentRecord>,
    ) -> (String, oneshot::Receiver<JobOutcome>) {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        prune_finished(&mut jobs, now - self.retention);
        jobs.insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                status: JobStatus::Queued,
                documents: records.len(),
                submitted_at: now,
                updated_at: now,
            },
        );
        drop(jobs);

        let (tx, rx) = oneshot::channel();
        let engine = self.engine.clone();
        let permits = self.permits.clone();
        let jobs = self.jobs.clone();
        let job_id = id.clone();

        tokio::spawn(async move {
            // Only fails if the semaphore was closed.
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    let error = err.to_string();
                    set_status(&jobs, &job_id, JobStatus::Failed { error: error.clone() }).await;
                    let _ = tx.send(Err(error));
                    return;
                }
            };

            set_status(&jobs, &job_id, JobStatus::Running).await;
            tracing::info!("Ingestion job {} started", job_id);

            let outcome = engine.add_documents(records).await.map_err(|err| err.to_string());
            match &outcome {
                Ok(report) => {
                    tracing::info!(
                        "Ingestion job {} completed: {} added, {} batches skipped",
                        job_id,
                        report.added,
                        report.skipped_batches
                    );
                    set_status(&jobs, &job_id, JobStatus::Completed { added: report.added }).await;
                }
                Err(error) => {
                    tracing::error!("Ingestion job {} failed: {}", job_id, error);
                    set_status(&jobs, &job_id, JobStatus::Failed { error: error.clone() }).await;
                }
            }

            // The submitter may have stopped listening.
            let _ = tx.send(outcome);
        });

        (id, rx)
    }

    pub async fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).cloned()
    }
}

/// Forget finished jobs last updated before `cutoff`.
fn prune_finished(jobs: &mut HashMap<String, JobRecord>, cutoff: DateTime<Utc>) {
    let before = jobs.len();
    jobs.retain(|_, record| !record.status.is_finished() || record.updated_at >= cutoff);
    let pruned = before - jobs.len();
    if pruned > 0 {
        tracing::debug!("Pruned {} finished ingestion jobs", pruned);
    }
}

async fn set_status(jobs: &Registry, job_id: &str, status: JobStatus) {
    if let Some(record) = jobs.write().await.get_mut(job_id) {
        record.status = status;
        record.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EmbeddingConfig, StoreConfig};
    use crate::embedding::EmbeddingProviderKind;
    use crate::rag::test_support::{hashing, meta, ScriptedGenerator};
    use crate::rag::{ContextSettings, GenerationSettings, StoreFactory, StoreKind};
    use serde_json::json;
    use std::path::Path;

    fn store_config(root: &Path) -> StoreConfig {
        StoreConfig {
            kind: StoreKind::Flat,
            sqlite_path: root.join("rag.db"),
            flat_path: root.join("flat_store"),
            batch_size: 2,
            refresh_on_query: false,
        }
    }

    fn runner(factory: StoreFactory, workers: usize) -> JobRunner {
        let engine = RagEngine::new(
            Arc::new(factory),
            ScriptedGenerator::replying("ok"),
            GenerationSettings::default(),
            ContextSettings::default(),
        );
        JobRunner::new(Arc::new(engine), workers)
    }

    fn records(n: usize) -> Vec<DocumentRecord> {
        (0..n)
            .map(|i| DocumentRecord {
                content: format!("document number {}", i),
                metadata: meta(json!({"chunk_id": i})),
            })
            .collect()
    }

    #[tokio::test]
    async fn completed_job_reports_added_count() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(StoreFactory::with_embedder(store_config(tmp.path()), hashing(16)), 2);

        let (id, done) = runner.submit_ingest(records(5)).await;
        let report = done.await.unwrap().unwrap();

        assert_eq!(report.added, 5);
        let record = runner.status(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed { added: 5 });
        assert_eq!(record.documents, 5);
        assert!(record.updated_at >= record.submitted_at);
    }

    #[tokio::test]
    async fn jobs_queue_behind_a_single_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(StoreFactory::with_embedder(store_config(tmp.path()), hashing(16)), 1);

        let (first, first_done) = runner.submit_ingest(records(3)).await;
        let (second, second_done) = runner.submit_ingest(records(4)).await;

        assert_eq!(first_done.await.unwrap().unwrap().added, 3);
        assert_eq!(second_done.await.unwrap().unwrap().added, 4);
        assert!(runner.status(&first).await.unwrap().status.is_finished());
        assert!(runner.status(&second).await.unwrap().status.is_finished());
        assert_eq!(runner.engine.stats().await.unwrap().total_documents, 7);
    }

    #[tokio::test]
    async fn unusable_embedding_model_fails_the_job() {
        let tmp = tempfile::tempdir().unwrap();
        let embedding = EmbeddingConfig {
            provider: EmbeddingProviderKind::Remote,
            base_url: "http://127.0.0.1:9/v1".to_string(),
            ..EmbeddingConfig::default()
        };
        let runner = runner(StoreFactory::new(store_config(tmp.path()), embedding), 1);

        let (id, done) = runner.submit_ingest(records(1)).await;
        let error = done.await.unwrap().unwrap_err();

        assert!(error.contains("failed to load embedding model"));
        assert!(matches!(
            runner.status(&id).await.unwrap().status,
            JobStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn finished_jobs_expire_after_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(StoreFactory::with_embedder(store_config(tmp.path()), hashing(16)), 1)
            .with_retention(Duration::zero());

        let (old, done) = runner.submit_ingest(records(1)).await;
        done.await.unwrap().unwrap();
        assert!(runner.status(&old).await.is_some());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let (new, done) = runner.submit_ingest(records(1)).await;
        assert!(runner.status(&old).await.is_none());
        assert!(runner.status(&new).await.is_some());
        done.await.unwrap().unwrap();
    }

    #[test]
    fn pruning_keeps_unfinished_and_recent_jobs() {
        let now = Utc::now();
        let record = |id: &str, status: JobStatus, age_minutes: i64| JobRecord {
            id: id.to_string(),
            status,
            documents: 1,
            submitted_at: now - Duration::minutes(age_minutes),
            updated_at: now - Duration::minutes(age_minutes),
        };
        let mut jobs: HashMap<String, JobRecord> = [
            record("stale-done", JobStatus::Completed { added: 1 }, 120),
            record("stale-failed", JobStatus::Failed { error: "x".to_string() }, 120),
            record("stale-running", JobStatus::Running, 120),
            record("fresh-done", JobStatus::Completed { added: 1 }, 5),
        ]
        .into_iter()
        .map(|job| (job.id.clone(), job))
        .collect();

        prune_finished(&mut jobs, now - Duration::minutes(60));

        let mut left: Vec<&str> = jobs.keys().map(String::as_str).collect();
        left.sort();
        assert_eq!(left, vec!["fresh-done", "stale-running"]);
    }

    #[tokio::test]
    async fn unknown_job_has_no_status() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(StoreFactory::with_embedder(store_config(tmp.path()), hashing(8)), 1);
        assert!(runner.status("missing").await.is_none());
    }
}
