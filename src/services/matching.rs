use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use strum::IntoStaticStr;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::job::{Job, JobOutcome, MatchResult};
use crate::models::photo::{CorpusEntry, PhotoHandle};
use crate::services::comparator::{CompareError, FaceComparator, PreparedQuery};
use crate::services::corpus::{PhotoCorpusSource, RetrievalError};
use crate::services::detector::{DetectError, Detection, FaceDetector};
use crate::services::storage::{BlobStore, StorageError};

/// Tuning knobs for one matching run.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    /// Upper bound for fetching, detecting and comparing a single photo.
    pub photo_timeout: Duration,
    /// Extra fetch attempts after the first failure.
    pub fetch_retries: u32,
    /// Delay before the first retry; doubled on every further attempt.
    pub retry_backoff: Duration,
    /// Photos inspected in parallel. Results are still recorded in corpus
    /// order.
    pub concurrency: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            photo_timeout: Duration::from_secs(60),
            fetch_retries: 2,
            retry_backoff: Duration::from_millis(500),
            concurrency: 1,
        }
    }
}

/// Errors that end a job as failed. The message is stored on the job.
#[derive(Debug, thiserror::Error)]
pub enum JobFatalError {
    #[error("Query photo could not be loaded: {0}")]
    QueryUnavailable(#[source] StorageError),

    #[error("Face detection failed on the query photo: {0}")]
    QueryDetection(#[source] DetectError),

    #[error("No face found in the query photo")]
    NoQueryFace,

    #[error("Query face could not be prepared: {0}")]
    QueryUnresolved(#[source] CompareError),

    #[error("Photo corpus could not be listed: {0}")]
    Enumeration(#[source] RetrievalError),

    #[error("Photo corpus has {0} entries, more than a job can track")]
    CorpusTooLarge(usize),
}

/// Why a run stopped before the corpus was exhausted.
#[derive(Debug)]
enum Abort {
    Fatal(JobFatalError),
    Store(StoreError),
}

impl From<JobFatalError> for Abort {
    fn from(e: JobFatalError) -> Self {
        Abort::Fatal(e)
    }
}

impl From<StoreError> for Abort {
    fn from(e: StoreError) -> Self {
        Abort::Store(e)
    }
}

/// What happened to one corpus position.
#[derive(Debug, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum PhotoOutcome {
    Matched(MatchResult),
    NoMatch,
    NoFace,
    FetchFailed,
    DetectFailed,
    CompareFailed,
    TimedOut,
    /// Position recorded in the job's total but gone from the current listing.
    Missing,
}

/// Runs one claimed job: detects the query face, walks the corpus and
/// records progress and matches through the job store.
pub struct MatchingEngine {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    corpus: Arc<dyn PhotoCorpusSource>,
    detector: Arc<dyn FaceDetector>,
    comparator: Arc<dyn FaceComparator>,
    settings: MatchSettings,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        corpus: Arc<dyn PhotoCorpusSource>,
        detector: Arc<dyn FaceDetector>,
        comparator: Arc<dyn FaceComparator>,
        settings: MatchSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            corpus,
            detector,
            comparator,
            settings,
        }
    }

    /// Process `job`, which `worker` has claimed. Resumes at the job's stored
    /// progress.
    ///
    /// Returns the outcome to finalize the job with. Store errors, including
    /// [`StoreError::LostClaim`], are returned as `Err` and the job must not be
    /// finalized by this worker.
    pub async fn run(&self, job: &Job, worker: Uuid) -> Result<JobOutcome, StoreError> {
        match self.search(job, worker).await {
            Ok(()) => Ok(JobOutcome::Completed),
            Err(Abort::Fatal(e)) => {
                tracing::warn!(job_id = %job.id, worker_id = %worker, error = %e, "Search failed");
                Ok(JobOutcome::Failed(e.to_string()))
            }
            Err(Abort::Store(e)) => Err(e),
        }
    }

    async fn search(&self, job: &Job, worker: Uuid) -> Result<(), Abort> {
        let query = self.prepare_query(job).await?;

        let entries: Vec<CorpusEntry> = self
            .corpus
            .enumerate()
            .try_collect()
            .await
            .map_err(JobFatalError::Enumeration)?;

        let total = match job.total {
            Some(total) => total,
            None => {
                let total = i32::try_from(entries.len())
                    .map_err(|_| JobFatalError::CorpusTooLarge(entries.len()))?;
                self.store.set_total(job.id, worker, total).await?;
                total
            }
        };

        tracing::info!(
            job_id = %job.id,
            worker_id = %worker,
            total,
            listed = entries.len(),
            resume_from = job.progress,
            "Scanning photo corpus"
        );

        let start = usize::try_from(job.progress).unwrap_or(0);
        let end = usize::try_from(total).unwrap_or(0);
        let mut outcomes = stream::iter(start..end)
            .map(|position| self.inspect(entries.get(position), &query))
            .buffered(self.settings.concurrency.max(1));

        let mut progress = job.progress;
        let mut matches = 0usize;
        while let Some(outcome) = outcomes.next().await {
            progress += 1;
            let label: &'static str = (&outcome).into();
            metrics::counter!("photo_search_photos_total", "outcome" => label).increment(1);

            let hit = match outcome {
                PhotoOutcome::Matched(hit) => Some(hit),
                _ => None,
            };
            matches += usize::from(hit.is_some());
            self.store
                .advance(job.id, worker, progress, hit.as_ref())
                .await?;
        }

        tracing::info!(
            job_id = %job.id,
            worker_id = %worker,
            progress,
            matches,
            "Corpus scan finished"
        );
        Ok(())
    }

    async fn prepare_query(&self, job: &Job) -> Result<PreparedQuery, JobFatalError> {
        let bytes = self
            .blobs
            .get(&job.query_face_key)
            .await
            .map_err(JobFatalError::QueryUnavailable)?;

        let sample = match self
            .detector
            .detect(&bytes, &job.query_face_key)
            .await
            .map_err(JobFatalError::QueryDetection)?
        {
            Detection::Face(sample) => sample,
            Detection::NoFace => return Err(JobFatalError::NoQueryFace),
        };

        self.comparator
            .prepare(sample, job.identity_hint.as_deref())
            .await
            .map_err(JobFatalError::QueryUnresolved)
    }

    async fn inspect(&self, entry: Option<&CorpusEntry>, query: &PreparedQuery) -> PhotoOutcome {
        let Some(entry) = entry else {
            return PhotoOutcome::Missing;
        };

        match tokio::time::timeout(self.settings.photo_timeout, self.examine(entry, query)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    photo_id = %entry.photo.external_id,
                    timeout_ms = self.settings.photo_timeout.as_millis() as u64,
                    "Photo timed out, skipping"
                );
                PhotoOutcome::TimedOut
            }
        }
    }

    async fn examine(&self, entry: &CorpusEntry, query: &PreparedQuery) -> PhotoOutcome {
        let photo = &entry.photo;
        let bytes = match self.fetch_with_retry(photo).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(photo_id = %photo.external_id, error = %e, "Photo fetch failed, skipping");
                return PhotoOutcome::FetchFailed;
            }
        };

        let sample = match self.detector.detect(&bytes, &photo.external_id).await {
            Ok(Detection::Face(sample)) => sample,
            Ok(Detection::NoFace) => return PhotoOutcome::NoFace,
            Err(e) => {
                tracing::debug!(photo_id = %photo.external_id, error = %e, "Photo not decodable, skipping");
                return PhotoOutcome::DetectFailed;
            }
        };

        match self.comparator.compare(query, &sample).await {
            Ok(verdict) if verdict.is_match => {
                tracing::debug!(photo_id = %photo.external_id, score = verdict.score, "Face matched");
                PhotoOutcome::Matched(MatchResult {
                    session_id: entry.session_id.clone(),
                    photo: photo.clone(),
                    score: verdict.score,
                    matched: true,
                })
            }
            Ok(_) => PhotoOutcome::NoMatch,
            Err(e) => {
                tracing::warn!(photo_id = %photo.external_id, error = %e, "Comparison failed, skipping");
                PhotoOutcome::CompareFailed
            }
        }
    }

    async fn fetch_with_retry(&self, photo: &PhotoHandle) -> Result<Vec<u8>, RetrievalError> {
        let mut delay = self.settings.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.corpus.fetch(photo).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < self.settings.fetch_retries => {
                    attempt += 1;
                    tracing::debug!(
                        photo_id = %photo.external_id,
                        attempt,
                        error = %e,
                        "Retrying photo fetch"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
