use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{Job, JobOutcome, JobStatus, MatchResult, NewJob, TransitionError};

pub mod memory;
pub mod queries;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persistent job records.
///
/// Every write after `claim` names the claiming worker; a store rejects writes
/// from a worker that no longer owns the job with [`StoreError::LostClaim`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job.
    async fn create(&self, new: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically take the oldest claimable job (pending, or processing with
    /// a heartbeat older than `lease`) and mark it processing for `worker`.
    /// Concurrent callers never receive the same job.
    async fn claim(&self, worker: Uuid, lease: Duration) -> Result<Option<Job>, StoreError>;

    /// Record the corpus size. Allowed once per job.
    async fn set_total(&self, id: Uuid, worker: Uuid, total: i32) -> Result<(), StoreError>;

    /// Persist `progress` (exactly one more than the stored value) and append
    /// `hit` to the results when present.
    async fn advance(
        &self,
        id: Uuid,
        worker: Uuid,
        progress: i32,
        hit: Option<&MatchResult>,
    ) -> Result<(), StoreError>;

    /// Move the job to its terminal status.
    async fn finish(&self, id: Uuid, worker: Uuid, outcome: &JobOutcome) -> Result<(), StoreError>;

    /// Jobs in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Number of jobs in `status`.
    async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored results are not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} is no longer owned by this worker")]
    LostClaim(Uuid),

    #[error("Invalid transition for job {id}: {source}")]
    Transition {
        id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error("Unknown job status in store: {0}")]
    UnknownStatus(String),
}

impl StoreError {
    pub(crate) fn transition(id: Uuid, source: TransitionError) -> Self {
        match source {
            TransitionError::NotOwner | TransitionError::WrongStatus(..) => {
                StoreError::LostClaim(id)
            }
            source => StoreError::Transition { id, source },
        }
    }
}
