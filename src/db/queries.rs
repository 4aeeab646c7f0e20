use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{Job, JobOutcome, JobStatus, MatchResult, NewJob};

/// Column list for `photo_search_jobs` queries.
const COLUMNS: &str = "\
    id, status, query_face_key, identity_hint, progress, total, results, error, \
    claimed_by, claimed_at, heartbeat_at, created_at, completed_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    query_face_key: String,
    identity_hint: Option<String>,
    progress: i32,
    total: Option<i32>,
    results: Json<Vec<MatchResult>>,
    error: Option<String>,
    claimed_by: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|_| StoreError::UnknownStatus(row.status.clone()))?;

        Ok(Job {
            id: row.id,
            status,
            query_face_key: row.query_face_key,
            identity_hint: row.identity_hint,
            progress: row.progress,
            total: row.total,
            results: row.results.0,
            error: row.error,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Writes guarded by ownership affect zero rows once the claim is gone.
    fn owned(id: Uuid, rows_affected: u64) -> Result<(), StoreError> {
        if rows_affected == 0 {
            Err(StoreError::LostClaim(id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let query = format!(
            "INSERT INTO photo_search_jobs (id, status, query_face_key, identity_hint) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(new.id)
            .bind(JobStatus::Pending.as_str())
            .bind(&new.query_face_key)
            .bind(&new.identity_hint)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM photo_search_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent dispatchers never
    /// take the same row.
    async fn claim(&self, worker: Uuid, lease: Duration) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "UPDATE photo_search_jobs \
             SET status = $2, claimed_by = $1, claimed_at = NOW(), heartbeat_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM photo_search_jobs \
                 WHERE status = $3 \
                    OR (status = $2 AND heartbeat_at <= NOW() - make_interval(secs => $4)) \
                 ORDER BY created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(worker)
            .bind(JobStatus::Processing.as_str())
            .bind(JobStatus::Pending.as_str())
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn set_total(&self, id: Uuid, worker: Uuid, total: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE photo_search_jobs \
             SET total = $3, heartbeat_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND status = $4 AND total IS NULL",
        )
        .bind(id)
        .bind(worker)
        .bind(total)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Self::owned(id, result.rows_affected())
    }

    async fn advance(
        &self,
        id: Uuid,
        worker: Uuid,
        progress: i32,
        hit: Option<&MatchResult>,
    ) -> Result<(), StoreError> {
        let appended = Json(hit.into_iter().collect::<Vec<_>>());
        let result = sqlx::query(
            "UPDATE photo_search_jobs \
             SET progress = $3, results = results || $4, heartbeat_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND status = $5 \
               AND progress = $3 - 1 AND $3 <= total",
        )
        .bind(id)
        .bind(worker)
        .bind(progress)
        .bind(appended)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Self::owned(id, result.rows_affected())
    }

    async fn finish(&self, id: Uuid, worker: Uuid, outcome: &JobOutcome) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE photo_search_jobs \
             SET status = $3, error = $4, completed_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND status = $5",
        )
        .bind(id)
        .bind(worker)
        .bind(outcome.status().as_str())
        .bind(outcome.error())
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Self::owned(id, result.rows_affected())
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM photo_search_jobs \
             WHERE status = $1 \
             ORDER BY created_at ASC \
             LIMIT $2"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM photo_search_jobs WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
