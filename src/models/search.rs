use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, MatchResult};

/// Metadata sent alongside a query-face upload.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SearchRequest {
    /// Enrolled identity the searcher claims to be. Only the classifier
    /// strategy uses it.
    #[garde(length(min = 1, max = 128))]
    pub identity: Option<String>,
}

/// Response after submitting a face for search.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub job_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress: i32,
    pub total: Option<i32>,
    pub results: Vec<MatchResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status.to_string(),
            progress: job.progress,
            total: job.total,
            results: job.results,
            error: job.error,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Query string for listing jobs.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}
