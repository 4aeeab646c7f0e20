use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::models::photo::PhotoHandle;

/// Status of a photo search job.
///
/// Transitions only move forward: `Pending -> Processing -> Completed | Failed`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A photo that contained the searched face.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub session_id: String,
    pub photo: PhotoHandle,
    /// Comparator distance; lower is more similar.
    pub score: f64,
    pub matched: bool,
}

/// Data needed to create a pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub query_face_key: String,
    pub identity_hint: Option<String>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Failed(message) => Some(message),
        }
    }
}

/// A persisted photo search request with its progress and results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub query_face_key: String,
    pub identity_hint: Option<String>,
    pub progress: i32,
    /// Number of photos in the corpus; `None` until enumeration finished.
    pub total: Option<i32>,
    pub results: Vec<MatchResult>,
    pub error: Option<String>,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("job is {0}, expected {1}")]
    WrongStatus(JobStatus, JobStatus),

    #[error("job is owned by another worker")]
    NotOwner,

    #[error("job is not claimable")]
    NotClaimable,

    #[error("total already set to {0}")]
    TotalAlreadySet(i32),

    #[error("total must be set before progress is recorded")]
    TotalUnknown,

    #[error("progress {next} does not follow {current} (total {total})")]
    ProgressOutOfOrder { current: i32, next: i32, total: i32 },
}

impl Job {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            status: JobStatus::Pending,
            query_face_key: new.query_face_key,
            identity_hint: new.identity_hint,
            progress: 0,
            total: None,
            results: Vec::new(),
            error: None,
            claimed_by: None,
            claimed_at: None,
            heartbeat_at: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Whether a worker may claim this job: it is pending, or its owner
    /// stopped heartbeating for longer than `lease`.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Processing => match self.heartbeat_at {
                Some(beat) => beat
                    .checked_add_signed(lease)
                    .is_some_and(|expiry| expiry <= now),
                None => true,
            },
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    pub fn claim(
        &mut self,
        worker: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<(), TransitionError> {
        if !self.is_claimable(now, lease) {
            return Err(TransitionError::NotClaimable);
        }
        self.status = JobStatus::Processing;
        self.claimed_by = Some(worker);
        self.claimed_at = Some(now);
        self.heartbeat_at = Some(now);
        Ok(())
    }

    pub fn set_total(
        &mut self,
        worker: Uuid,
        total: i32,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_owner(worker)?;
        if let Some(existing) = self.total {
            return Err(TransitionError::TotalAlreadySet(existing));
        }
        self.total = Some(total);
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// Record that photo number `progress` was inspected, appending `hit`
    /// when it matched. Progress moves by exactly one per call.
    pub fn advance(
        &mut self,
        worker: Uuid,
        progress: i32,
        hit: Option<MatchResult>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_owner(worker)?;
        let total = self.total.ok_or(TransitionError::TotalUnknown)?;
        if progress != self.progress + 1 || progress > total {
            return Err(TransitionError::ProgressOutOfOrder {
                current: self.progress,
                next: progress,
                total,
            });
        }
        self.progress = progress;
        self.results.extend(hit);
        self.heartbeat_at = Some(now);
        Ok(())
    }

    pub fn finish(
        &mut self,
        worker: Uuid,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_owner(worker)?;
        self.status = outcome.status();
        self.error = outcome.error().map(str::to_string);
        self.completed_at = Some(now);
        Ok(())
    }

    fn ensure_owner(&self, worker: Uuid) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(TransitionError::WrongStatus(
                self.status,
                JobStatus::Processing,
            ));
        }
        if self.claimed_by != Some(worker) {
            return Err(TransitionError::NotOwner);
        }
        Ok(())
    }
}
