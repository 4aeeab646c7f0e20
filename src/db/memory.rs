use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{Job, JobOutcome, JobStatus, MatchResult, NewJob};

/// Job store kept in process memory. Claims are serialized by a single lock,
/// which makes them atomic across tasks of the same process.
#[derive(Default)]
pub struct MemoryJobStore {
    /// Insertion order doubles as claim order.
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_mut(jobs: &mut [Job], id: Uuid) -> Result<&mut Job, StoreError> {
    jobs.iter_mut()
        .find(|job| job.id == id)
        .ok_or(StoreError::NotFound(id))
}

fn lease_duration(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(new, Utc::now());
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.iter().find(|job| job.id == id).cloned())
    }

    async fn claim(&self, worker: Uuid, lease: Duration) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let lease = lease_duration(lease);
        let mut jobs = self.jobs.lock().await;

        let Some(job) = jobs.iter_mut().find(|job| job.is_claimable(now, lease)) else {
            return Ok(None);
        };

        job.claim(worker, now, lease)
            .map_err(|e| StoreError::transition(job.id, e))?;
        Ok(Some(job.clone()))
    }

    async fn set_total(&self, id: Uuid, worker: Uuid, total: i32) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        job.set_total(worker, total, Utc::now())
            .map_err(|e| StoreError::transition(id, e))
    }

    async fn advance(
        &self,
        id: Uuid,
        worker: Uuid,
        progress: i32,
        hit: Option<&MatchResult>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        job.advance(worker, progress, hit.cloned(), Utc::now())
            .map_err(|e| StoreError::transition(id, e))
    }

    async fn finish(&self, id: Uuid, worker: Uuid, outcome: &JobOutcome) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        job.finish(worker, outcome, Utc::now())
            .map_err(|e| StoreError::transition(id, e))
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .iter()
            .filter(|job| job.status == status)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.iter().filter(|job| job.status == status).count() as i64)
    }
}
