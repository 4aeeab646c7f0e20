use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::job::{JobOutcome, JobStatus};
use crate::services::matching::MatchingEngine;
use crate::services::queue::JobNotifier;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// How long an idle dispatcher waits before polling again.
    pub poll_interval: Duration,
    /// How long a processing job may go without a heartbeat before another
    /// dispatcher may reclaim it.
    pub lease: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lease: Duration::from_secs(600),
        }
    }
}

/// Claims jobs one at a time and drives each through the matching engine to
/// a terminal status.
pub struct JobDispatcher {
    worker_id: Uuid,
    store: Arc<dyn JobStore>,
    engine: MatchingEngine,
    notifier: Option<Arc<JobNotifier>>,
    settings: DispatcherSettings,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn JobStore>, engine: MatchingEngine, settings: DispatcherSettings) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            store,
            engine,
            notifier: None,
            settings,
        }
    }

    /// Block on Redis wake-ups while idle instead of sleeping.
    pub fn with_notifier(mut self, notifier: Arc<JobNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Claim and process at most one job.
    /// Returns `Ok(true)` if a job was claimed, `Ok(false)` if none was available.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(job) = self.store.claim(self.worker_id, self.settings.lease).await? else {
            return Ok(false);
        };

        tracing::info!(
            job_id = %job.id,
            worker_id = %self.worker_id,
            progress = job.progress,
            total = ?job.total,
            "Processing search job"
        );
        let started = Instant::now();

        let outcome = match self.engine.run(&job, self.worker_id).await {
            Ok(outcome) => outcome,
            Err(StoreError::LostClaim(id)) => {
                tracing::warn!(job_id = %id, worker_id = %self.worker_id, "Claim taken over, abandoning job");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        match self.store.finish(job.id, self.worker_id, &outcome).await {
            Ok(()) => {}
            Err(StoreError::LostClaim(id)) => {
                tracing::warn!(job_id = %id, worker_id = %self.worker_id, "Claim taken over before finishing");
                return Ok(true);
            }
            Err(e) => return Err(e),
        }

        metrics::histogram!("photo_search_job_seconds").record(started.elapsed().as_secs_f64());
        match &outcome {
            JobOutcome::Completed => {
                metrics::counter!("photo_search_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Search job completed"
                );
            }
            JobOutcome::Failed(error) => {
                metrics::counter!("photo_search_jobs_failed").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    error = %error,
                    "Search job failed"
                );
            }
        }
        Ok(true)
    }

    /// Process jobs until `shutdown` resolves. Shutdown is only observed
    /// between jobs.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        tracing::info!(worker_id = %self.worker_id, "Dispatcher started");

        loop {
            if (&mut shutdown).now_or_never().is_some() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(claimed) => !claimed,
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "Error processing job, will retry");
                    true
                }
            };
            self.sample_queue_depth().await;

            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = self.wait_for_work() => {}
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Dispatcher stopped");
    }

    async fn wait_for_work(&self) {
        let Some(notifier) = &self.notifier else {
            tokio::time::sleep(self.settings.poll_interval).await;
            return;
        };
        match notifier.wait(self.settings.poll_interval).await {
            Ok(true) => tracing::debug!("Woken by job notification"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Wake-up queue unavailable, polling");
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
    }

    async fn sample_queue_depth(&self) {
        match self.store.count_by_status(JobStatus::Pending).await {
            Ok(pending) => metrics::gauge!("photo_search_queue_depth").set(pending as f64),
            Err(e) => tracing::debug!(error = %e, "Could not sample queue depth"),
        }
    }
}
