use sqlx::PgPool;
use std::sync::Arc;

use crate::db::JobStore;
use crate::services::{queue::JobNotifier, submission::JobSubmissionService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub submissions: Arc<JobSubmissionService>,
    pub notifier: Option<Arc<JobNotifier>>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        store: Arc<dyn JobStore>,
        submissions: JobSubmissionService,
        notifier: Option<Arc<JobNotifier>>,
    ) -> Self {
        Self {
            db,
            store,
            submissions: Arc::new(submissions),
            notifier,
        }
    }
}
