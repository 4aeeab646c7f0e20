use garde::Validate;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::job::{Job, NewJob};
use crate::models::search::SearchRequest;
use crate::services::detector::{DetectError, Detection, FaceDetector};
use crate::services::queue::JobNotifier;
use crate::services::storage::{BlobStore, StorageError};

/// Blob store prefix under which query uploads are staged.
pub const QUERY_PREFIX: &str = "search-queries";

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] garde::Report),

    #[error("No image was uploaded")]
    EmptyUpload,

    #[error("Uploaded file is not a recognised image format")]
    UnsupportedFormat,

    #[error("Uploaded image could not be decoded: {0}")]
    Undecodable(#[source] DetectError),

    #[error("Face detection is unavailable: {0}")]
    Detector(#[source] DetectError),

    #[error("No face found in the uploaded image")]
    NoFace,

    #[error("Query photo could not be staged: {0}")]
    Storage(#[from] StorageError),

    #[error("Job could not be created: {0}")]
    Store(#[from] StoreError),
}

impl SubmitError {
    /// Only decode failures are the uploader's fault; locator and task
    /// failures are outages.
    fn from_detect(error: DetectError) -> Self {
        match error {
            DetectError::Decode(_) => SubmitError::Undecodable(error),
            DetectError::Locator(_) | DetectError::Task(_) => SubmitError::Detector(error),
        }
    }
}

/// Validates query uploads and turns them into pending jobs.
pub struct JobSubmissionService {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    detector: Arc<dyn FaceDetector>,
    notifier: Option<Arc<JobNotifier>>,
}

impl JobSubmissionService {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        detector: Arc<dyn FaceDetector>,
        notifier: Option<Arc<JobNotifier>>,
    ) -> Self {
        Self {
            store,
            blobs,
            detector,
            notifier,
        }
    }

    /// Stage `image` and create a pending job for it. Nothing is stored when
    /// the upload is rejected.
    pub async fn submit(&self, image: &[u8], request: SearchRequest) -> Result<Job, SubmitError> {
        request.validate()?;

        if image.is_empty() {
            return Err(SubmitError::EmptyUpload);
        }
        let format = image::guess_format(image).map_err(|_| SubmitError::UnsupportedFormat)?;

        match self
            .detector
            .detect(image, "upload")
            .await
            .map_err(SubmitError::from_detect)?
        {
            Detection::Face(_) => {}
            Detection::NoFace => return Err(SubmitError::NoFace),
        }

        let id = Uuid::new_v4();
        let key = format!("{QUERY_PREFIX}/{id}");
        self.blobs.put(&key, image, format.to_mime_type()).await?;

        let job = self
            .store
            .create(NewJob {
                id,
                query_face_key: key,
                identity_hint: request.identity,
            })
            .await?;

        metrics::counter!("photo_search_jobs_submitted").increment(1);
        tracing::info!(job_id = %job.id, size_bytes = image.len(), "Search job submitted");

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to publish wake-up, workers will poll");
            }
        }

        Ok(job)
    }
}
