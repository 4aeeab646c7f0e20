//! Test helpers: in-process fakes for the pipeline and HTTP helpers for E2E testing
#![allow(dead_code)]

use async_trait::async_trait;
use face_search::{
    db::MemoryJobStore,
    models::photo::{CorpusEntry, FaceSample, PhotoHandle},
    services::{
        comparator::{
            ClassifierComparator, ComparisonStrategy, CompareError, EmbeddingComparator,
            FaceComparator, FaceEmbedder,
        },
        corpus::{PhotoCorpusSource, RetrievalError},
        detector::{
            CroppingDetector, DetectError, Detection, FaceBox, FaceDetector, FaceLocator,
        },
        dispatcher::{DispatcherSettings, JobDispatcher},
        encryption::{EncryptionService, SealedBlobStore},
        lbph::{LbphModel, LbphParams},
        matching::{MatchSettings, MatchingEngine},
        storage::{BlobStore, StorageError},
        submission::JobSubmissionService,
    },
};
use futures::stream::{self, BoxStream, StreamExt};
use image::{GrayImage, ImageFormat, Luma};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// 32 zero bytes, base64-encoded.
pub const TEST_ENCRYPTION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Cosine distance threshold for the intensity embedder. Equal gray levels
/// sit at 0, levels 40 apart already exceed it.
pub const TEST_THRESHOLD: f64 = 0.1;

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// PNG of a flat gray frame. Level 0 (black) contains no face for
/// [`BrightFrameLocator`]; every other level is one face filling the frame.
pub fn gray_png(level: u8) -> Vec<u8> {
    let frame = GrayImage::from_pixel(64, 48, Luma([level]));
    let mut buffer = Cursor::new(Vec::new());
    frame.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// PNG of horizontal bands 4 pixels tall, brightened by `offset`.
pub fn stripes_png(offset: u8) -> Vec<u8> {
    patterned_png(|_, y| if (y / 4) % 2 == 0 { 60 } else { 160 }, offset)
}

/// PNG of 6 pixel checker squares, brightened by `offset`.
pub fn checkerboard_png(offset: u8) -> Vec<u8> {
    patterned_png(|x, y| if (x / 6 + y / 6) % 2 == 0 { 50 } else { 170 }, offset)
}

fn patterned_png(level: impl Fn(u32, u32) -> u8, offset: u8) -> Vec<u8> {
    let frame = GrayImage::from_fn(96, 96, |x, y| Luma([level(x, y) + offset]));
    let mut buffer = Cursor::new(Vec::new());
    frame.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// Error from a request to a port nothing listens on.
pub async fn unreachable_service() -> reqwest::Error {
    reqwest::Client::new()
        .get("http://127.0.0.1:1/")
        .send()
        .await
        .expect_err("nothing listens on port 1")
}

fn is_flat(pixels: &[u8], level: u8) -> bool {
    pixels.iter().all(|&p| p == level)
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.raw(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Corpus
// ---------------------------------------------------------------------------

/// How a fake corpus photo responds to `fetch`.
#[derive(Clone)]
pub enum Behavior {
    Serve(Vec<u8>),
    /// Every attempt fails.
    Fail,
    /// The fetch never completes.
    Hang,
    /// The first `n` attempts fail, later ones succeed.
    FailFirst(usize, Vec<u8>),
    /// Succeeds after a delay.
    Slow(Duration, Vec<u8>),
}

struct FakePhoto {
    entry: CorpusEntry,
    behavior: Behavior,
}

/// Corpus held in memory with scripted fetch behavior per photo.
#[derive(Default)]
pub struct StaticCorpus {
    photos: Vec<FakePhoto>,
    listing_fails_after: Option<usize>,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StaticCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a photo with id `id` in `session`.
    pub fn photo(mut self, session: &str, id: &str, behavior: Behavior) -> Self {
        self.photos.push(FakePhoto {
            entry: CorpusEntry {
                session_id: session.to_string(),
                photo: PhotoHandle {
                    external_id: id.to_string(),
                    display_name: format!("{id}.png"),
                    retrieval_ref: format!("memory://{id}"),
                    view_url: None,
                },
            },
            behavior,
        });
        self
    }

    /// Make listing fail after yielding `count` entries.
    pub fn listing_fails_after(mut self, count: usize) -> Self {
        self.listing_fails_after = Some(count);
        self
    }

    pub fn attempts(&self, id: &str) -> usize {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PhotoCorpusSource for StaticCorpus {
    fn enumerate(&self) -> BoxStream<'_, Result<CorpusEntry, RetrievalError>> {
        let entries = self.photos.iter().map(|photo| Ok(photo.entry.clone()));
        match self.listing_fails_after {
            Some(count) => stream::iter(entries.take(count))
                .chain(stream::once(async {
                    Err(RetrievalError::Unavailable("listing interrupted".to_string()))
                }))
                .boxed(),
            None => stream::iter(entries).boxed(),
        }
    }

    async fn fetch(&self, photo: &PhotoHandle) -> Result<Vec<u8>, RetrievalError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(photo.external_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let fake = self
            .photos
            .iter()
            .find(|p| p.entry.photo.external_id == photo.external_id)
            .ok_or_else(|| RetrievalError::Unavailable(photo.external_id.clone()))?;

        match &fake.behavior {
            Behavior::Serve(bytes) => Ok(bytes.clone()),
            Behavior::Fail => Err(RetrievalError::Unavailable(format!(
                "{} is gone",
                photo.external_id
            ))),
            Behavior::Hang => std::future::pending().await,
            Behavior::FailFirst(failures, bytes) => {
                if attempt <= *failures {
                    Err(RetrievalError::Unavailable(format!(
                        "{} attempt {attempt} failed",
                        photo.external_id
                    )))
                } else {
                    Ok(bytes.clone())
                }
            }
            Behavior::Slow(delay, bytes) => {
                sleep(*delay).await;
                Ok(bytes.clone())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Face models
// ---------------------------------------------------------------------------

/// Finds one face covering the whole frame unless the frame is entirely black.
pub struct BrightFrameLocator;

#[async_trait]
impl FaceLocator for BrightFrameLocator {
    async fn locate(&self, frame: &GrayImage) -> Result<Vec<FaceBox>, DetectError> {
        if frame.pixels().all(|p| p.0[0] == 0) {
            return Ok(Vec::new());
        }
        Ok(vec![FaceBox {
            x: 0,
            y: 0,
            width: i64::from(frame.width()),
            height: i64::from(frame.height()),
        }])
    }
}

/// [`BrightFrameLocator`], except that flat frames of `unreachable_level`
/// hit a locator service that is down.
pub struct PartialOutageLocator {
    pub unreachable_level: u8,
}

#[async_trait]
impl FaceLocator for PartialOutageLocator {
    async fn locate(&self, frame: &GrayImage) -> Result<Vec<FaceBox>, DetectError> {
        if is_flat(frame.as_raw(), self.unreachable_level) {
            return Err(DetectError::Locator(unreachable_service().await));
        }
        BrightFrameLocator.locate(frame).await
    }
}

/// [`IntensityEmbedder`], except that faces of `unreachable_level` hit an
/// embedding service that is down.
pub struct PartialOutageEmbedder {
    pub unreachable_level: u8,
}

#[async_trait]
impl FaceEmbedder for PartialOutageEmbedder {
    async fn embed(&self, sample: &FaceSample) -> Result<Vec<f32>, CompareError> {
        if is_flat(sample.pixels(), self.unreachable_level) {
            return Err(CompareError::Http(unreachable_service().await));
        }
        IntensityEmbedder.embed(sample).await
    }
}

/// Embeds a face as a unit vector whose angle grows with mean brightness.
pub struct IntensityEmbedder;

#[async_trait]
impl FaceEmbedder for IntensityEmbedder {
    async fn embed(&self, sample: &FaceSample) -> Result<Vec<f32>, CompareError> {
        let pixels = sample.pixels();
        let mean = pixels.iter().map(|&p| f32::from(p)).sum::<f32>() / pixels.len() as f32;
        let angle = mean / 255.0 * std::f32::consts::FRAC_PI_2;
        Ok(vec![angle.cos(), angle.sin()])
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// In-process pipeline: memory job store, encrypted memory blob store and a
/// scripted corpus.
pub struct Pipeline {
    pub store: Arc<MemoryJobStore>,
    pub raw_blobs: Arc<MemoryBlobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub corpus: Arc<StaticCorpus>,
    pub detector: Arc<dyn FaceDetector>,
    pub comparator: Arc<dyn FaceComparator>,
}

impl Pipeline {
    pub fn new(corpus: StaticCorpus) -> Self {
        let raw_blobs = Arc::new(MemoryBlobStore::default());
        let encryption = EncryptionService::new(TEST_ENCRYPTION_KEY).unwrap();
        Self {
            store: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(SealedBlobStore::new(raw_blobs.clone(), encryption)),
            raw_blobs,
            corpus: Arc::new(corpus),
            detector: Arc::new(CroppingDetector::new(Arc::new(BrightFrameLocator))),
            comparator: Arc::new(EmbeddingComparator::new(
                Arc::new(IntensityEmbedder),
                TEST_THRESHOLD,
            )),
        }
    }

    /// Swap in a detector built on `locator`.
    pub fn with_locator(mut self, locator: impl FaceLocator + 'static) -> Self {
        self.detector = Arc::new(CroppingDetector::new(Arc::new(locator)));
        self
    }

    /// Swap in the embedding strategy over `embedder`.
    pub fn with_embedder(mut self, embedder: impl FaceEmbedder + 'static) -> Self {
        self.comparator = Arc::new(EmbeddingComparator::new(Arc::new(embedder), TEST_THRESHOLD));
        self
    }

    /// Switch to the classifier strategy, enrolling each `(identity, image)`
    /// through the pipeline's own detector.
    pub async fn with_classifier(mut self, enrolled: &[(&str, Vec<u8>)]) -> Self {
        let mut samples = Vec::new();
        for (identity, image) in enrolled {
            match self.detector.detect(image, identity).await.unwrap() {
                Detection::Face(sample) => samples.push((*identity, sample)),
                Detection::NoFace => panic!("no face in enrollment image for {identity}"),
            }
        }
        let model = LbphModel::train(
            LbphParams::default(),
            samples.iter().map(|(identity, sample)| (*identity, sample)),
        );
        self.comparator = Arc::new(ClassifierComparator::new(
            model,
            ComparisonStrategy::Classifier.default_threshold(),
        ));
        self
    }

    pub fn submissions(&self) -> JobSubmissionService {
        JobSubmissionService::new(
            self.store.clone(),
            self.blobs.clone(),
            self.detector.clone(),
            None,
        )
    }

    pub fn engine(&self, settings: MatchSettings) -> MatchingEngine {
        MatchingEngine::new(
            self.store.clone(),
            self.blobs.clone(),
            self.corpus.clone(),
            self.detector.clone(),
            self.comparator.clone(),
            settings,
        )
    }

    pub fn dispatcher(&self, settings: MatchSettings) -> JobDispatcher {
        self.dispatcher_with_lease(settings, Duration::from_secs(600))
    }

    pub fn dispatcher_with_lease(&self, settings: MatchSettings, lease: Duration) -> JobDispatcher {
        JobDispatcher::new(
            self.store.clone(),
            self.engine(settings),
            DispatcherSettings {
                poll_interval: Duration::from_millis(10),
                lease,
            },
        )
    }
}

/// Settings with short delays so failure paths stay fast.
pub fn fast_settings() -> MatchSettings {
    MatchSettings {
        photo_timeout: Duration::from_secs(2),
        fetch_retries: 2,
        retry_backoff: Duration::from_millis(1),
        concurrency: 1,
    }
}

// ---------------------------------------------------------------------------
// HTTP (E2E)
// ---------------------------------------------------------------------------

/// Response from POST /api/v1/searches
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub job_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response from GET /api/v1/searches/{job_id}
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress: i32,
    pub total: Option<i32>,
    pub results: Vec<serde_json::Value>,
    pub error: Option<String>,
}

/// Upload a query face to the search endpoint. Returns the HTTP status and
/// the raw body.
pub async fn upload_face(
    client: &reqwest::Client,
    base_url: &str,
    image_bytes: Vec<u8>,
    filename: &str,
    identity: Option<&str>,
) -> Result<(reqwest::StatusCode, String), Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(image_bytes).file_name(filename.to_string()),
    );
    if let Some(identity) = identity {
        form = form.text("identity", identity.to_string());
    }

    let response = client
        .post(format!("{}/api/v1/searches", base_url))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    Ok((status, response.text().await?))
}

/// Upload a face image file and expect the job to be accepted.
pub async fn submit_face_file(
    client: &reqwest::Client,
    base_url: &str,
    image_path: &Path,
) -> Result<SearchResponse, Box<dyn std::error::Error>> {
    let image_bytes = std::fs::read(image_path)?;
    let filename = image_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("face.jpg");

    let (status, body) = upload_face(client, base_url, image_bytes, filename, None).await?;
    if !status.is_success() {
        return Err(format!("Upload failed with status {}: {}", status, body).into());
    }
    Ok(serde_json::from_str(&body)?)
}

/// Poll job status until completed or failed (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms
    let mut last_progress = 0;

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/searches/{}", base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status_response = response.json::<JobStatusResponse>().await?;
        if status_response.progress < last_progress {
            return Err(format!(
                "Progress went backwards: {} -> {}",
                last_progress, status_response.progress
            )
            .into());
        }
        last_progress = status_response.progress;

        match status_response.status.as_str() {
            "completed" | "failed" => return Ok(status_response),
            "pending" | "processing" => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!(
                        "  ... still waiting (attempt {}/{}, progress {}/{:?})",
                        attempt, max_attempts, status_response.progress, status_response.total
                    );
                }
                sleep(Duration::from_millis(500)).await;
            }
            _ => {
                return Err(format!("Unknown job status: {}", status_response.status).into());
            }
        }
    }

    Err(format!("Job did not complete within {} seconds", timeout_secs).into())
}
