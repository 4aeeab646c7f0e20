use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use strum::Display;
use tokio::sync::RwLock;

use crate::models::photo::FaceSample;
use crate::services::detector::encode_png;
use crate::services::lbph::{LbphModel, LbphParams, ModelError};

/// How two faces are judged to be the same person. Distances from the two
/// strategies live on different scales and their thresholds are not
/// interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ComparisonStrategy {
    /// LBPH nearest-neighbour over enrolled identities; chi-square distance.
    Classifier,
    /// Independent embeddings compared with cosine distance.
    Embedding,
}

impl ComparisonStrategy {
    pub fn default_threshold(&self) -> f64 {
        match self {
            ComparisonStrategy::Classifier => 70.0,
            ComparisonStrategy::Embedding => 0.6,
        }
    }

    /// Whether `distance` is close enough to count as the same face.
    /// Classifier distances must be strictly below the threshold, embedding
    /// distances may equal it.
    pub fn accepts(&self, distance: f64, threshold: f64) -> bool {
        match self {
            ComparisonStrategy::Classifier => distance < threshold,
            ComparisonStrategy::Embedding => distance <= threshold,
        }
    }
}

/// Outcome of comparing one candidate face with the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Distance; lower is more similar.
    pub score: f64,
    pub is_match: bool,
}

/// Query face with whatever a comparator precomputed for it.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub sample: FaceSample,
    pub identity: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

#[async_trait]
pub trait FaceComparator: Send + Sync {
    fn strategy(&self) -> ComparisonStrategy;

    /// Work done once per job before any candidate is compared.
    async fn prepare(
        &self,
        sample: FaceSample,
        identity_hint: Option<&str>,
    ) -> Result<PreparedQuery, CompareError>;

    async fn compare(
        &self,
        query: &PreparedQuery,
        candidate: &FaceSample,
    ) -> Result<Verdict, CompareError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error("Face model has no enrolled identities")]
    EmptyModel,

    #[error("Identity '{0}' is not enrolled in the face model")]
    UnknownIdentity(String),

    #[error("Query face does not resemble any enrolled identity (closest '{identity}' at {distance:.2})")]
    UnrecognizedQuery { identity: String, distance: f64 },

    #[error("Query was prepared without an {0}")]
    Unprepared(&'static str),

    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Face sample could not be encoded: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Embedding sizes differ: {0} vs {1}")]
    DimensionMismatch(usize, usize),
}

/// LBPH classifier strategy. Owns its model; [`ClassifierComparator::reload`]
/// swaps it after enrollment changes.
pub struct ClassifierComparator {
    model: RwLock<Arc<LbphModel>>,
    threshold: f64,
}

impl ClassifierComparator {
    pub fn new(model: LbphModel, threshold: f64) -> Self {
        Self {
            model: RwLock::new(Arc::new(model)),
            threshold,
        }
    }

    pub async fn reload(&self, model: LbphModel) {
        *self.model.write().await = Arc::new(model);
    }

    /// Load the model at `path` and swap it in. The current model stays in
    /// place when loading fails. Returns the number of enrolled samples.
    pub async fn reload_from(&self, path: impl AsRef<Path>) -> Result<usize, ModelError> {
        let model = LbphModel::load(path).await?;
        let samples = model.len();
        self.reload(model).await;
        Ok(samples)
    }

    async fn current(&self) -> Arc<LbphModel> {
        self.model.read().await.clone()
    }
}

#[async_trait]
impl FaceComparator for ClassifierComparator {
    fn strategy(&self) -> ComparisonStrategy {
        ComparisonStrategy::Classifier
    }

    async fn prepare(
        &self,
        sample: FaceSample,
        identity_hint: Option<&str>,
    ) -> Result<PreparedQuery, CompareError> {
        let model = self.current().await;
        if model.is_empty() {
            return Err(CompareError::EmptyModel);
        }

        let identity = match identity_hint {
            Some(identity) if model.is_enrolled(identity) => identity.to_string(),
            Some(identity) => return Err(CompareError::UnknownIdentity(identity.to_string())),
            None => {
                let prediction = model.predict(&sample).ok_or(CompareError::EmptyModel)?;
                if !self.strategy().accepts(prediction.distance, self.threshold) {
                    return Err(CompareError::UnrecognizedQuery {
                        identity: prediction.identity,
                        distance: prediction.distance,
                    });
                }
                prediction.identity
            }
        };

        Ok(PreparedQuery {
            sample,
            identity: Some(identity),
            embedding: None,
        })
    }

    async fn compare(
        &self,
        query: &PreparedQuery,
        candidate: &FaceSample,
    ) -> Result<Verdict, CompareError> {
        let identity = query
            .identity
            .as_deref()
            .ok_or(CompareError::Unprepared("identity"))?;
        let prediction = self
            .current()
            .await
            .predict(candidate)
            .ok_or(CompareError::EmptyModel)?;

        Ok(Verdict {
            score: prediction.distance,
            is_match: prediction.identity == identity
                && self.strategy().accepts(prediction.distance, self.threshold),
        })
    }
}

/// Produces a fixed-length descriptor for a face.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, sample: &FaceSample) -> Result<Vec<f32>, CompareError>;
}

/// HTTP embedding model. Sends the sample as base64 PNG and expects
/// `{"embedding": [f32, ...]}`.
pub struct RemoteEmbedder {
    http: Client,
    url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(url: String, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url,
            api_token,
        }
    }
}

#[async_trait]
impl FaceEmbedder for RemoteEmbedder {
    async fn embed(&self, sample: &FaceSample) -> Result<Vec<f32>, CompareError> {
        let png = encode_png(&sample.to_image())?;
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(png),
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response: EmbeddingResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.embedding)
    }
}

/// Offline embedder: the LBPH spatial histogram, square-rooted so that cosine
/// distance behaves like the Hellinger distance between histograms.
#[derive(Default)]
pub struct LbpEmbedder {
    params: LbphParams,
}

#[async_trait]
impl FaceEmbedder for LbpEmbedder {
    async fn embed(&self, sample: &FaceSample) -> Result<Vec<f32>, CompareError> {
        Ok(self
            .params
            .describe(sample)
            .into_iter()
            .map(f32::sqrt)
            .collect())
    }
}

/// `1 - cos(a, b)`; 0 for identical directions, 2 for opposite ones.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f64, CompareError> {
    if a.len() != b.len() {
        return Err(CompareError::DimensionMismatch(a.len(), b.len()));
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(1.0);
    }
    Ok(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Pairwise embedding strategy.
pub struct EmbeddingComparator {
    embedder: Arc<dyn FaceEmbedder>,
    threshold: f64,
}

impl EmbeddingComparator {
    pub fn new(embedder: Arc<dyn FaceEmbedder>, threshold: f64) -> Self {
        Self { embedder, threshold }
    }
}

#[async_trait]
impl FaceComparator for EmbeddingComparator {
    fn strategy(&self) -> ComparisonStrategy {
        ComparisonStrategy::Embedding
    }

    async fn prepare(
        &self,
        sample: FaceSample,
        identity_hint: Option<&str>,
    ) -> Result<PreparedQuery, CompareError> {
        let embedding = self.embedder.embed(&sample).await?;
        Ok(PreparedQuery {
            sample,
            identity: identity_hint.map(str::to_string),
            embedding: Some(embedding),
        })
    }

    async fn compare(
        &self,
        query: &PreparedQuery,
        candidate: &FaceSample,
    ) -> Result<Verdict, CompareError> {
        let reference = query
            .embedding
            .as_deref()
            .ok_or(CompareError::Unprepared("embedding"))?;
        let embedding = self.embedder.embed(candidate).await?;
        let distance = cosine_distance(reference, &embedding)?;

        Ok(Verdict {
            score: distance,
            is_match: self.strategy().accepts(distance, self.threshold),
        })
    }
}
