use serde::Deserialize;
use std::time::Duration;

use crate::services::comparator::ComparisonStrategy;
use crate::services::dispatcher::DispatcherSettings;
use crate::services::matching::MatchSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for worker wake-ups. Workers poll without it.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// AES-256-GCM encryption key for staged query photos (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// OAuth access token for the Google Drive API
    #[serde(default)]
    pub drive_access_token: String,

    /// Drive folder ids searched by every job, comma separated. One folder per session.
    #[serde(default)]
    pub drive_folder_ids: Vec<String>,

    /// Face localisation service endpoint
    pub detector_url: String,

    #[serde(default)]
    pub detector_api_token: Option<String>,

    #[serde(default = "default_strategy")]
    pub comparison_strategy: ComparisonStrategy,

    /// Maximum accepted distance. Defaults per strategy.
    #[serde(default)]
    pub match_threshold: Option<f64>,

    /// Trained LBPH model, used by the classifier strategy
    #[serde(default = "default_lbph_model_path")]
    pub lbph_model_path: String,

    /// Embedding service endpoint. The local LBP embedder is used when unset.
    #[serde(default)]
    pub embedder_url: Option<String>,

    #[serde(default)]
    pub embedder_api_token: Option<String>,

    /// Address the worker serves Prometheus metrics on. The API server
    /// exposes them under `/metrics` instead.
    #[serde(default)]
    pub metrics_addr: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    #[serde(default = "default_photo_timeout_secs")]
    pub photo_timeout_secs: u64,

    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,

    #[serde(default = "default_photo_concurrency")]
    pub photo_concurrency: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_strategy() -> ComparisonStrategy {
    ComparisonStrategy::Embedding
}

fn default_lbph_model_path() -> String {
    "models/lbph_model.json".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_claim_lease_secs() -> u64 {
    600
}

fn default_photo_timeout_secs() -> u64 {
    60
}

fn default_fetch_retries() -> u32 {
    2
}

fn default_photo_concurrency() -> usize {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Longest a worker can go without a heartbeat while scanning. Each photo
    /// advances progress, which refreshes the heartbeat, and the per-photo
    /// timeout already covers fetch retries and their backoff.
    pub fn worst_case_photo_time(&self) -> Duration {
        self.match_settings().photo_timeout
    }

    /// Problems that do not stop a process from starting but make it
    /// misbehave.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let lease = Duration::from_secs(self.claim_lease_secs);
        let photo = self.worst_case_photo_time();
        if lease <= photo {
            warnings.push(format!(
                "CLAIM_LEASE_SECS ({}s) does not exceed the worst-case time for one photo ({}s); \
                 live jobs may be reclaimed by other workers",
                lease.as_secs(),
                photo.as_secs()
            ));
        }
        warnings
    }

    pub fn match_threshold(&self) -> f64 {
        self.match_threshold
            .unwrap_or_else(|| self.comparison_strategy.default_threshold())
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            photo_timeout: Duration::from_secs(self.photo_timeout_secs),
            fetch_retries: self.fetch_retries,
            concurrency: self.photo_concurrency.max(1),
            ..MatchSettings::default()
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            lease: Duration::from_secs(self.claim_lease_secs),
        }
    }
}

/// Settings for the `enroll` binary, which needs neither the database nor
/// blob storage.
#[derive(Debug, Deserialize)]
pub struct EnrollConfig {
    /// Reference photos, one subdirectory per identity
    #[serde(default = "default_enroll_dir")]
    pub enroll_dir: String,

    /// Face localisation service endpoint
    pub detector_url: String,

    #[serde(default)]
    pub detector_api_token: Option<String>,

    /// Where the trained model is written
    #[serde(default = "default_lbph_model_path")]
    pub lbph_model_path: String,
}

fn default_enroll_dir() -> String {
    "faces".to_string()
}

impl EnrollConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
