use face_search::{
    config::EnrollConfig,
    services::{
        detector::{CroppingDetector, RemoteLocator},
        enrollment::enroll_directory,
        lbph::LbphParams,
    },
};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Train the LBPH face model from `ENROLL_DIR/<identity>/*` and write it to
/// `LBPH_MODEL_PATH`. Send SIGHUP to running workers afterwards to pick it up.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = EnrollConfig::from_env().expect("Failed to load configuration");

    let detector = CroppingDetector::new(Arc::new(RemoteLocator::new(
        config.detector_url.clone(),
        config.detector_api_token.clone(),
    )));

    tracing::info!(dir = %config.enroll_dir, "Enrolling reference faces");
    let (model, report) = enroll_directory(
        Path::new(&config.enroll_dir),
        &detector,
        LbphParams::default(),
    )
    .await
    .expect("Enrollment failed");

    if let Some(parent) = Path::new(&config.lbph_model_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .expect("Failed to create model directory");
        }
    }
    model
        .save(&config.lbph_model_path)
        .await
        .expect("Failed to write face model");

    tracing::info!(
        path = %config.lbph_model_path,
        identities = ?report.identities,
        samples = report.samples,
        skipped = report.skipped.len(),
        "Face model written"
    );
}
