//! Builds the LBPH model used by the classifier strategy from a directory of
//! reference photos laid out as `<root>/<identity>/<photo>`.

use std::path::{Path, PathBuf};

use crate::models::photo::FaceSample;
use crate::services::detector::{Detection, FaceDetector};
use crate::services::lbph::{LbphModel, LbphParams, ModelError};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error("Enrollment directory could not be read: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("No usable face was found under {0}")]
    NoSamples(PathBuf),
}

/// What went into a trained model.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnrollmentReport {
    /// Enrolled identities, sorted.
    pub identities: Vec<String>,
    pub samples: usize,
    /// Photos that were unreadable or had no detectable face.
    pub skipped: Vec<PathBuf>,
}

/// Detect one face per reference photo and train a model over all of them.
/// Identities without a single usable photo are left out.
pub async fn enroll_directory(
    root: &Path,
    detector: &dyn FaceDetector,
    params: LbphParams,
) -> Result<(LbphModel, EnrollmentReport), EnrollError> {
    params.check()?;

    let mut report = EnrollmentReport::default();
    let mut samples: Vec<(String, FaceSample)> = Vec::new();

    for (identity, dir) in sorted_entries(root, |path| path.is_dir()).await? {
        let before = samples.len();
        for (_, photo) in sorted_entries(&dir, is_image).await? {
            let bytes = tokio::fs::read(&photo).await?;
            let source_ref = photo.display().to_string();
            match detector.detect(&bytes, &source_ref).await {
                Ok(Detection::Face(sample)) => samples.push((identity.clone(), sample)),
                Ok(Detection::NoFace) => {
                    tracing::warn!(photo = %source_ref, "No face in reference photo, skipping");
                    report.skipped.push(photo);
                }
                Err(e) => {
                    tracing::warn!(photo = %source_ref, error = %e, "Reference photo unusable, skipping");
                    report.skipped.push(photo);
                }
            }
        }
        if samples.len() > before {
            report.identities.push(identity);
        }
    }

    if samples.is_empty() {
        return Err(EnrollError::NoSamples(root.to_path_buf()));
    }
    report.samples = samples.len();

    let model = LbphModel::train(
        params,
        samples
            .iter()
            .map(|(identity, sample)| (identity.as_str(), sample)),
    );
    Ok((model, report))
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Directory entries accepted by `keep`, sorted by file name.
async fn sorted_entries(
    dir: &Path,
    keep: impl Fn(&Path) -> bool,
) -> Result<Vec<(String, PathBuf)>, std::io::Error> {
    let mut entries = Vec::new();
    let mut listing = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = listing.next_entry().await? {
        let path = entry.path();
        if keep(&path) {
            entries.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    entries.sort();
    Ok(entries)
}
