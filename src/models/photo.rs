use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Side length, in pixels, of every normalized face sample.
pub const SAMPLE_SIZE: u32 = 96;

/// A candidate photo in the external corpus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoHandle {
    pub external_id: String,
    pub display_name: String,
    /// Opaque reference the corpus source uses to download the photo.
    pub retrieval_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_url: Option<String>,
}

/// A photo together with the session (folder) it was listed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub session_id: String,
    pub photo: PhotoHandle,
}

/// A detected face, cropped and normalized to `SAMPLE_SIZE` x `SAMPLE_SIZE`
/// grayscale intensities.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pixels: Vec<u8>,
    source_ref: String,
}

impl FaceSample {
    /// Wrap an already normalized grid. Returns `None` if the image does not
    /// have the sample shape.
    pub fn from_image(image: GrayImage, source_ref: impl Into<String>) -> Option<Self> {
        if image.dimensions() != (SAMPLE_SIZE, SAMPLE_SIZE) {
            return None;
        }
        Some(Self {
            pixels: image.into_raw(),
            source_ref: source_ref.into(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    /// Intensity at (`x`, `y`), row-major.
    pub fn at(&self, x: u32, y: u32) -> u8 {
        self.pixels[(y * SAMPLE_SIZE + x) as usize]
    }

    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_raw(SAMPLE_SIZE, SAMPLE_SIZE, self.pixels.clone())
            .unwrap_or_else(|| GrayImage::new(SAMPLE_SIZE, SAMPLE_SIZE))
    }
}
