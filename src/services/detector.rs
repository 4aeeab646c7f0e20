use async_trait::async_trait;
use base64::Engine;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat};
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;

use crate::models::photo::{FaceSample, SAMPLE_SIZE};

/// Result of running detection on one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Face(FaceSample),
    NoFace,
}

/// Locates one face in raw image bytes and normalizes it to a [`FaceSample`].
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &[u8], source_ref: &str) -> Result<Detection, DetectError>;
}

/// Axis-aligned face box in pixel coordinates of the grayscale frame.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FaceBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// Face localisation backend: returns every face box found in the frame, in
/// any order.
#[async_trait]
pub trait FaceLocator: Send + Sync {
    async fn locate(&self, frame: &GrayImage) -> Result<Vec<FaceBox>, DetectError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Face locator request failed: {0}")]
    Locator(#[from] reqwest::Error),

    #[error("Image task was interrupted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Decodes, asks a [`FaceLocator`] for boxes, keeps the first box in scan
/// order (top to bottom, then left to right) and resizes the crop to the
/// fixed sample shape.
pub struct CroppingDetector {
    locator: Arc<dyn FaceLocator>,
}

impl CroppingDetector {
    pub fn new(locator: Arc<dyn FaceLocator>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl FaceDetector for CroppingDetector {
    async fn detect(&self, image: &[u8], source_ref: &str) -> Result<Detection, DetectError> {
        let bytes = image.to_vec();
        let frame = tokio::task::spawn_blocking(move || decode_gray(&bytes)).await??;

        let boxes = self.locator.locate(&frame).await?;
        let Some(face) = first_in_scan_order(&boxes, frame.width(), frame.height()) else {
            return Ok(Detection::NoFace);
        };

        let source_ref = source_ref.to_string();
        let sample =
            tokio::task::spawn_blocking(move || normalize(&frame, face, source_ref)).await?;
        Ok(sample.map_or(Detection::NoFace, Detection::Face))
    }
}

fn decode_gray(bytes: &[u8]) -> Result<GrayImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

/// Clamp a box to the frame; boxes with no area left are dropped.
fn clamp(face: FaceBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = (i64::from(width), i64::from(height));
    let x0 = face.x.clamp(0, width);
    let y0 = face.y.clamp(0, height);
    let x1 = face.x.saturating_add(face.width).clamp(0, width);
    let y1 = face.y.saturating_add(face.height).clamp(0, height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

fn first_in_scan_order(boxes: &[FaceBox], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    boxes
        .iter()
        .filter_map(|face| clamp(*face, width, height))
        .min_by_key(|&(x, y, _, _)| (y, x))
}

fn normalize(
    frame: &GrayImage,
    (x, y, width, height): (u32, u32, u32, u32),
    source_ref: String,
) -> Option<FaceSample> {
    let crop = imageops::crop_imm(frame, x, y, width, height).to_image();
    let resized = imageops::resize(&crop, SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle);
    FaceSample::from_image(resized, source_ref)
}

/// Encode a frame as PNG for transport to remote models.
pub(crate) fn encode_png(frame: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    frame.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// HTTP face localisation service. Sends the grayscale frame as base64 PNG and
/// expects `{"faces": [{"x", "y", "width", "height"}]}`.
pub struct RemoteLocator {
    http: Client,
    url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct LocateResponse {
    #[serde(default)]
    faces: Vec<FaceBox>,
}

impl RemoteLocator {
    pub fn new(url: String, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url,
            api_token,
        }
    }
}

#[async_trait]
impl FaceLocator for RemoteLocator {
    async fn locate(&self, frame: &GrayImage) -> Result<Vec<FaceBox>, DetectError> {
        let png = encode_png(frame)?;
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(png),
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response: LocateResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.faces)
    }
}
