//! Local binary pattern histograms (LBPH) face model.
//!
//! Each sample is turned into a circular LBP code image, split into a grid of
//! cells, and described by the concatenated per-cell code histograms. Two
//! descriptors are compared with the chi-square distance; smaller means more
//! alike. With the default parameters distances fall roughly between 0 and
//! 256, and same-person pairs typically sit below 60–90.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

use crate::models::photo::{FaceSample, SAMPLE_SIZE};

/// Intensity differences smaller than this are treated as equal.
const EQUALITY_EPSILON: f64 = 1e-3;

/// Codes are stored in a `u32` and histograms have `2^neighbors` bins.
const MAX_NEIGHBORS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    /// Reject parameters that cannot describe a `SAMPLE_SIZE` sample: the
    /// radius must leave an interior, and every grid cell must cover at least
    /// one code.
    pub fn check(&self) -> Result<(), ModelError> {
        if self.radius == 0 || self.radius >= SAMPLE_SIZE / 2 {
            return Err(ModelError::InvalidParams(format!(
                "radius {} outside 1..{}",
                self.radius,
                SAMPLE_SIZE / 2
            )));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(ModelError::InvalidParams(format!(
                "neighbors {} outside 1..={MAX_NEIGHBORS}",
                self.neighbors
            )));
        }
        let side = SAMPLE_SIZE - 2 * self.radius;
        for (axis, cells) in [("grid_x", self.grid_x), ("grid_y", self.grid_y)] {
            if cells == 0 || cells > side {
                return Err(ModelError::InvalidParams(format!(
                    "{axis} {cells} outside 1..={side}"
                )));
            }
        }
        Ok(())
    }

    fn bins(&self) -> usize {
        1 << self.neighbors
    }

    /// Spatial histogram of `sample`, one normalized histogram per cell.
    pub fn describe(&self, sample: &FaceSample) -> Vec<f32> {
        let codes = self.lbp_codes(sample);
        let side = SAMPLE_SIZE - 2 * self.radius;
        self.spatial_histogram(&codes, side, side)
    }

    /// Circular LBP with bilinear interpolation of the sampling points.
    fn lbp_codes(&self, sample: &FaceSample) -> Vec<u32> {
        let r = self.radius;
        let side = SAMPLE_SIZE - 2 * r;
        let mut codes = vec![0u32; (side * side) as usize];

        for n in 0..self.neighbors {
            let angle = 2.0 * PI * f64::from(n) / f64::from(self.neighbors);
            let dx = f64::from(r) * angle.cos();
            let dy = -f64::from(r) * angle.sin();

            let fx = dx.floor();
            let fy = dy.floor();
            let tx = dx - fx;
            let ty = dy - fy;
            let w1 = (1.0 - tx) * (1.0 - ty);
            let w2 = tx * (1.0 - ty);
            let w3 = (1.0 - tx) * ty;
            let w4 = tx * ty;

            for y in 0..side {
                for x in 0..side {
                    let cx = i64::from(x + r);
                    let cy = i64::from(y + r);
                    let px = |ox: f64, oy: f64| {
                        let sx = (cx + ox as i64).clamp(0, i64::from(SAMPLE_SIZE) - 1) as u32;
                        let sy = (cy + oy as i64).clamp(0, i64::from(SAMPLE_SIZE) - 1) as u32;
                        f64::from(sample.at(sx, sy))
                    };
                    let t = w1 * px(fx, fy)
                        + w2 * px(fx + 1.0, fy)
                        + w3 * px(fx, fy + 1.0)
                        + w4 * px(fx + 1.0, fy + 1.0);
                    let center = f64::from(sample.at(cx as u32, cy as u32));
                    if t > center || (t - center).abs() < EQUALITY_EPSILON {
                        codes[(y * side + x) as usize] |= 1 << n;
                    }
                }
            }
        }
        codes
    }

    fn spatial_histogram(&self, codes: &[u32], width: u32, height: u32) -> Vec<f32> {
        let bins = self.bins();
        let cell_w = width / self.grid_x;
        let cell_h = height / self.grid_y;
        let cell_area = (cell_w * cell_h).max(1) as f32;
        let mut descriptor = vec![0f32; bins * (self.grid_x * self.grid_y) as usize];

        for gy in 0..self.grid_y {
            for gx in 0..self.grid_x {
                let offset = (gy * self.grid_x + gx) as usize * bins;
                for y in gy * cell_h..(gy + 1) * cell_h {
                    for x in gx * cell_w..(gx + 1) * cell_w {
                        let code = codes[(y * width + x) as usize] as usize;
                        descriptor[offset + code] += 1.0;
                    }
                }
                for value in &mut descriptor[offset..offset + bins] {
                    *value /= cell_area;
                }
            }
        }
        descriptor
    }
}

/// Symmetric chi-square distance between two descriptors.
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            let sum = f64::from(a) + f64::from(b);
            if sum > 0.0 {
                let diff = f64::from(a) - f64::from(b);
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Enrolled {
    identity: String,
    descriptor: Vec<f32>,
}

/// Nearest-neighbour classifier over enrolled face descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphParams,
    samples: Vec<Enrolled>,
}

/// Closest enrolled identity and its distance.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub identity: String,
    pub distance: f64,
}

impl LbphModel {
    /// Build a model from labelled samples.
    pub fn train<'a>(
        params: LbphParams,
        samples: impl IntoIterator<Item = (&'a str, &'a FaceSample)>,
    ) -> Self {
        let samples = samples
            .into_iter()
            .map(|(identity, sample)| Enrolled {
                identity: identity.to_string(),
                descriptor: params.describe(sample),
            })
            .collect();
        Self { params, samples }
    }

    /// Read a model previously written by [`LbphModel::save`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let bytes = tokio::fs::read(path).await?;
        let model: Self = serde_json::from_slice(&bytes)?;
        model.params.check()?;
        let expected = model.params.bins() * (model.params.grid_x * model.params.grid_y) as usize;
        if model.samples.iter().any(|s| s.descriptor.len() != expected) {
            return Err(ModelError::Inconsistent);
        }
        Ok(model)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let bytes = serde_json::to_vec(self)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub fn is_enrolled(&self, identity: &str) -> bool {
        self.samples.iter().any(|s| s.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Closest enrolled sample. `None` for an empty model.
    pub fn predict(&self, sample: &FaceSample) -> Option<Prediction> {
        let query = self.params.describe(sample);
        self.samples
            .iter()
            .map(|enrolled| (enrolled, chi_square(&enrolled.descriptor, &query)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(enrolled, distance)| Prediction {
                identity: enrolled.identity.clone(),
                distance,
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model file could not be read: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Model descriptors do not match its parameters")]
    Inconsistent,

    #[error("Model parameters are out of range: {0}")]
    InvalidParams(String),
}
