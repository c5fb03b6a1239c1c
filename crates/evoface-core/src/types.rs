use ndarray::ArrayView1;
use serde::Serialize;
use thiserror::Error;

/// Output dimension of the ArcFace recognizer.
pub const EMBEDDING_DIM: usize = 512;

/// Five facial keypoints in SCRFD order: left eye, right eye, nose tip,
/// left mouth corner, right mouth corner.
pub type Landmarks5 = [(f32, f32); 5];

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Grow the box by `ratio` of its size on every side, clamped to the frame.
    pub fn padded(&self, ratio: f32, frame_width: u32, frame_height: u32) -> BoundingBox {
        let pad_w = self.width() * ratio;
        let pad_h = self.height() * ratio;
        BoundingBox {
            x1: (self.x1 - pad_w).max(0.0),
            y1: (self.y1 - pad_h).max(0.0),
            x2: (self.x2 + pad_w).min(frame_width as f32),
            y2: (self.y2 + pad_h).min(frame_height as f32),
        }
    }
}

/// One face reported by the landmark/detection model.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks5,
    /// Presence confidence in [0, 1].
    pub confidence: f32,
}

/// Errors from the external model collaborators.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to load model {path}: {message}")]
    Load { path: String, message: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    #[error("unexpected model output: {0}")]
    InvalidOutput(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding contains NaN or infinite values")]
    NonFinite,
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// An L2-normalized face embedding.
///
/// The only constructor normalizes, so every `Embedding` in the system has
/// unit norm and dot products between them are cosine similarities.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalize raw model output into a unit vector.
    pub fn from_raw(mut values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::ZeroNorm);
        }
        for v in &mut values {
            *v /= norm;
        }
        Ok(Self { values })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn view(&self) -> ArrayView1<'_, f32> {
        ArrayView1::from(self.values.as_slice())
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity (both sides are unit vectors).
    pub fn similarity(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// `normalize(weight * self + (1 - weight) * other)`.
    pub fn blend(&self, other: &Embedding, weight: f32) -> Result<Embedding, EmbeddingError> {
        if self.dim() != other.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dim(),
                got: other.dim(),
            });
        }
        let mixed = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| weight * a + (1.0 - weight) * b)
            .collect();
        Embedding::from_raw(mixed)
    }
}
