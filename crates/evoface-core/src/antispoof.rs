//! Texture anti-spoof classifier (MiniFASNetV2).

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use ort::session::Session;

use crate::backend::ExecutionBackend;
use crate::onnx::{self, ChannelOrder};
use crate::types::ModelError;

/// Input side length of `2.7_80x80_MiniFASNetV2.onnx`.
pub const ANTISPOOF_INPUT_SIZE: u32 = 80;

/// Index of the "live" class in the classifier's softmax output.
const LIVE_CLASS: usize = 1;

/// Scores a face region: probability in [0, 1] that it shows a live subject.
pub trait LivenessClassifier {
    fn score(&mut self, face: &RgbImage) -> Result<f32, ModelError>;
}

pub struct MiniFasNetClassifier {
    session: Session,
}

impl MiniFasNetClassifier {
    pub fn load(path: &Path, backend: ExecutionBackend) -> Result<Self, ModelError> {
        let session = backend.load_session(path, 1)?;
        Ok(Self { session })
    }
}

impl LivenessClassifier for MiniFasNetClassifier {
    fn score(&mut self, face: &RgbImage) -> Result<f32, ModelError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(ModelError::InvalidInput("empty face region".into()));
        }
        let size = ANTISPOOF_INPUT_SIZE;
        let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
        // The model was trained on raw 0..255 BGR values.
        let data = onnx::to_nchw(&resized, ChannelOrder::Bgr, 0.0, 1.0);
        let outputs = onnx::run(&mut self.session, [1, 3, size as usize, size as usize], data)?;

        let logits = outputs
            .first()
            .ok_or_else(|| ModelError::InvalidOutput("classifier produced no output".into()))?;
        let probs = softmax(logits);
        probs.get(LIVE_CLASS).copied().ok_or_else(|| {
            ModelError::InvalidOutput(format!("expected >= 2 classes, got {}", probs.len()))
        })
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}
