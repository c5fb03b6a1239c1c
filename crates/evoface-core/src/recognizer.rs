//! ArcFace embedding extractor.

use std::path::Path;

use image::RgbImage;
use ort::session::Session;

use crate::align::ALIGNED_SIZE;
use crate::backend::ExecutionBackend;
use crate::onnx::{self, ChannelOrder};
use crate::types::{ModelError, EMBEDDING_DIM};

/// Maps an aligned face crop to a raw (unnormalized) identity vector.
/// Callers normalize with [`crate::Embedding::from_raw`].
pub trait EmbeddingExtractor {
    fn extract(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, ModelError>;
}

/// `w600k_r50.onnx` from the InsightFace buffalo_l pack.
pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    pub fn load(path: &Path, backend: ExecutionBackend) -> Result<Self, ModelError> {
        let session = backend.load_session(path, 2)?;
        Ok(Self { session })
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn extract(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, ModelError> {
        if aligned.dimensions() != (ALIGNED_SIZE, ALIGNED_SIZE) {
            return Err(ModelError::InvalidInput(format!(
                "aligned face must be {ALIGNED_SIZE}x{ALIGNED_SIZE}, got {}x{}",
                aligned.width(),
                aligned.height()
            )));
        }
        let size = ALIGNED_SIZE as usize;
        let data = onnx::to_nchw(aligned, ChannelOrder::Rgb, 127.5, 127.5);
        let mut outputs = onnx::run(&mut self.session, [1, 3, size, size], data)?;
        if outputs.is_empty() {
            return Err(ModelError::InvalidOutput("recognizer produced no output".into()));
        }
        let embedding = outputs.swap_remove(0);
        if embedding.len() != EMBEDDING_DIM {
            return Err(ModelError::InvalidOutput(format!(
                "expected {EMBEDDING_DIM}-d embedding, got {}",
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}
