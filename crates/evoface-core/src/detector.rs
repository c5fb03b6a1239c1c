//! SCRFD face detector with five-point landmarks.
//!
//! The frame is letterboxed into a square input (top-left anchored, black
//! fill), run through `det_10g.onnx`, and decoded per stride: each feature
//! map location carries two anchors, each predicting a score, four box
//! distances and five keypoint offsets in stride units. Survivors above the
//! confidence threshold go through greedy NMS.

use std::path::Path;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use ort::session::Session;

use crate::backend::ExecutionBackend;
use crate::onnx::{self, ChannelOrder};
use crate::types::{BoundingBox, DetectedFace, Landmarks5, ModelError};

pub const DETECTOR_INPUT_SIZE: u32 = 640;

const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_LOCATION: usize = 2;
const NMS_IOU: f32 = 0.4;

/// Reports every face visible in a full frame.
pub trait FaceLandmarker {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, ModelError>;
}

pub struct ScrfdDetector {
    session: Session,
    min_confidence: f32,
}

impl ScrfdDetector {
    pub fn load(
        path: &Path,
        backend: ExecutionBackend,
        min_confidence: f32,
    ) -> Result<Self, ModelError> {
        let session = backend.load_session(path, 2)?;
        Ok(Self {
            session,
            min_confidence,
        })
    }
}

impl FaceLandmarker for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, ModelError> {
        let (input, scale) = letterbox(frame, DETECTOR_INPUT_SIZE)?;
        let size = DETECTOR_INPUT_SIZE as usize;
        let data = onnx::to_nchw(&input, ChannelOrder::Rgb, 127.5, 128.0);
        let outputs = onnx::run(&mut self.session, [1, 3, size, size], data)?;
        let faces = decode(&outputs, size, scale, self.min_confidence)?;
        Ok(nms(faces, NMS_IOU))
    }
}

/// Resize `frame` to fit a `size`×`size` canvas, keeping aspect ratio.
/// Returns the canvas and the scale applied to the frame.
fn letterbox(frame: &RgbImage, size: u32) -> Result<(RgbImage, f32), ModelError> {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return Err(ModelError::InvalidInput("empty frame".into()));
    }
    let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
    let nw = ((w as f32 * scale).round() as u32).clamp(1, size);
    let nh = ((h as f32 * scale).round() as u32).clamp(1, size);
    let resized = image::imageops::resize(frame, nw, nh, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    image::imageops::replace(&mut canvas, &resized, 0, 0);
    Ok((canvas, nw as f32 / w as f32))
}

/// Decode the nine SCRFD outputs (scores ×3, boxes ×3, keypoints ×3, in
/// stride order) back into frame coordinates.
fn decode(
    outputs: &[Vec<f32>],
    input_size: usize,
    scale: f32,
    min_confidence: f32,
) -> Result<Vec<DetectedFace>, ModelError> {
    let fmc = STRIDES.len();
    if outputs.len() < fmc * 3 {
        return Err(ModelError::InvalidOutput(format!(
            "expected {} detector outputs, got {}",
            fmc * 3,
            outputs.len()
        )));
    }

    let mut faces = Vec::new();
    for (level, &stride) in STRIDES.iter().enumerate() {
        let scores = &outputs[level];
        let boxes = &outputs[level + fmc];
        let kps = &outputs[level + fmc * 2];

        let side = input_size / stride;
        let anchors = side * side * ANCHORS_PER_LOCATION;
        if scores.len() < anchors || boxes.len() < anchors * 4 || kps.len() < anchors * 10 {
            return Err(ModelError::InvalidOutput(format!(
                "stride {stride}: output sizes do not match {anchors} anchors"
            )));
        }

        let s = stride as f32;
        for (i, &score) in scores.iter().take(anchors).enumerate() {
            if score < min_confidence {
                continue;
            }
            let loc = i / ANCHORS_PER_LOCATION;
            let cx = (loc % side) as f32 * s;
            let cy = (loc / side) as f32 * s;

            let d = &boxes[i * 4..i * 4 + 4];
            let bbox = BoundingBox {
                x1: (cx - d[0] * s) / scale,
                y1: (cy - d[1] * s) / scale,
                x2: (cx + d[2] * s) / scale,
                y2: (cy + d[3] * s) / scale,
            };

            let k = &kps[i * 10..i * 10 + 10];
            let mut landmarks: Landmarks5 = [(0.0, 0.0); 5];
            for (j, point) in landmarks.iter_mut().enumerate() {
                *point = ((cx + k[j * 2] * s) / scale, (cy + k[j * 2 + 1] * s) / scale);
            }

            faces.push(DetectedFace {
                bbox,
                landmarks,
                confidence: score,
            });
        }
    }
    Ok(faces)
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut faces: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<DetectedFace> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| k.bbox.iou(&face.bbox) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}
