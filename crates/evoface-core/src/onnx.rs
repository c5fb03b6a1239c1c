//! Shared ONNX Runtime plumbing for the model adapters.

use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;

use crate::types::ModelError;

/// Channel order expected by a model's first layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Pack an image into a `[1, 3, H, W]` float buffer as `(p - mean) / std`.
pub(crate) fn to_nchw(img: &RgbImage, order: ChannelOrder, mean: f32, std: f32) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    let channels = match order {
        ChannelOrder::Rgb => [0usize, 1, 2],
        ChannelOrder::Bgr => [2usize, 1, 0],
    };
    for (x, y, px) in img.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        for (plane_idx, &src) in channels.iter().enumerate() {
            data[plane_idx * plane + idx] = (px[src] as f32 - mean) / std;
        }
    }
    data
}

/// Run a single-input model and copy every output tensor out as flat `f32`.
pub(crate) fn run(
    session: &mut Session,
    shape: [usize; 4],
    data: Vec<f32>,
) -> Result<Vec<Vec<f32>>, ModelError> {
    let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let tensor = Tensor::from_array((shape, data))
        .map_err(|e| ModelError::InvalidInput(e.to_string()))?;
    let outputs = session
        .run(ort::inputs![tensor])
        .map_err(|e| ModelError::Inference(e.to_string()))?;

    let mut flat = Vec::with_capacity(outputs.len());
    for i in 0..outputs.len() {
        let (_, values) = outputs[i]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InvalidOutput(e.to_string()))?;
        flat.push(values.to_vec());
    }
    Ok(flat)
}
