//! Second-stage facial landmark model via ONNX Runtime.
//!
//! Refines a detected box into five keypoints (eyes, nose, mouth corners)
//! used for alignment and overlay drawing. The model sees a margin-expanded
//! crop of the face and returns keypoint coordinates normalized to the crop.

use crate::raster;
use crate::types::Detection;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 96;
const LANDMARK_MEAN: f32 = 127.5;
const LANDMARK_STD: f32 = 128.0;
const LANDMARK_POINTS: usize = 5;
/// Box expansion before cropping, as a fraction of the larger box side.
const LANDMARK_CROP_MARGIN: f32 = 0.25;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("landmark model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Five-point landmark extractor.
pub struct LandmarkModel {
    session: Session,
}

impl LandmarkModel {
    /// Load the landmark model from disk.
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded landmark model");

        Ok(Self { session })
    }

    /// Locate the five keypoints for a detected face, in frame coordinates.
    pub fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &Detection,
    ) -> Result<[(f32, f32); 5], LandmarkError> {
        let rect = raster::expand_and_clamp(
            face.x,
            face.y,
            face.width,
            face.height,
            LANDMARK_CROP_MARGIN,
            width as usize,
            height as usize,
        );
        let cropped = raster::crop(frame, width as usize, rect);
        let resized = raster::resize_bilinear(
            &cropped,
            rect.width,
            rect.height,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
        );

        let input = preprocess(&resized);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("keypoint decode: {e}")))?;

        if raw.len() < LANDMARK_POINTS * 2 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} keypoint values, got {}",
                LANDMARK_POINTS * 2,
                raw.len()
            )));
        }

        Ok(denormalize(raw, rect.x, rect.y, rect.width, rect.height))
    }
}

/// Normalize a crop into the NCHW landmark input tensor.
fn preprocess(crop: &[u8]) -> Array4<f32> {
    let side = LANDMARK_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));

    for y in 0..side {
        for x in 0..side {
            let pixel = crop.get(y * side + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - LANDMARK_MEAN) / LANDMARK_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    tensor
}

/// Map normalized [0, 1] crop-space keypoints back into frame coordinates.
fn denormalize(
    raw: &[f32],
    crop_x: usize,
    crop_y: usize,
    crop_w: usize,
    crop_h: usize,
) -> [(f32, f32); 5] {
    std::array::from_fn(|i| {
        let nx = raw[i * 2].clamp(0.0, 1.0);
        let ny = raw[i * 2 + 1].clamp(0.0, 1.0);
        (
            crop_x as f32 + nx * crop_w as f32,
            crop_y as f32 + ny * crop_h as f32,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_shape_and_channels() {
        let crop = vec![100u8; LANDMARK_INPUT_SIZE * LANDMARK_INPUT_SIZE];
        let tensor = preprocess(&crop);
        assert_eq!(
            tensor.shape(),
            &[1, 3, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE]
        );
        let expected = (100.0 - LANDMARK_MEAN) / LANDMARK_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 5, 5]], tensor[[0, 2, 5, 5]]);
    }

    #[test]
    fn denormalize_maps_into_crop() {
        let raw = [0.0, 0.0, 1.0, 1.0, 0.5, 0.5, 0.25, 0.75, 0.75, 0.25];
        let pts = denormalize(&raw, 10, 20, 100, 200);
        assert_eq!(pts[0], (10.0, 20.0));
        assert_eq!(pts[1], (110.0, 220.0));
        assert_eq!(pts[2], (60.0, 120.0));
        assert_eq!(pts[3], (35.0, 170.0));
        assert_eq!(pts[4], (85.0, 70.0));
    }

    #[test]
    fn denormalize_clamps_out_of_range() {
        let raw = [-0.5, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let pts = denormalize(&raw, 0, 0, 100, 100);
        assert_eq!(pts[0], (0.0, 100.0));
    }
}
