//! Face descriptor extraction via ONNX Runtime.
//!
//! Runs the recognition model over an aligned 112×112 face crop and returns
//! the L2-normalized 128-dimensional descriptor.

use crate::alignment;
use crate::types::{FaceDescriptor, DESCRIPTOR_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const RECOG_INPUT_SIZE: usize = 112;
const RECOG_MEAN: f32 = 127.5;
// Symmetric normalization — the recognition model expects [-1, 1] input.
const RECOG_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("descriptor shape: {0}")]
    BadShape(#[from] crate::types::DescriptorDimError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Descriptor extractor over aligned face crops.
pub struct DescriptorExtractor {
    session: Session,
}

impl DescriptorExtractor {
    /// Load the recognition model from disk.
    pub fn load(model_path: &Path) -> Result<Self, DescriptorError> {
        if !model_path.exists() {
            return Err(DescriptorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded recognition model");

        Ok(Self { session })
    }

    /// Extract a descriptor for a face with known landmarks.
    ///
    /// The face is first warped to the canonical 112×112 pose; the raw model
    /// output is validated against [`DESCRIPTOR_DIM`] and L2-normalized.
    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        landmarks: &[(f32, f32); 5],
    ) -> Result<FaceDescriptor, DescriptorError> {
        let aligned = alignment::align_face(frame, width, height, landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DescriptorError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::InferenceFailed(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values: Vec<f32> = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(FaceDescriptor::new(values)?)
    }
}

/// Normalize an aligned crop into the NCHW recognition input tensor.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let side = RECOG_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));

    for y in 0..side {
        for x in 0..side {
            let pixel = aligned.get(y * side + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - RECOG_MEAN) / RECOG_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_shape() {
        let aligned = vec![128u8; RECOG_INPUT_SIZE * RECOG_INPUT_SIZE];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, RECOG_INPUT_SIZE, RECOG_INPUT_SIZE]);
    }

    #[test]
    fn preprocess_midpoint_maps_near_zero() {
        let aligned = vec![128u8; RECOG_INPUT_SIZE * RECOG_INPUT_SIZE];
        let tensor = preprocess(&aligned);
        let expected = (128.0 - RECOG_MEAN) / RECOG_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn preprocess_range_is_symmetric() {
        let mut aligned = vec![0u8; RECOG_INPUT_SIZE * RECOG_INPUT_SIZE];
        aligned[0] = 0;
        aligned[1] = 255;
        let tensor = preprocess(&aligned);
        assert!((tensor[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 0, 1]] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn preprocess_channels_replicated() {
        let aligned = vec![64u8; RECOG_INPUT_SIZE * RECOG_INPUT_SIZE];
        let tensor = preprocess(&aligned);
        for y in (0..RECOG_INPUT_SIZE).step_by(16) {
            for x in (0..RECOG_INPUT_SIZE).step_by(16) {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }
}
