//! Anchor-free face detector via ONNX Runtime.
//!
//! Runs the detection model over a 416×416 letterboxed frame and decodes
//! box regressions from three stride levels, followed by NMS. Landmarks are
//! produced by the separate landmark model, not here.

use crate::raster;
use crate::types::Detection;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECT_INPUT_SIZE: usize = 416;
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
const DETECT_SCORE_THRESHOLD: f32 = 0.5;
const DETECT_NMS_IOU: f32 = 0.4;
const DETECT_STRIDES: [usize; 3] = [8, 16, 32];
const DETECT_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Mapping from letterboxed tensor space back to frame space.
struct LetterboxMap {
    scale: f32,
    dx: f32,
    dy: f32,
}

impl LetterboxMap {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.dx) / self.scale, (y - self.dy) / self.scale)
    }
}

/// Face detector over grayscale frames.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
}

impl FaceDetector {
    /// Load the detection model from disk.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(
            path = %model_path.display(),
            outputs = num_outputs,
            "loaded detection model"
        );

        // One score and one box tensor per stride.
        if num_outputs < DETECT_STRIDES.len() * 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection model must expose {} outputs (score/bbox per stride), got {num_outputs}",
                DETECT_STRIDES.len() * 2
            )));
        }

        Ok(Self {
            session,
            input_size: DETECT_INPUT_SIZE,
        })
    }

    /// Detect faces in a grayscale frame, sorted by descending confidence.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = self.preprocess(frame, width as usize, height as usize);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();

        // Output layout: [scores 8/16/32, bboxes 8/16/32].
        for (pos, &stride) in DETECT_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[pos]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[pos + DETECT_STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;

            decode_stride(
                scores,
                boxes,
                stride,
                self.input_size,
                &letterbox,
                DETECT_SCORE_THRESHOLD,
                &mut candidates,
            );
        }

        let mut result = nms(candidates, DETECT_NMS_IOU);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(result)
    }

    /// Letterbox a grayscale frame into the square NCHW input tensor.
    fn preprocess(&self, frame: &[u8], width: usize, height: usize) -> (Array4<f32>, LetterboxMap) {
        let side = self.input_size;
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let new_w = (width as f32 * scale).round() as usize;
        let new_h = (height as f32 * scale).round() as usize;
        let dx = ((side - new_w) / 2) as f32;
        let dy = ((side - new_h) / 2) as f32;

        let resized = raster::resize_bilinear(frame, width, height, new_w, new_h);

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        let x0 = dx as usize;
        let y0 = dy as usize;

        for y in 0..side {
            for x in 0..side {
                let pixel = if y >= y0 && y < y0 + new_h && x >= x0 && x < x0 + new_w {
                    resized[(y - y0) * new_w + (x - x0)] as f32
                } else {
                    DETECT_MEAN // padding normalizes to 0.0
                };

                let normalized = (pixel - DETECT_MEAN) / DETECT_STD;
                // Grayscale replicated to all three channels.
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, LetterboxMap { scale, dx, dy })
    }
}

/// Decode box regressions for one stride level into frame-space detections.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxMap,
    threshold: f32,
    out: &mut Vec<Detection>,
) {
    let grid = input_size / stride;
    let num_anchors = grid * grid * DETECT_ANCHORS_PER_CELL;

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / DETECT_ANCHORS_PER_CELL;
        let anchor_cx = ((cell % grid) * stride) as f32;
        let anchor_cy = ((cell / grid) * stride) as f32;

        // Box regression: distances [left, top, right, bottom] in stride units.
        let off = idx * 4;
        if off + 3 >= boxes.len() {
            continue;
        }
        let x1 = anchor_cx - boxes[off] * stride as f32;
        let y1 = anchor_cy - boxes[off + 1] * stride as f32;
        let x2 = anchor_cx + boxes[off + 2] * stride as f32;
        let y2 = anchor_cy + boxes[off + 3] * stride as f32;

        let (fx1, fy1) = letterbox.to_frame(x1, y1);
        let (fx2, fy2) = letterbox.to_frame(x2, y2);

        out.push(Detection {
            x: fx1,
            y: fy1,
            width: fx2 - fx1,
            height: fy2 - fy1,
            confidence: score,
            landmarks: None,
        });
    }
}

/// Non-maximum suppression over candidate boxes.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-union of two boxes.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn iou_identical() {
        let a = boxed(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint() {
        let a = boxed(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = boxed(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn iou_half_overlap() {
        let a = boxed(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = boxed(5.0, 0.0, 10.0, 10.0, 1.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_drops_overlapping_lower_confidence() {
        let candidates = vec![
            boxed(0.0, 0.0, 100.0, 100.0, 0.9),
            boxed(5.0, 5.0, 100.0, 100.0, 0.8),
            boxed(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = nms(candidates, DETECT_NMS_IOU);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_disjoint() {
        let candidates = vec![
            boxed(0.0, 0.0, 10.0, 10.0, 0.9),
            boxed(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        assert_eq!(nms(candidates, DETECT_NMS_IOU).len(), 2);
    }

    #[test]
    fn nms_empty() {
        assert!(nms(vec![], DETECT_NMS_IOU).is_empty());
    }

    #[test]
    fn letterbox_roundtrip() {
        // 640x480 frame into a 416 square: scale = 416/640 = 0.65,
        // vertical padding (416 - 312) / 2 = 52.
        let scale = (416.0f32 / 640.0).min(416.0 / 480.0);
        let new_w = (640.0 * scale).round() as usize;
        let new_h = (480.0 * scale).round() as usize;
        let map = LetterboxMap {
            scale,
            dx: ((416 - new_w) / 2) as f32,
            dy: ((416 - new_h) / 2) as f32,
        };

        let (fx, fy) = map.to_frame(100.0 * scale + map.dx, 50.0 * scale + map.dy);
        assert!((fx - 100.0).abs() < 0.1, "x: {fx}");
        assert!((fy - 50.0).abs() < 0.1, "y: {fy}");
    }

    #[test]
    fn decode_stride_skips_low_scores() {
        let grid = DETECT_INPUT_SIZE / 32;
        let anchors = grid * grid * DETECT_ANCHORS_PER_CELL;
        let scores = vec![0.1f32; anchors];
        let boxes = vec![1.0f32; anchors * 4];
        let map = LetterboxMap {
            scale: 1.0,
            dx: 0.0,
            dy: 0.0,
        };

        let mut out = Vec::new();
        decode_stride(&scores, &boxes, 32, DETECT_INPUT_SIZE, &map, 0.5, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn decode_stride_emits_frame_space_box() {
        let grid = DETECT_INPUT_SIZE / 32;
        let anchors = grid * grid * DETECT_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        // Anchor pair at cell (1, 1): anchor center (32, 32).
        let cell = grid + 1;
        scores[cell * DETECT_ANCHORS_PER_CELL] = 0.9;
        // Distances of 1 stride unit in every direction → 64x64 box at (0, 0).
        let boxes = vec![1.0f32; anchors * 4];
        let map = LetterboxMap {
            scale: 1.0,
            dx: 0.0,
            dy: 0.0,
        };

        let mut out = Vec::new();
        decode_stride(&scores, &boxes, 32, DETECT_INPUT_SIZE, &map, 0.5, &mut out);
        assert_eq!(out.len(), 1);
        let det = &out[0];
        assert!((det.x - 0.0).abs() < 1e-4);
        assert!((det.y - 0.0).abs() < 1e-4);
        assert!((det.width - 64.0).abs() < 1e-4);
        assert!((det.height - 64.0).abs() < 1e-4);
        assert!(det.landmarks.is_none());
    }
}
