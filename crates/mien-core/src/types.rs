use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of every face descriptor produced by the recognition model.
pub const DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug)]
#[error("descriptor must be {DESCRIPTOR_DIM}-dimensional, got {0}")]
pub struct DescriptorDimError(pub usize);

/// Fixed-length face embedding, used for similarity comparison at check-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    /// Wrap a raw embedding, rejecting any vector that is not exactly
    /// [`DESCRIPTOR_DIM`] long.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorDimError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorDimError(values.len()));
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Cosine similarity in [-1, 1]. Always processes all dimensions; no
    /// early exit, so comparison time does not depend on the values.
    pub fn similarity(&self, other: &FaceDescriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One detected face in a frame: bounding box plus optional landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five facial keypoints: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Per-tick classification of a frame. Transient — reported to the caller
/// and discarded, never persisted.
#[derive(Debug, Clone)]
pub enum FrameReport {
    /// Nobody in view; the member should reposition.
    NoFace,
    /// Exactly one face — the only case that yields a descriptor.
    OneFace {
        detection: Detection,
        descriptor: FaceDescriptor,
    },
    /// More than one face in view; ambiguous, nothing is emitted.
    MultipleFaces { count: usize },
}

impl FrameReport {
    pub fn face_count(&self) -> usize {
        match self {
            FrameReport::NoFace => 0,
            FrameReport::OneFace { .. } => 1,
            FrameReport::MultipleFaces { count } => *count,
        }
    }

    pub fn descriptor(&self) -> Option<&FaceDescriptor> {
        match self {
            FrameReport::OneFace { descriptor, .. } => Some(descriptor),
            _ => None,
        }
    }
}

/// An enrolled member face as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberFace {
    pub id: String,
    pub member: String,
    pub label: String,
    pub descriptor: FaceDescriptor,
    pub created_at: String,
}

/// Result of matching a probe descriptor against the enrolled gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    pub member: Option<String>,
    pub face_id: Option<String>,
}

/// Strategy for comparing a probe descriptor against enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &FaceDescriptor, gallery: &[MemberFace], threshold: f32)
        -> MatchResult;
}

/// Cosine-similarity matcher that always walks the entire gallery, so match
/// time leaks neither gallery size nor match position.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &FaceDescriptor,
        gallery: &[MemberFace],
        threshold: f32,
    ) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, face) in gallery.iter().enumerate() {
            let sim = probe.similarity(&face.descriptor);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                member: Some(gallery[idx].member.clone()),
                face_id: Some(gallery[idx].id.clone()),
            },
            _ => MatchResult {
                matched: false,
                similarity: if best_sim == f32::NEG_INFINITY {
                    0.0
                } else {
                    best_sim
                },
                member: None,
                face_id: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_with(first: &[f32]) -> FaceDescriptor {
        let mut values = vec![0.0f32; DESCRIPTOR_DIM];
        values[..first.len()].copy_from_slice(first);
        FaceDescriptor::new(values).unwrap()
    }

    fn member_face(id: &str, member: &str, first: &[f32]) -> MemberFace {
        MemberFace {
            id: id.into(),
            member: member.into(),
            label: "default".into(),
            descriptor: descriptor_with(first),
            created_at: String::new(),
        }
    }

    #[test]
    fn descriptor_rejects_wrong_dimension() {
        let err = FaceDescriptor::new(vec![0.0; 64]).unwrap_err();
        assert_eq!(err.0, 64);
        assert!(FaceDescriptor::new(vec![0.0; DESCRIPTOR_DIM]).is_ok());
    }

    #[test]
    fn descriptor_length_is_constant() {
        let d = descriptor_with(&[1.0]);
        assert_eq!(d.len(), DESCRIPTOR_DIM);
    }

    #[test]
    fn similarity_identical() {
        let a = descriptor_with(&[1.0]);
        let b = descriptor_with(&[1.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_orthogonal() {
        let a = descriptor_with(&[1.0, 0.0]);
        let b = descriptor_with(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn similarity_opposite() {
        let a = descriptor_with(&[1.0]);
        let b = descriptor_with(&[-1.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_zero_vector() {
        let a = descriptor_with(&[]);
        let b = descriptor_with(&[1.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn euclidean_distance_basic() {
        let a = descriptor_with(&[3.0, 0.0]);
        let b = descriptor_with(&[0.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn report_descriptor_only_for_one_face() {
        let report = FrameReport::NoFace;
        assert!(report.descriptor().is_none());
        assert_eq!(report.face_count(), 0);

        let report = FrameReport::MultipleFaces { count: 3 };
        assert!(report.descriptor().is_none());
        assert_eq!(report.face_count(), 3);

        let report = FrameReport::OneFace {
            detection: Detection {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            },
            descriptor: descriptor_with(&[1.0]),
        };
        assert_eq!(report.descriptor().unwrap().len(), DESCRIPTOR_DIM);
    }

    #[test]
    fn matcher_walks_whole_gallery() {
        // Best match sits last; constant-time traversal must still find it.
        let probe = descriptor_with(&[1.0, 0.0, 0.0]);
        let gallery = vec![
            member_face("1", "ada", &[0.0, 1.0, 0.0]),
            member_face("2", "grace", &[0.0, 0.0, 1.0]),
            member_face("3", "joan", &[1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher.compare(&probe, &gallery, 0.5);
        assert!(result.matched);
        assert_eq!(result.member.as_deref(), Some("joan"));
        assert_eq!(result.face_id.as_deref(), Some("3"));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn matcher_below_threshold() {
        let probe = descriptor_with(&[1.0, 0.0]);
        let gallery = vec![member_face("1", "ada", &[0.0, 1.0])];

        let result = CosineMatcher.compare(&probe, &gallery, 0.5);
        assert!(!result.matched);
        assert!(result.member.is_none());
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn matcher_empty_gallery() {
        let probe = descriptor_with(&[1.0]);
        let result = CosineMatcher.compare(&probe, &[], 0.5);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }
}
