//! Enrollment flow.
//!
//! Explicit, front-desk-driven steps with no automatic advancement: a still
//! is captured and analyzed, the staged descriptor is shown for
//! confirmation, and only an explicit confirm persists it. A failed step
//! leaves the flow exactly where it was so the member can retry.

use crate::engine::EngineError;
use crate::scanner::FrameAnalyzer;
use crate::store::{FaceStore, StoreError};
use mien_core::{FaceDescriptor, FrameReport, MemberFace};
use mien_hw::Frame;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnrollStep {
    AwaitingCapture,
    Captured,
    Saved,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face in the captured frame — reposition and retry")]
    NoFace,
    #[error("{count} faces in the captured frame — one member at a time")]
    Ambiguous { count: usize },
    #[error("nothing captured yet")]
    NothingCaptured,
    #[error("this enrollment is already saved")]
    AlreadySaved,
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One member's in-progress enrollment.
pub struct EnrollmentFlow {
    member: String,
    label: String,
    step: EnrollStep,
    staged: Option<FaceDescriptor>,
}

impl EnrollmentFlow {
    pub fn new(member: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            label: label.into(),
            step: EnrollStep::AwaitingCapture,
            staged: None,
        }
    }

    pub fn step(&self) -> EnrollStep {
        self.step
    }

    /// Analyze the captured stills and stage the highest-confidence
    /// single-face hit. On a miss (no face, several faces, or a failing
    /// pass on every frame) the step is unchanged so the member can retry.
    /// Recapturing before confirm replaces the stage.
    pub async fn capture<A: FrameAnalyzer>(
        &mut self,
        analyzer: &A,
        frames: Vec<Frame>,
    ) -> Result<f32, EnrollError> {
        if self.step == EnrollStep::Saved {
            return Err(EnrollError::AlreadySaved);
        }

        let mut best: Option<(f32, FaceDescriptor)> = None;
        let mut last_miss = EnrollError::NoFace;

        for frame in frames {
            match analyzer.analyze(frame).await {
                Ok(FrameReport::OneFace {
                    detection,
                    descriptor,
                }) => {
                    let better = best
                        .as_ref()
                        .map(|(conf, _)| detection.confidence > *conf)
                        .unwrap_or(true);
                    if better {
                        best = Some((detection.confidence, descriptor));
                    }
                }
                Ok(FrameReport::NoFace) => last_miss = EnrollError::NoFace,
                Ok(FrameReport::MultipleFaces { count }) => {
                    last_miss = EnrollError::Ambiguous { count }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "enrollment frame analysis failed");
                    last_miss = e.into();
                }
            }
        }

        match best {
            Some((confidence, descriptor)) => {
                self.staged = Some(descriptor);
                self.step = EnrollStep::Captured;
                tracing::info!(member = %self.member, confidence, "enrollment capture staged");
                Ok(confidence)
            }
            None => Err(last_miss),
        }
    }

    /// Persist the staged descriptor. On store failure the flow stays at
    /// `Captured` — nothing is partially committed.
    pub async fn confirm(&mut self, store: &FaceStore) -> Result<MemberFace, EnrollError> {
        if self.step == EnrollStep::Saved {
            return Err(EnrollError::AlreadySaved);
        }
        let Some(descriptor) = self.staged.clone() else {
            return Err(EnrollError::NothingCaptured);
        };

        let record = store
            .save_face(&self.member, &self.label, &descriptor)
            .await?;
        self.step = EnrollStep::Saved;
        Ok(record)
    }
}
