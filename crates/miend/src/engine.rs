//! Inference engine on a dedicated OS thread.
//!
//! ONNX sessions are not shared across threads here; a single engine thread
//! owns all three models and serves requests over an mpsc channel with
//! oneshot replies. Sessions are built lazily from the model cache on the
//! first `prepare`, so daemon startup never blocks on a download.

use mien_core::models::ModelError;
use mien_core::{
    CosineMatcher, DescriptorExtractor, FaceDetector, FrameReport, HttpFetcher, LandmarkModel,
    MatchResult, Matcher, MemberFace, ModelCache, ModelPaths,
};
use mien_hw::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("recognition models not loaded yet")]
    NotReady,
    #[error("model cache: {0}")]
    Models(#[from] ModelError),
    #[error("detector: {0}")]
    Detector(#[from] mien_core::detector::DetectorError),
    #[error("landmarks: {0}")]
    Landmarks(#[from] mien_core::landmarks::LandmarkError),
    #[error("descriptor: {0}")]
    Descriptor(#[from] mien_core::descriptor::DescriptorError),
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

enum EngineRequest {
    LoadSessions {
        paths: ModelPaths,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Analyze {
        frame: Frame,
        reply: oneshot::Sender<Result<FrameReport, EngineError>>,
    },
    Verify {
        frames: Vec<Frame>,
        gallery: Vec<MemberFace>,
        threshold: f32,
        reply: oneshot::Sender<Result<MatchResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    cache: Arc<ModelCache<HttpFetcher>>,
    sessions_ready: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Resolve model assets (downloading if needed) and build the sessions.
    ///
    /// Safe to call repeatedly; both the cache and the session build are
    /// idempotent.
    pub async fn prepare(&self) -> Result<(), EngineError> {
        let paths = self.cache.ensure().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::LoadSessions {
                paths,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;

        self.sessions_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the sessions have been built.
    pub fn ready(&self) -> bool {
        self.sessions_ready.load(Ordering::SeqCst)
    }

    /// Model cache state, for status reporting.
    pub async fn models_state(&self) -> &'static str {
        self.cache.state_name().await
    }

    /// Run one detection pass over a frame.
    pub async fn analyze(&self, frame: Frame) -> Result<FrameReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Match captured frames against a member's enrolled gallery.
    pub async fn verify(
        &self,
        frames: Vec<Frame>,
        gallery: Vec<MemberFace>,
        threshold: f32,
    ) -> Result<MatchResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                frames,
                gallery,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine thread. Sessions are loaded on the first `prepare`.
pub fn spawn_engine(cache: Arc<ModelCache<HttpFetcher>>) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("mien-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut pipeline: Option<Pipeline> = None;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::LoadSessions { paths, reply } => {
                        let result = if pipeline.is_some() {
                            Ok(())
                        } else {
                            Pipeline::load(&paths).map(|p| {
                                pipeline = Some(p);
                            })
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Analyze { frame, reply } => {
                        let result = match pipeline.as_mut() {
                            None => Err(EngineError::NotReady),
                            Some(p) => p.analyze(&frame),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify {
                        frames,
                        gallery,
                        threshold,
                        reply,
                    } => {
                        let result = match pipeline.as_mut() {
                            None => Err(EngineError::NotReady),
                            Some(p) => p.verify(&frames, &gallery, threshold),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        cache,
        sessions_ready: Arc::new(AtomicBool::new(false)),
    }
}

/// The three sessions, owned by the engine thread.
struct Pipeline {
    detector: FaceDetector,
    landmarks: LandmarkModel,
    extractor: DescriptorExtractor,
}

impl Pipeline {
    fn load(paths: &ModelPaths) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(&paths.detection)?;
        let landmarks = LandmarkModel::load(&paths.landmark)?;
        let extractor = DescriptorExtractor::load(&paths.recognition)?;
        tracing::info!("inference pipeline ready");
        Ok(Self {
            detector,
            landmarks,
            extractor,
        })
    }

    /// One detection pass: detect, then landmarks + descriptor only when the
    /// frame contains exactly one face.
    fn analyze(&mut self, frame: &Frame) -> Result<FrameReport, EngineError> {
        let faces = self
            .detector
            .detect(&frame.data, frame.width, frame.height)?;

        match faces.len() {
            0 => Ok(FrameReport::NoFace),
            1 => {
                let face = &faces[0];
                let points =
                    self.landmarks
                        .locate(&frame.data, frame.width, frame.height, face)?;
                let descriptor =
                    self.extractor
                        .extract(&frame.data, frame.width, frame.height, &points)?;

                let mut detection = face.clone();
                detection.landmarks = Some(points);

                Ok(FrameReport::OneFace {
                    detection,
                    descriptor,
                })
            }
            count => Ok(FrameReport::MultipleFaces { count }),
        }
    }

    /// Best match across the captured frames. Frames without exactly one
    /// face are skipped; if nothing was usable, that is an error.
    fn verify(
        &mut self,
        frames: &[Frame],
        gallery: &[MemberFace],
        threshold: f32,
    ) -> Result<MatchResult, EngineError> {
        let matcher = CosineMatcher;
        let mut best: Option<MatchResult> = None;
        let mut any_face = false;

        for frame in frames {
            let report = self.analyze(frame)?;
            if report.face_count() > 0 {
                any_face = true;
            }
            let Some(descriptor) = report.descriptor() else {
                continue;
            };

            let result = matcher.compare(descriptor, gallery, threshold);
            let better = match &best {
                None => true,
                Some(prev) => result.similarity > prev.similarity,
            };
            if better {
                best = Some(result);
            }
        }

        if !any_face {
            return Err(EngineError::NoFaceDetected);
        }

        Ok(best.unwrap_or(MatchResult {
            matched: false,
            similarity: 0.0,
            member: None,
            face_id: None,
        }))
    }
}
