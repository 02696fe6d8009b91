//! Live detection loop.
//!
//! A fixed-period loop that classifies each camera frame as zero, one or
//! multiple faces and publishes the result on a watch channel. States:
//!
//! ```text
//! Idle → Starting → LoadingModels → Scanning → (Idle | Error)
//! ```
//!
//! `start()` while a scan is live is ignored. `stop()` is the only reset:
//! it kills the loop task and releases the camera synchronously, from any
//! state. A detection pass that fails updates the status and the loop keeps
//! polling — per-tick errors are never fatal. At most one pass is in flight
//! at a time; ticks that fire while a pass is still running are dropped.

use crate::engine::{EngineError, EngineHandle};
use mien_core::FrameReport;
use mien_hw::{CameraError, CameraProvider, Frame, FrameGrabber};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Runs one detection pass per frame. Seam between the loop and the engine.
pub trait FrameAnalyzer: Clone + Send + Sync + 'static {
    /// Whether models are loaded and passes can run without preparation.
    fn ready(&self) -> bool;
    /// Download/load models as needed. Idempotent.
    fn prepare(&self) -> impl Future<Output = Result<(), EngineError>> + Send;
    /// Classify one frame.
    fn analyze(&self, frame: Frame) -> impl Future<Output = Result<FrameReport, EngineError>> + Send;
}

impl FrameAnalyzer for EngineHandle {
    fn ready(&self) -> bool {
        EngineHandle::ready(self)
    }

    async fn prepare(&self) -> Result<(), EngineError> {
        EngineHandle::prepare(self).await
    }

    async fn analyze(&self, frame: Frame) -> Result<FrameReport, EngineError> {
        EngineHandle::analyze(self, frame).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanPhase {
    Idle,
    Starting,
    LoadingModels,
    Scanning,
    Error,
}

/// Published after every state change and every detection pass.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub message: String,
    /// Classification of the most recent pass. Descriptors stay off the
    /// status surface; consumers read them from here directly.
    #[serde(skip)]
    pub last_report: Option<FrameReport>,
}

impl ScanStatus {
    fn idle() -> Self {
        Self {
            phase: ScanPhase::Idle,
            message: "scan stopped".into(),
            last_report: None,
        }
    }
}

type SharedSession = Arc<Mutex<Option<Box<dyn FrameGrabber>>>>;

/// The detection loop and its camera session.
pub struct Scanner<A, P> {
    analyzer: A,
    provider: Arc<P>,
    interval: Duration,
    session: SharedSession,
    live: Arc<AtomicBool>,
    status: watch::Sender<ScanStatus>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl<A: FrameAnalyzer, P: CameraProvider + 'static> Scanner<A, P> {
    pub fn new(analyzer: A, provider: Arc<P>, interval: Duration) -> Self {
        let (status, _) = watch::channel(ScanStatus::idle());
        Self {
            analyzer,
            provider,
            interval,
            session: Arc::new(Mutex::new(None)),
            live: Arc::new(AtomicBool::new(false)),
            status,
            task: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Begin scanning. Returns `Ok(false)` without side effects when a scan
    /// is already live; a second camera session is never opened.
    pub fn start(&mut self) -> Result<bool, CameraError> {
        if self.live.load(Ordering::SeqCst) {
            tracing::debug!("scan already active, start ignored");
            return Ok(false);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.publish(ScanPhase::Starting, "acquiring camera".into());

        let grabber = match self.provider.open_session() {
            Ok(g) => g,
            Err(e) => {
                self.publish(ScanPhase::Error, format!("camera unavailable: {e}"));
                return Err(e);
            }
        };

        *self.session.lock().expect("camera session lock poisoned") = Some(grabber);
        self.live.store(true, Ordering::SeqCst);

        self.task = Some(tokio::spawn(run_loop(
            self.analyzer.clone(),
            self.session.clone(),
            self.live.clone(),
            self.status.clone(),
            self.interval,
        )));

        Ok(true)
    }

    /// Stop the loop and release the camera, from any state. Safe to call
    /// when nothing is active.
    pub fn stop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Release the camera before returning — it must never stay open
        // after the owning flow stops.
        self.session
            .lock()
            .expect("camera session lock poisoned")
            .take();
        self.status.send_replace(ScanStatus::idle());
    }

    fn publish(&self, phase: ScanPhase, message: String) {
        self.status.send_replace(ScanStatus {
            phase,
            message,
            last_report: None,
        });
    }
}

impl<A, P> Drop for Scanner<A, P> {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Ok(mut session) = self.session.lock() {
            session.take();
        }
    }
}

async fn run_loop<A: FrameAnalyzer>(
    analyzer: A,
    session: SharedSession,
    live: Arc<AtomicBool>,
    status: watch::Sender<ScanStatus>,
    interval: Duration,
) {
    if !analyzer.ready() {
        status.send_replace(ScanStatus {
            phase: ScanPhase::LoadingModels,
            message: "fetching recognition models".into(),
            last_report: None,
        });

        if let Err(e) = analyzer.prepare().await {
            tracing::warn!(error = %e, "model preparation failed");
            live.store(false, Ordering::SeqCst);
            session.lock().expect("camera session lock poisoned").take();
            status.send_replace(ScanStatus {
                phase: ScanPhase::Error,
                message: format!("model load failed: {e}"),
                last_report: None,
            });
            return;
        }
    }

    if !live.load(Ordering::SeqCst) {
        return;
    }

    status.send_replace(ScanStatus {
        phase: ScanPhase::Scanning,
        message: "looking for a face".into(),
        last_report: None,
    });

    let mut ticker = tokio::time::interval(interval);
    // Depth-1 execution: a tick that fires while a pass is still running is
    // dropped, never queued behind it.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !live.load(Ordering::SeqCst) {
            break;
        }

        let shared = session.clone();
        let grabbed = tokio::task::spawn_blocking(move || {
            let mut guard = shared.lock().expect("camera session lock poisoned");
            guard.as_mut().map(|s| s.grab())
        })
        .await;

        let frame = match grabbed {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                if live.load(Ordering::SeqCst) {
                    status.send_replace(ScanStatus {
                        phase: ScanPhase::Scanning,
                        message: format!("capture failed: {e}"),
                        last_report: None,
                    });
                }
                continue;
            }
            // Session already released — the scan was stopped.
            Ok(None) => break,
            Err(_) => break,
        };

        let result = analyzer.analyze(frame).await;

        // The pass may have outlived a stop(); discard stale results.
        if !live.load(Ordering::SeqCst) {
            break;
        }

        match result {
            Ok(report) => {
                let message = match &report {
                    FrameReport::NoFace => "no face in view — step closer to the camera",
                    FrameReport::OneFace { .. } => "face captured",
                    FrameReport::MultipleFaces { .. } => {
                        "multiple faces in view — one member at a time"
                    }
                };
                status.send_replace(ScanStatus {
                    phase: ScanPhase::Scanning,
                    message: message.into(),
                    last_report: Some(report),
                });
            }
            Err(e) => {
                // Non-fatal: report and keep polling.
                tracing::warn!(error = %e, "detection pass failed");
                status.send_replace(ScanStatus {
                    phase: ScanPhase::Scanning,
                    message: format!("detection failed: {e}"),
                    last_report: None,
                });
            }
        }
    }
}
