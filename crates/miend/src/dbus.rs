//! D-Bus interface for the check-in kiosk daemon.
//!
//! Bus name: org.mien.Kiosk1
//! Object path: /org/mien/Kiosk1
//!
//! Errors cross the bus as human-readable strings; callers retry
//! explicitly, nothing here retries on their behalf.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::enroll::{EnrollStep, EnrollmentFlow};
use crate::scanner::Scanner;
use crate::store::FaceStore;
use mien_core::FrameReport;
use mien_hw::{CameraError, CameraProvider, Frame, FrameGrabber, V4lCamera};
use mien_notify::{Fanout, NotificationDraft};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;
use zbus::interface;

pub type KioskScanner = Scanner<EngineHandle, V4lCamera>;

pub struct KioskService {
    scanner: Arc<Mutex<KioskScanner>>,
    engine: EngineHandle,
    camera: Arc<V4lCamera>,
    store: FaceStore,
    fanout: Fanout,
    enrollments: Arc<Mutex<HashMap<String, EnrollmentFlow>>>,
    similarity_threshold: f32,
    frames_per_enroll: usize,
    frames_per_verify: usize,
}

impl KioskService {
    pub fn new(
        scanner: Arc<Mutex<KioskScanner>>,
        engine: EngineHandle,
        camera: Arc<V4lCamera>,
        store: FaceStore,
        fanout: Fanout,
        config: &Config,
    ) -> Self {
        Self {
            scanner,
            engine,
            camera,
            store,
            fanout,
            enrollments: Arc::new(Mutex::new(HashMap::new())),
            similarity_threshold: config.similarity_threshold,
            frames_per_enroll: config.frames_per_enroll,
            frames_per_verify: config.frames_per_verify,
        }
    }

    /// The live scan owns the camera exclusively while it runs.
    async fn reject_if_scanning(&self) -> zbus::fdo::Result<()> {
        if self.scanner.lock().await.is_scanning() {
            return Err(failure("camera is in use by the live scan — stop it first"));
        }
        Ok(())
    }
}

#[interface(name = "org.mien.Kiosk1")]
impl KioskService {
    /// Start the live detection loop. Returns false if already scanning.
    async fn scan_start(&self) -> zbus::fdo::Result<bool> {
        self.scanner.lock().await.start().map_err(failure)
    }

    /// Stop the loop and release the camera. No-op when idle.
    async fn scan_stop(&self) -> zbus::fdo::Result<()> {
        self.scanner.lock().await.stop();
        Ok(())
    }

    /// Current scan phase, prompt message and last face count, as JSON.
    async fn scan_status(&self) -> zbus::fdo::Result<String> {
        let status = self.scanner.lock().await.status();
        Ok(serde_json::json!({
            "phase": status.phase,
            "message": status.message,
            "faces": status.last_report.as_ref().map(|r| r.face_count()),
        })
        .to_string())
    }

    /// Block until the live scan reports exactly one face, or the timeout
    /// elapses. Returns face presence and detection confidence as JSON;
    /// descriptors never cross the bus.
    async fn scan_wait_for_face(&self, timeout_ms: u64) -> zbus::fdo::Result<String> {
        let mut updates = {
            let scanner = self.scanner.lock().await;
            if !scanner.is_scanning() {
                return Err(failure("no scan in progress"));
            }
            scanner.subscribe()
        };

        let waited = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                {
                    let status = updates.borrow();
                    if let Some(FrameReport::OneFace { detection, .. }) = &status.last_report {
                        return Some(detection.confidence);
                    }
                }
                if updates.changed().await.is_err() {
                    // Scanner went away; nothing more will be reported.
                    return None;
                }
            }
        })
        .await;

        let payload = match waited {
            Ok(Some(confidence)) => {
                serde_json::json!({ "face": true, "confidence": confidence })
            }
            Ok(None) | Err(_) => serde_json::json!({ "face": false }),
        };
        Ok(payload.to_string())
    }

    /// Capture stills for a member and stage the best descriptor.
    async fn enroll_capture(&self, member: &str, label: &str) -> zbus::fdo::Result<String> {
        self.reject_if_scanning().await?;
        self.engine.prepare().await.map_err(failure)?;

        let frames = capture_stills(self.camera.clone(), self.frames_per_enroll)
            .await
            .map_err(failure)?;

        let mut flows = self.enrollments.lock().await;
        let stale = flows
            .get(member)
            .map(|f| f.step() == EnrollStep::Saved)
            .unwrap_or(true);
        if stale {
            flows.insert(member.to_string(), EnrollmentFlow::new(member, label));
        }
        let Some(flow) = flows.get_mut(member) else {
            return Err(failure("enrollment state lost"));
        };

        let confidence = flow
            .capture(&self.engine, frames)
            .await
            .map_err(failure)?;

        Ok(serde_json::json!({
            "member": member,
            "step": flow.step(),
            "confidence": confidence,
        })
        .to_string())
    }

    /// Persist the staged descriptor for a member.
    async fn enroll_confirm(&self, member: &str) -> zbus::fdo::Result<String> {
        let mut flows = self.enrollments.lock().await;
        let Some(flow) = flows.get_mut(member) else {
            return Err(failure(format!("no enrollment in progress for {member}")));
        };

        let record = flow.confirm(&self.store).await.map_err(failure)?;
        flows.remove(member);

        self.fanout.send(NotificationDraft {
            sender: "kiosk".into(),
            recipient: member.into(),
            subject: "Face enrolled".into(),
            body: "You can now check in by camera at the front desk.".into(),
            related_event: Some(format!("enrollment:{}", record.id)),
        });

        Ok(serde_json::json!({
            "id": record.id,
            "member": record.member,
            "label": record.label,
            "created_at": record.created_at,
        })
        .to_string())
    }

    /// Discard an in-progress enrollment.
    async fn enroll_cancel(&self, member: &str) -> zbus::fdo::Result<bool> {
        Ok(self.enrollments.lock().await.remove(member).is_some())
    }

    /// Capture frames and match them against a member's enrolled face.
    async fn verify(&self, member: &str) -> zbus::fdo::Result<String> {
        self.reject_if_scanning().await?;

        let Some(face) = self.store.get_face(member).await.map_err(failure)? else {
            return Err(failure(format!("{member} has no enrolled face")));
        };

        self.engine.prepare().await.map_err(failure)?;
        let frames = capture_stills(self.camera.clone(), self.frames_per_verify)
            .await
            .map_err(failure)?;

        let result = self
            .engine
            .verify(frames, vec![face], self.similarity_threshold)
            .await
            .map_err(failure)?;

        if result.matched {
            self.fanout.send(NotificationDraft {
                sender: "kiosk".into(),
                recipient: member.into(),
                subject: "Checked in".into(),
                body: "Face check-in confirmed. Have a good workout!".into(),
                related_event: Some("check-in".into()),
            });
        }

        Ok(serde_json::json!({
            "matched": result.matched,
            "similarity": result.similarity,
        })
        .to_string())
    }

    /// List enrolled members (without descriptors), as JSON.
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        let faces = self.store.list().await.map_err(failure)?;
        serde_json::to_string(&faces).map_err(failure)
    }

    /// Remove a member's enrollment.
    async fn remove_face(&self, member: &str) -> zbus::fdo::Result<bool> {
        self.store.remove_face(member).await.map_err(failure)
    }

    /// Daemon status summary, as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let scan = self.scanner.lock().await.status();
        let enrolled = self.store.list().await.map_err(failure)?.len();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "scan_phase": scan.phase,
            "scan_message": scan.message,
            "models": self.engine.models_state().await,
            "enrolled": enrolled,
        })
        .to_string())
    }

    /// Full notification ledger, as JSON.
    async fn notifications(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.fanout.snapshot()).map_err(failure)
    }

    /// Mark a notification read.
    async fn mark_notification_read(&self, id: &str) -> zbus::fdo::Result<bool> {
        let id: Uuid = id.parse().map_err(failure)?;
        Ok(self.fanout.mark_read(id))
    }
}

/// Open a short-lived camera session and grab `count` stills. The session
/// is dropped before returning on every path.
async fn capture_stills(camera: Arc<V4lCamera>, count: usize) -> Result<Vec<Frame>, CameraError> {
    tokio::task::spawn_blocking(move || {
        let mut session = camera.open_session()?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(session.grab()?);
        }
        Ok(frames)
    })
    .await
    .map_err(|_| CameraError::CaptureFailed("capture task aborted".into()))?
}

fn failure<E: std::fmt::Display>(e: E) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}
