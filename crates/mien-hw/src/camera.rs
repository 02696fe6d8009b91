//! V4L2 camera sessions via the `v4l` crate.
//!
//! A [`CameraSession`] exclusively owns the device while it is alive and is
//! released deterministically by dropping it — the owning flow must never
//! leave a session open after it stops. The [`CameraProvider`] trait seams
//! device acquisition so callers can substitute fakes.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera access denied: {0}")]
    AccessDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel — the common webcam default.
    Yuyv,
    /// 8-bit grayscale, 1 byte/pixel.
    Grey,
}

/// Source of grayscale frames. Implemented by [`CameraSession`] and by
/// test fakes.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Opens camera sessions. One session at a time is assumed; the session
/// owns the device until dropped.
pub trait CameraProvider: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn FrameGrabber>, CameraError>;
}

/// V4L2 camera configuration used to open sessions.
#[derive(Debug, Clone)]
pub struct V4lCamera {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl V4lCamera {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }
}

impl CameraProvider for V4lCamera {
    fn open_session(&self) -> Result<Box<dyn FrameGrabber>, CameraError> {
        let session = CameraSession::open(&self.device_path, self.width, self.height)?;
        Ok(Box::new(session))
    }
}

/// Live capture session holding the device exclusively.
pub struct CameraSession {
    device: Device,
    device_path: String,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl CameraSession {
    /// Open a device and negotiate the requested resolution.
    ///
    /// Returns only after the driver has confirmed the capture format, so a
    /// successful open means the stream is ready to deliver frames.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                CameraError::AccessDenied(format!("{device_path}: {e}"))
            } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera session opened"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    fn buf_to_gray(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_gray(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
        }
    }
}

impl FrameGrabber for CameraSession {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self.buf_to_gray(buf)?;

        Ok(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            captured_at: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "camera session released");
    }
}

/// Info about a discovered V4L2 capture device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
        });
    }

    devices
}
