//! mien-hw — Camera capture for the check-in kiosk.
//!
//! V4L2-backed camera sessions with exclusive ownership and deterministic
//! release, plus grayscale frame conversion.

pub mod camera;
pub mod frame;

pub use camera::{
    list_devices, CameraError, CameraProvider, CameraSession, DeviceInfo, FrameGrabber,
    PixelFormat, V4lCamera,
};
pub use frame::Frame;
