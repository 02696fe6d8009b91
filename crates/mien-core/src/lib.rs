//! mien-core — Face detection, landmarks and descriptor extraction.
//!
//! A three-model pipeline over grayscale frames: an anchor-free detector,
//! a five-point landmark model, and a recognition model producing 128-d
//! descriptors. Weight sets are fetched lazily through [`models::ModelCache`]
//! and run via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod descriptor;
pub mod detector;
pub mod landmarks;
pub mod models;
mod raster;
pub mod types;

pub use descriptor::DescriptorExtractor;
pub use detector::FaceDetector;
pub use landmarks::LandmarkModel;
pub use models::{HttpFetcher, ModelCache, ModelFetcher, ModelPaths};
pub use types::{
    CosineMatcher, Detection, FaceDescriptor, FrameReport, MatchResult, Matcher, MemberFace,
    DESCRIPTOR_DIM,
};
