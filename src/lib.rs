//! Multi-camera Reconstruction Library
//!
//! Calibrates a rig of up to four synchronized cameras and reconstructs
//! metric 3D measurements from its frames:
//! - Per-camera intrinsic calibration from planar target observations
//! - Extrinsic calibration of every camera against the reference camera
//! - Stereo rectification and dense depth with semi-global matching
//! - SIFT features, brute-force matching and sparse triangulation
//! - Joint bundle adjustment of the whole rig
//!
//! Non-linear refinement uses the tiny-solver optimization framework. The
//! [`pipeline::Pipeline`] facade drives every stage and is safe to share
//! between threads.

pub mod calibration;
pub mod camera;
pub mod depth;
pub mod features;
pub mod frame;
pub mod geometry;
pub mod measurement;
pub mod optimization;
pub mod pipeline;
pub mod reconstruction;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use calibration::{CalibrationError, PlanarTarget, StereoRectification};
pub use camera::{CameraId, CameraModel, CameraModelError, CameraProfile, Intrinsics, RadTanModel, Resolution};
pub use optimization::Optimizer;
pub use pipeline::{FrameResult, Pipeline, PipelineConfig, PipelineError};
