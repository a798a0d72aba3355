//! Offline calibration of the rig: per-camera intrinsics, pairwise extrinsics and
//! the stereo rectification derived from them.

use crate::camera::{CameraId, CameraModelError};
use crate::geometry::GeometryError;
use serde::{Deserialize, Serialize};

pub mod intrinsic;
pub mod rectification;
pub mod stereo;
pub mod target;

pub use intrinsic::{calibrate_intrinsics, IntrinsicCalibration, IntrinsicOptions};
pub use rectification::{RectificationMap, StereoRectification};
pub use stereo::{calibrate_stereo, StereoCalibration, StereoOptions};
pub use target::{CalibrationSample, PlanarTarget, SampleStore};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationError {
    #[error("Camera {camera_id}: {found} calibration samples, at least {required} required")]
    InsufficientSamples {
        camera_id: CameraId,
        found: usize,
        required: usize,
    },
    #[error("Calibration is degenerate: {0}")]
    CalibrationDegenerate(String),
    #[error("Camera {0} is not calibrated")]
    NotCalibrated(CameraId),
    #[error("Camera {camera_id} is not part of a {camera_count}-camera rig")]
    UnknownCamera {
        camera_id: CameraId,
        camera_count: usize,
    },
    #[error("Sample {sample} has {found} points, the target has {expected}")]
    SampleSizeMismatch {
        sample: usize,
        found: usize,
        expected: usize,
    },
    #[error("Numerical failure: {0}")]
    Numerical(String),
    #[error("Camera model error: {0}")]
    Model(#[from] CameraModelError),
}

impl From<GeometryError> for CalibrationError {
    fn from(err: GeometryError) -> Self {
        match err {
            GeometryError::Degenerate(reason) => CalibrationError::CalibrationDegenerate(reason),
            other => CalibrationError::Numerical(other.to_string()),
        }
    }
}
