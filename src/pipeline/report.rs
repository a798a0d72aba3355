//! Results returned by the pipeline operations.

use crate::calibration::{CalibrationError, StereoCalibration};
use crate::camera::{CameraId, CameraProfile};
use crate::depth::DenseDepth;
use crate::features::{CorrespondenceSet, FeatureSet};
use crate::measurement::MeasurementReport;
use crate::optimization::bundle::FixedReason;
use crate::reconstruction::Reconstruction;
use crate::util::ProjectionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    DenseDepth,
    Triangulation,
}

/// Non-fatal outcome of one stage of a frame pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageIssue {
    DecodeFailure {
        camera_id: CameraId,
        reason: String,
    },
    SynchronizationWarning {
        spread_seconds: f64,
        tolerance_seconds: f64,
    },
    InsufficientCorrespondences {
        found: usize,
        required: usize,
    },
    UnreliableTriangulation {
        mean_error: f64,
    },
    /// Correspondences dropped because they could not be triangulated.
    RejectedCorrespondences {
        count: usize,
    },
    StageSkipped {
        stage: Stage,
        reason: String,
    },
}

impl fmt::Display for StageIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageIssue::DecodeFailure { camera_id, reason } => {
                write!(f, "camera {} frame could not be decoded: {}", camera_id, reason)
            }
            StageIssue::SynchronizationWarning {
                spread_seconds,
                tolerance_seconds,
            } => write!(
                f,
                "frame timestamps spread {:.1} ms (tolerance {:.1} ms)",
                spread_seconds * 1e3,
                tolerance_seconds * 1e3
            ),
            StageIssue::InsufficientCorrespondences { found, required } => {
                write!(f, "{} correspondences, at least {} required", found, required)
            }
            StageIssue::UnreliableTriangulation { mean_error } => {
                write!(f, "triangulation mean reprojection error {:.3} px", mean_error)
            }
            StageIssue::RejectedCorrespondences { count } => {
                write!(f, "{} correspondences could not be triangulated", count)
            }
            StageIssue::StageSkipped { stage, reason } => write!(f, "{:?} skipped: {}", stage, reason),
        }
    }
}

/// Everything computed from one synchronized frame set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameResult {
    /// Cameras whose frames were processed.
    pub cameras: Vec<CameraId>,
    /// Earliest capture time in the set.
    pub timestamp: Option<f64>,
    pub depth: Option<DenseDepth>,
    pub features: BTreeMap<CameraId, FeatureSet>,
    pub correspondences: Option<CorrespondenceSet>,
    pub reconstruction: Option<Reconstruction>,
    pub measurement: MeasurementReport,
    pub issues: Vec<StageIssue>,
}

impl FrameResult {
    pub fn has_issue(&self, predicate: impl Fn(&StageIssue) -> bool) -> bool {
        self.issues.iter().any(predicate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicSummary {
    pub profile: CameraProfile,
    pub error: ProjectionError,
    pub suspect: bool,
}

/// Per-camera outcome of a calibration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub intrinsics: BTreeMap<CameraId, Result<IntrinsicSummary, CalibrationError>>,
    /// Pose of every non-reference camera relative to the reference camera.
    pub extrinsics: BTreeMap<CameraId, Result<StereoCalibration, CalibrationError>>,
    /// Rectification of the primary pair; `None` for a single-camera rig.
    pub rectification: Option<Result<(CameraId, CameraId), CalibrationError>>,
    /// Whether the run replaced the published calibration.
    pub published: bool,
}

impl CalibrationReport {
    /// Cameras with both intrinsics and (for non-reference cameras) extrinsics.
    pub fn calibrated_cameras(&self) -> Vec<CameraId> {
        self.intrinsics
            .iter()
            .filter(|(id, result)| {
                result.is_ok() && self.extrinsics.get(id).map_or(true, |pose| pose.is_ok())
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.calibrated_cameras().len() == self.intrinsics.len()
            && self.rectification.as_ref().map_or(true, |r| r.is_ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub initial_rms: f64,
    pub final_rms: f64,
    pub optimized: Vec<CameraId>,
    pub fixed: Vec<(CameraId, FixedReason)>,
    pub rectification_rebuilt: bool,
    /// False when another calibration was published while the optimization ran.
    pub published: bool,
}
