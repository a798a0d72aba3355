//! Extrinsic calibration of a camera pair with both lenses held fixed.

use crate::calibration::{CalibrationError, CalibrationSample, PlanarTarget};
use crate::camera::{CameraId, CameraProfile, RadTanModel};
use crate::geometry::{epipolar_distance, essential_from_extrinsics, fundamental_from_essential};
use crate::optimization::{Optimizer, SolverOptions, StereoOptimizationCost};
use crate::util::ProjectionError;
use log::{info, warn};
use nalgebra::{Isometry3, Matrix2, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoOptions {
    pub max_iterations: usize,
    pub relative_tolerance: f64,
    /// Pairs whose relative-pose Jacobian is worse conditioned than this are rejected.
    pub max_condition_number: f64,
    pub min_shared_samples: usize,
    /// Samples whose undistorted corners have a minor-to-major spread below
    /// this ratio in either view show the target edge-on and are dropped.
    pub min_target_spread: f64,
}

impl Default for StereoOptions {
    fn default() -> Self {
        StereoOptions {
            max_iterations: 100,
            relative_tolerance: 1e-5,
            max_condition_number: 1e6,
            min_shared_samples: 3,
            min_target_spread: 1e-3,
        }
    }
}

impl StereoOptions {
    fn solver(&self) -> SolverOptions {
        SolverOptions {
            max_iterations: self.max_iterations,
            relative_tolerance: self.relative_tolerance,
            ..SolverOptions::default()
        }
    }
}

/// Relative geometry of a calibrated pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibration {
    pub left_id: CameraId,
    pub right_id: CameraId,
    /// `X_right = rotation * X_left + translation`.
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    /// Two-view reprojection statistics at the solution.
    pub error: ProjectionError,
    /// Mean distance (px) of the undistorted right observations from their epipolar lines.
    pub mean_epipolar_error: f64,
    pub condition_number: f64,
    pub shared_samples: usize,
}

impl StereoCalibration {
    pub fn extrinsics(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&self.rotation)),
        )
    }

    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

/// Ratio of the minor to the major standard deviation of the undistorted
/// corners. Zero when they are collinear.
fn target_spread(model: &RadTanModel, sample: &CalibrationSample) -> Result<f64, CalibrationError> {
    let ideal = sample
        .points
        .iter()
        .map(|p| model.undistort_pixel(p))
        .collect::<Result<Vec<_>, _>>()?;
    if ideal.is_empty() {
        return Ok(0.0);
    }
    let n = ideal.len() as f64;
    let mean = ideal.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let covariance = ideal.iter().fold(Matrix2::zeros(), |acc, p| {
        let d = p - mean;
        acc + d * d.transpose()
    }) / n;
    let eigenvalues = covariance.symmetric_eigenvalues();
    let major = eigenvalues.max();
    if major <= f64::EPSILON {
        return Ok(0.0);
    }
    Ok((eigenvalues.min().max(0.0) / major).sqrt())
}

/// Solves the pose of `right` relative to `left` from index-aligned samples.
///
/// Sample pairs in which either camera sees the target edge-on carry no
/// planar pose and are left out.
///
/// # Errors
///
/// * [`CalibrationError::InsufficientSamples`] (reported for `right`) with fewer
///   than `options.min_shared_samples` shared samples.
/// * [`CalibrationError::CalibrationDegenerate`] if fewer than
///   `options.min_shared_samples` pairs show the target with a usable spread,
///   or if the relative pose is not observable from the samples.
pub fn calibrate_stereo(
    left: &CameraProfile,
    right: &CameraProfile,
    target: &PlanarTarget,
    left_samples: &[CalibrationSample],
    right_samples: &[CalibrationSample],
    options: &StereoOptions,
) -> Result<StereoCalibration, CalibrationError> {
    let shared = left_samples.len().min(right_samples.len());
    let required = options.min_shared_samples.max(1);
    if shared < required {
        return Err(CalibrationError::InsufficientSamples {
            camera_id: right.camera_id,
            found: shared,
            required,
        });
    }

    let mut usable_left = Vec::with_capacity(shared);
    let mut usable_right = Vec::with_capacity(shared);
    for (index, (l, r)) in left_samples.iter().zip(right_samples.iter()).enumerate() {
        let spread = target_spread(&left.model, l)?.min(target_spread(&right.model, r)?);
        if spread < options.min_target_spread {
            warn!(
                "Cameras {} and {}: sample {} shows the target edge-on (spread {:.2e}), skipping",
                left.camera_id, right.camera_id, index, spread
            );
            continue;
        }
        usable_left.push(l.clone());
        usable_right.push(r.clone());
    }
    if usable_left.len() < required {
        return Err(CalibrationError::CalibrationDegenerate(format!(
            "cameras {} and {} share only {} samples with a usable target spread, {} required",
            left.camera_id,
            right.camera_id,
            usable_left.len(),
            required
        )));
    }
    let shared = usable_left.len();

    let mut cost = StereoOptimizationCost::new(
        &left.model,
        &right.model,
        target,
        &usable_left,
        &usable_right,
        options.solver(),
    );
    cost.linear_estimation()?;
    cost.optimize(false)?;

    let condition_number = cost.relative_pose_condition_number();
    if !condition_number.is_finite() || condition_number > options.max_condition_number {
        warn!(
            "Cameras {} and {}: relative pose is degenerate (condition number {:.3e})",
            left.camera_id, right.camera_id, condition_number
        );
        return Err(CalibrationError::CalibrationDegenerate(format!(
            "relative pose of cameras {} and {} has condition number {:.3e}",
            left.camera_id, right.camera_id, condition_number
        )));
    }

    let relative = cost.relative_pose();
    let rotation = relative.rotation.to_rotation_matrix().into_inner();
    let translation = relative.translation.vector;
    let essential = essential_from_extrinsics(&rotation, &translation);
    let fundamental = fundamental_from_essential(
        &essential,
        &left.intrinsic_matrix(),
        &right.intrinsic_matrix(),
    )?;

    let mut distances = Vec::with_capacity(shared * target.point_count());
    for (l, r) in usable_left.iter().zip(usable_right.iter()) {
        for (pl, pr) in l.points.iter().zip(r.points.iter()) {
            let ideal_left = left.model.undistort_pixel(pl)?;
            let ideal_right = right.model.undistort_pixel(pr)?;
            distances.push(epipolar_distance(&fundamental, &ideal_left, &ideal_right));
        }
    }
    let mean_epipolar_error = if distances.is_empty() {
        0.0
    } else {
        distances.iter().sum::<f64>() / distances.len() as f64
    };

    let error = cost.reprojection_error();
    info!(
        "Stereo pair ({}, {}): baseline {:.3}, RMS {:.4} px, epipolar {:.4} px",
        left.camera_id,
        right.camera_id,
        translation.norm(),
        error.rmse,
        mean_epipolar_error
    );

    Ok(StereoCalibration {
        left_id: left.camera_id,
        right_id: right.camera_id,
        rotation,
        translation,
        essential,
        fundamental,
        error,
        mean_epipolar_error,
        condition_number,
        shared_samples: shared,
    })
}
