//! Intrinsic calibration of a single camera from planar target samples (Zhang's method).

use crate::calibration::{CalibrationError, CalibrationSample, PlanarTarget};
use crate::camera::{CameraId, CameraProfile, Intrinsics, Resolution};
use crate::optimization::{IntrinsicOptimizationCost, Optimizer, SolverOptions};
use crate::util::ProjectionError;
use log::{info, warn};
use nalgebra::{DMatrix, Isometry3, Matrix3, SVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicOptions {
    /// Fewer samples than this fail with [`CalibrationError::InsufficientSamples`].
    pub min_samples: usize,
    /// Pins the principal point to the image center.
    pub fix_principal_point: bool,
    /// Forces `fy = fx` (square pixels).
    pub fix_aspect_ratio: bool,
    /// Forces `p1 = p2 = 0`.
    pub zero_tangential: bool,
    /// Forces `k3 = 0`.
    pub fix_k3: bool,
    /// RMS reprojection error (px) above which a calibration is flagged as suspect.
    pub suspect_rms_threshold: f64,
    pub solver: SolverOptions,
}

impl Default for IntrinsicOptions {
    fn default() -> Self {
        IntrinsicOptions {
            min_samples: 10,
            fix_principal_point: false,
            fix_aspect_ratio: false,
            zero_tangential: false,
            fix_k3: false,
            suspect_rms_threshold: 1.0,
            solver: SolverOptions {
                max_iterations: 100,
                relative_tolerance: 1e-10,
                absolute_tolerance: 1e-12,
            },
        }
    }
}

/// Result of a successful intrinsic calibration.
#[derive(Debug, Clone)]
pub struct IntrinsicCalibration {
    /// Calibrated camera placed at the rig origin; extrinsics are set by stereo calibration.
    pub profile: CameraProfile,
    /// Target-to-camera pose of every sample, in sample order.
    pub sample_poses: Vec<Isometry3<f64>>,
    pub error: ProjectionError,
    /// RMS exceeded [`IntrinsicOptions::suspect_rms_threshold`].
    pub suspect: bool,
}

/// Calibrates one camera: closed-form initialization followed by Levenberg-Marquardt.
///
/// # Errors
///
/// * [`CalibrationError::InsufficientSamples`] with fewer than `options.min_samples` samples.
/// * [`CalibrationError::SampleSizeMismatch`] if a sample does not match the target layout.
/// * [`CalibrationError::CalibrationDegenerate`] if the sample poses do not constrain the intrinsics.
/// * [`CalibrationError::Numerical`] if the solver fails.
pub fn calibrate_intrinsics(
    camera_id: CameraId,
    samples: &[CalibrationSample],
    target: &PlanarTarget,
    resolution: Resolution,
    options: &IntrinsicOptions,
) -> Result<IntrinsicCalibration, CalibrationError> {
    let required = options.min_samples.max(3);
    if samples.len() < required {
        return Err(CalibrationError::InsufficientSamples {
            camera_id,
            found: samples.len(),
            required,
        });
    }
    for (index, sample) in samples.iter().enumerate() {
        if sample.points.len() != target.point_count() {
            return Err(CalibrationError::SampleSizeMismatch {
                sample: index,
                found: sample.points.len(),
                expected: target.point_count(),
            });
        }
    }

    let mut cost = IntrinsicOptimizationCost::new(resolution, target, samples, *options);
    cost.linear_estimation()?;
    cost.optimize(false)?;

    let error = cost.reprojection_error();
    let suspect = error.rmse > options.suspect_rms_threshold;
    if suspect {
        warn!(
            "Camera {} calibration RMS {:.4} px exceeds {:.4} px",
            camera_id, error.rmse, options.suspect_rms_threshold
        );
    } else {
        info!("Camera {} calibrated: {}", camera_id, error);
    }

    let mut profile = CameraProfile::new(camera_id, cost.model().clone());
    profile.rms_error = Some(error.rmse);

    Ok(IntrinsicCalibration {
        profile,
        sample_poses: cost.poses().to_vec(),
        error,
        suspect,
    })
}

/// `v_ij` row of Zhang's constraint system for columns `i` and `j` of `H`.
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Closed-form zero-skew intrinsics from at least three plane homographies.
///
/// Solves `V b = 0` for the image of the absolute conic `B = K^-T K^-1`.
pub fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Result<Intrinsics, CalibrationError> {
    if homographies.len() < 3 {
        return Err(CalibrationError::CalibrationDegenerate(format!(
            "need at least 3 homographies, got {}",
            homographies.len()
        )));
    }

    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros((2 * m).max(6), 6);
    for (k, h) in homographies.iter().enumerate() {
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        let v12 = v_ij(h, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let svd = v.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CalibrationError::Numerical("SVD of the conic system failed".to_string()))?;
    let smallest = svd.singular_values.imin();
    let mut b = v_t.row(smallest).transpose();
    // B is positive definite up to scale.
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom <= f64::EPSILON * (b11 * b11 + b22 * b22) || b11 <= 0.0 {
        return Err(CalibrationError::CalibrationDegenerate(
            "target poses do not constrain the focal lengths".to_string(),
        ));
    }

    let cy = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + cy * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 {
        return Err(CalibrationError::CalibrationDegenerate(
            "conic scale is not positive".to_string(),
        ));
    }

    let fx = (lambda / b11).sqrt();
    let fy = (lambda * b11 / denom).sqrt();
    let skew = -b12 * fx * fx * fy / lambda;
    let cx = skew * cy / fy - b13 * fx * fx / lambda;

    Ok(Intrinsics { fx, fy, cx, cy })
}

/// Closed-form zero-skew intrinsics with `fx = fy`.
///
/// Square pixels make `B` take the form `[b11, 0, b13; 0, b11, b23; b13, b23, b33]`,
/// which leaves four unknowns in `V b = 0`.
pub fn square_pixel_intrinsics_from_homographies(
    homographies: &[Matrix3<f64>],
) -> Result<Intrinsics, CalibrationError> {
    if homographies.len() < 2 {
        return Err(CalibrationError::CalibrationDegenerate(format!(
            "need at least 2 homographies, got {}",
            homographies.len()
        )));
    }

    let m = homographies.len();
    let reduce = |row: SVector<f64, 6>| [row[0] + row[2], row[3], row[4], row[5]];
    let mut v = DMatrix::<f64>::zeros((2 * m).max(4), 4);
    for (k, h) in homographies.iter().enumerate() {
        let v12 = reduce(v_ij(h, 0, 1));
        let diagonal = reduce(v_ij(h, 0, 0) - v_ij(h, 1, 1));
        for column in 0..4 {
            v[(2 * k, column)] = v12[column];
            v[(2 * k + 1, column)] = diagonal[column];
        }
    }

    let svd = v.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CalibrationError::Numerical("SVD of the conic system failed".to_string()))?;
    let smallest = svd.singular_values.imin();
    let mut b = v_t.row(smallest).transpose();
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b13, b23, b33) = (b[0], b[1], b[2], b[3]);
    if b11 <= f64::EPSILON * b.norm() {
        return Err(CalibrationError::CalibrationDegenerate(
            "target poses do not constrain the focal length".to_string(),
        ));
    }

    let cx = -b13 / b11;
    let cy = -b23 / b11;
    let lambda = b33 - (b13 * b13 + b23 * b23) / b11;
    if lambda <= 0.0 {
        return Err(CalibrationError::CalibrationDegenerate(
            "conic scale is not positive".to_string(),
        ));
    }
    let focal = (lambda / b11).sqrt();

    Ok(Intrinsics {
        fx: focal,
        fy: focal,
        cx,
        cy,
    })
}
