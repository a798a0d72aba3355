//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct, the pinhole camera with
//! Brown-Conrady lens distortion that every physical camera of the rig is
//! calibrated to. It adheres to the [`CameraModel`] trait defined in the
//! parent `camera` module ([`crate::camera`]).

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of values in [`RadTanModel::parameters`].
pub const RAD_TAN_PARAMETER_COUNT: usize = 9;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// This struct holds the intrinsic parameters (focal length, principal point),
/// image resolution, and a set of 5 distortion coefficients that define
/// the radial and tangential distortion characteristics of the camera lens.
///
/// The distortion coefficients are typically denoted as:
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use multicam_recon::camera::rad_tan::RadTanModel;
/// use multicam_recon::camera::Resolution;
///
/// // Parameters: fx, fy, cx, cy, k1, k2, p1, p2, k3
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0, // Intrinsics
///     0.1, -0.05, 0.001, 0.001, 0.02 // Distortion (k1, k2, p1, p2, k3)
/// ]);
/// let mut rad_tan_model = RadTanModel::new(&params).unwrap();
/// rad_tan_model.resolution = Resolution { width: 640, height: 480 };
///
/// assert_eq!(rad_tan_model.intrinsics.fx, 500.0);
/// assert_eq!(rad_tan_model.distortions[0], 0.1); // k1
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from a vector of parameters.
    ///
    /// The resolution is initialized to 0x0 and should be set by the caller.
    ///
    /// # Arguments
    ///
    /// * `parameters` - `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if the vector is too short.
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < RAD_TAN_PARAMETER_COUNT {
            return Err(CameraModelError::InvalidParams(format!(
                "RadTan model needs {} parameters, got {}",
                RAD_TAN_PARAMETER_COUNT,
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            distortions: [
                parameters[4], // k1
                parameters[5], // k2
                parameters[6], // p1
                parameters[7], // p2
                parameters[8], // k3
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Distortion-free model with the given intrinsics and resolution.
    pub fn from_intrinsics(intrinsics: Intrinsics, resolution: Resolution) -> Self {
        RadTanModel {
            intrinsics,
            resolution,
            distortions: [0.0; 5],
        }
    }

    /// The parameter vector `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` consumed by the optimizers.
    pub fn parameters(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions[0],
            self.distortions[1],
            self.distortions[2],
            self.distortions[3],
            self.distortions[4],
        ])
    }

    /// Applies radial and tangential distortion to a point on the normalized image plane.
    pub fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let (x, y) = (point.x, point.y);

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Inverts [`RadTanModel::distort`] with Newton's method.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the Jacobian becomes singular or the
    /// iteration does not converge.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 100;

        let mut point = *distorted;

        for _ in 0..MAX_ITERATIONS {
            let error = self.distort(&point) - distorted;
            if error.norm() < EPS {
                return Ok(point);
            }

            let (x, y) = (point.x, point.y);
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            // d(radial)/d(r2)
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);
            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })?;

            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations.",
            MAX_ITERATIONS
        )))
    }

    /// Projection through the full distortion model, without the image-bounds check.
    pub fn project_unbounded(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.intrinsics.to_pixel(&self.distort(&normalized)))
    }

    /// Removes lens distortion from an observed pixel, returning the ideal pinhole pixel.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let normalized = self.undistort(&self.intrinsics.to_normalized(pixel))?;
        Ok(self.intrinsics.to_pixel(&normalized))
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to 2D image coordinates, applying distortion.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    /// * [`CameraModelError::ProjectionOutSideImage`]: If the projected 2D point falls outside the camera's resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = self.project_unbounded(point_3d)?;
        if !self.resolution.contains(&pixel) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    /// Unprojects a distorted pixel to a unit ray in camera coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`]: If the input 2D point is outside the camera's resolution.
    /// * [`CameraModelError::NumericalError`]: If the iterative undistortion fails to converge.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let point = self.undistort(&self.intrinsics.to_normalized(point_2d))?;
        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics.clone()
    }

    /// The coefficients are returned in the order: `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}
