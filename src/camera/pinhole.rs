//! Implements the Pinhole camera model.
//!
//! In the rig the pinhole model describes the virtual, distortion-free camera
//! that a stereo rectification produces: the left 3x3 block of a rectified
//! projection matrix `P1`/`P2`.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix3x4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Represents a Pinhole camera model.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use multicam_recon::camera::pinhole::PinholeModel;
/// use multicam_recon::camera::Resolution;
///
/// let params = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0]); // fx, fy, cx, cy
/// let mut pinhole_model = PinholeModel::new(&params).unwrap();
/// pinhole_model.resolution = Resolution { width: 640, height: 480 };
///
/// assert_eq!(pinhole_model.intrinsics.fx, 500.0);
/// assert_eq!(pinhole_model.resolution.width, 640);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
}

impl PinholeModel {
    /// Creates a new [`PinholeModel`] from `[fx, fy, cx, cy]`.
    ///
    /// The resolution is initialized to 0x0 and should be set by the caller.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if fewer than four parameters are given.
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < 4 {
            return Err(CameraModelError::InvalidParams(format!(
                "Pinhole model needs 4 parameters, got {}",
                parameters.len()
            )));
        }
        let model = PinholeModel {
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
        };

        model.validate_params()?;

        Ok(model)
    }

    /// Reads the intrinsic block of a rectified projection matrix `[f 0 cx tx; 0 f cy 0; 0 0 1 0]`.
    pub fn from_projection(
        projection: &Matrix3x4<f64>,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let mut model = Self::new(&DVector::from_vec(vec![
            projection[(0, 0)],
            projection[(1, 1)],
            projection[(0, 2)],
            projection[(1, 2)],
        ]))?;
        model.resolution = resolution;
        Ok(model)
    }

    /// Pinhole projection without the image-bounds check.
    pub fn project_unbounded(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        Ok(self
            .intrinsics
            .to_pixel(&Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z)))
    }
}

impl CameraModel for PinholeModel {
    /// Projects a 3D point with `u = fx * X / Z + cx`, `v = fy * Y / Z + cy`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If Z is too close to zero.
    /// * [`CameraModelError::ProjectionOutSideImage`]: If the pixel falls outside the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = self.project_unbounded(point_3d)?;
        if !self.resolution.contains(&pixel) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let normalized = self.intrinsics.to_normalized(point_2d);
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics.clone()
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rectified_camera() -> PinholeModel {
        let projection = Matrix3x4::new(
            790.0, 0.0, 318.0, -47400.0, //
            0.0, 790.0, 242.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        );
        PinholeModel::from_projection(
            &projection,
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_pinhole_from_projection() {
        let model = rectified_camera();
        assert_eq!(model.intrinsics.fx, 790.0);
        assert_eq!(model.intrinsics.fy, 790.0);
        assert_eq!(model.intrinsics.cx, 318.0);
        assert_eq!(model.intrinsics.cy, 242.0);
        assert!(model.get_distortion().is_empty());
    }

    #[test]
    fn test_pinhole_project_unproject() {
        let model = rectified_camera();
        let point_3d = Vector3::new(0.12, -0.08, 1.4);
        let pixel = model.project(&point_3d).unwrap();
        let ray = model.unproject(&pixel).unwrap();
        assert_relative_eq!(ray, point_3d.normalize(), epsilon = 1e-12);
    }

    #[test]
    fn test_pinhole_rejects_out_of_image() {
        let model = rectified_camera();
        assert!(matches!(
            model.project(&Vector3::new(5.0, 0.0, 1.0)),
            Err(CameraModelError::ProjectionOutSideImage)
        ));
        assert!(model.project_unbounded(&Vector3::new(5.0, 0.0, 1.0)).is_ok());
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }
}
