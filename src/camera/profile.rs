//! Calibrated camera together with its pose in the rig.

use crate::camera::{CameraId, CameraModel, CameraModelError, RadTanModel};
use nalgebra::{Isometry3, Matrix3, Matrix3x4, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Intrinsics, distortion and extrinsics of one camera of the rig.
///
/// Extrinsics follow `X_cam = rotation * X_ref + translation`, where `X_ref` is
/// expressed in the reference camera's frame. The reference camera carries the
/// identity rotation and a zero translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraProfile {
    pub camera_id: CameraId,
    pub model: RadTanModel,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// RMS reprojection error of the calibration that produced this profile.
    #[serde(default)]
    pub rms_error: Option<f64>,
}

impl CameraProfile {
    /// Profile placed at the rig origin.
    pub fn new(camera_id: CameraId, model: RadTanModel) -> Self {
        CameraProfile {
            camera_id,
            model,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            rms_error: None,
        }
    }

    pub fn with_extrinsics(mut self, rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        self.rotation = rotation;
        self.translation = translation;
        self
    }

    /// Reference-to-camera transform.
    pub fn extrinsics(&self) -> Isometry3<f64> {
        let rotation = Rotation3::from_matrix(&self.rotation);
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }

    pub fn set_extrinsics(&mut self, pose: &Isometry3<f64>) {
        self.rotation = pose.rotation.to_rotation_matrix().into_inner();
        self.translation = pose.translation.vector;
    }

    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        self.model.intrinsics.matrix()
    }

    /// `P = K [R | t]` for ideal (undistorted) pixels.
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        rt.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        self.intrinsic_matrix() * rt
    }

    /// Projects a point given in the reference frame through the full lens model.
    pub fn project(&self, point_ref: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let point_cam = self.rotation * point_ref + self.translation;
        self.model.project_unbounded(&point_cam)
    }

    /// Camera center expressed in the reference frame.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    /// Checks the lens model and that the rotation is proper and orthonormal.
    pub fn validate(&self) -> Result<(), CameraModelError> {
        self.model.validate_params()?;
        let orthogonality = (self.rotation.transpose() * self.rotation - Matrix3::identity()).norm();
        if orthogonality > 1e-6 || (self.rotation.determinant() - 1.0).abs() > 1e-6 {
            return Err(CameraModelError::InvalidParams(format!(
                "Camera {} rotation is not a proper rotation",
                self.camera_id
            )));
        }
        if self.translation.iter().any(|t| !t.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "Camera {} translation must be finite",
                self.camera_id
            )));
        }
        Ok(())
    }
}

/// On-disk calibration of a whole rig.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub cameras: Vec<CameraProfile>,
}

impl CalibrationFile {
    /// Loads a rig calibration from a YAML file.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`] if the file cannot be read.
    /// * [`CameraModelError::YamlError`] if the document is malformed.
    /// * Any validation error of the contained profiles.
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let file: CalibrationFile = serde_yaml::from_str(&contents)?;
        for profile in &file.cameras {
            profile.validate()?;
        }
        Ok(file)
    }

    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraModelError> {
        let yaml_string = serde_yaml::to_string(self)?;
        fs::write(path, yaml_string)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use approx::assert_relative_eq;

    fn profile() -> CameraProfile {
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: 800.0,
                fy: 790.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [-0.1, 0.02, 0.001, -0.0005, 0.0],
        };
        let rotation = Rotation3::from_euler_angles(0.01, -0.02, 0.005).into_inner();
        CameraProfile::new(1, model).with_extrinsics(rotation, Vector3::new(-60.0, 1.0, 2.0))
    }

    #[test]
    fn test_profile_projection_matrix_matches_lens_free_projection() {
        let mut profile = profile();
        profile.model.distortions = [0.0; 5];
        let point = Vector3::new(30.0, -20.0, 700.0);

        let homogeneous = profile.projection_matrix() * point.push(1.0);
        let from_matrix = Vector2::new(
            homogeneous.x / homogeneous.z,
            homogeneous.y / homogeneous.z,
        );
        let projected = profile.project(&point).unwrap();
        assert_relative_eq!(from_matrix, projected, epsilon = 1e-9);
    }

    #[test]
    fn test_profile_extrinsics_round_trip() {
        let original = profile();
        let mut copy = CameraProfile::new(1, original.model.clone());
        copy.set_extrinsics(&original.extrinsics());
        assert_relative_eq!(copy.rotation, original.rotation, epsilon = 1e-12);
        assert_relative_eq!(copy.translation, original.translation, epsilon = 1e-12);

        let center = original.center();
        let in_camera = original.rotation * center + original.translation;
        assert_relative_eq!(in_camera, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_profile_validate_rejects_reflection() {
        let mut profile = profile();
        assert!(profile.validate().is_ok());
        profile.rotation[(0, 0)] = -profile.rotation[(0, 0)];
        assert!(matches!(
            profile.validate(),
            Err(CameraModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_calibration_file_yaml_round_trip() {
        std::fs::create_dir_all("output").expect("Failed to create output directory for test.");
        let output_path = "output/calibration_file_round_trip.yaml";

        let file = CalibrationFile {
            cameras: vec![CameraProfile::new(0, profile().model), profile()],
        };
        file.save_to_yaml(output_path).unwrap();
        let loaded = CalibrationFile::load_from_yaml(output_path).unwrap();

        assert_eq!(loaded.cameras.len(), 2);
        assert_eq!(loaded.cameras[1].camera_id, 1);
        assert_relative_eq!(loaded.cameras[1].rotation, file.cameras[1].rotation, epsilon = 1e-12);
        assert_eq!(loaded.cameras[1].model.distortions, file.cameras[1].model.distortions);

        std::fs::remove_file(output_path).unwrap();
    }
}
