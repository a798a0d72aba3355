//! Reprojection residuals shared by the intrinsic, stereo and bundle problems.
//!
//! Every residual is generic over `T: RealField` so that tiny-solver can
//! evaluate it with dual numbers, and the same code evaluated with `f64`
//! gives the plain reprojection errors used for reporting. Residuals are
//! `projected - observed` in pixels, two entries per target point.

use crate::camera::rad_tan::RAD_TAN_PARAMETER_COUNT;
use nalgebra::{DVector, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;

fn lit<T: RealField>(value: f64) -> T {
    nalgebra::convert::<f64, T>(value)
}

/// Pinhole intrinsics plus `[k1, k2, p1, p2, k3]`, laid out as in
/// [`crate::camera::RadTanModel::parameters`].
#[derive(Debug, Clone)]
pub struct LensParams<T: RealField> {
    values: [T; RAD_TAN_PARAMETER_COUNT],
}

impl<T: RealField> LensParams<T> {
    pub fn from_block(block: &DVector<T>, offset: usize) -> Self {
        LensParams {
            values: std::array::from_fn(|i| block[offset + i].clone()),
        }
    }

    pub fn from_f64(values: &[f64; RAD_TAN_PARAMETER_COUNT]) -> Self {
        LensParams {
            values: std::array::from_fn(|i| lit::<T>(values[i])),
        }
    }

    /// Ties `fy` to `fx` for square pixels.
    pub fn with_square_pixels(mut self) -> Self {
        self.values[1] = self.values[0].clone();
        self
    }

    /// Projects a point in camera coordinates through the distortion model.
    pub fn project(&self, point: &Vector3<T>) -> Vector2<T> {
        let [fx, fy, cx, cy, k1, k2, p1, p2, k3] = self.values.clone();
        let two = lit::<T>(2.0);

        let x = point.x.clone() / point.z.clone();
        let y = point.y.clone() / point.z.clone();

        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let r4 = r2.clone() * r2.clone();
        let r6 = r4.clone() * r2.clone();
        let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;
        let xy = x.clone() * y.clone();

        let x_distorted = x.clone() * radial.clone()
            + two.clone() * p1.clone() * xy.clone()
            + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
        let y_distorted = y.clone() * radial
            + p1 * (r2 + two.clone() * y.clone() * y)
            + two * p2 * xy;

        Vector2::new(fx * x_distorted + cx, fy * y_distorted + cy)
    }
}

/// Rigid transform stored as a rotation vector (axis times angle) and a translation.
#[derive(Debug, Clone)]
pub struct AxisAnglePose<T: RealField> {
    rotation: Vector3<T>,
    translation: Vector3<T>,
}

impl<T: RealField> AxisAnglePose<T> {
    pub fn from_block(block: &DVector<T>, offset: usize) -> Self {
        AxisAnglePose {
            rotation: Vector3::new(
                block[offset].clone(),
                block[offset + 1].clone(),
                block[offset + 2].clone(),
            ),
            translation: Vector3::new(
                block[offset + 3].clone(),
                block[offset + 4].clone(),
                block[offset + 5].clone(),
            ),
        }
    }

    /// `R(w) p + t` with Rodrigues' formula; first order around the identity.
    pub fn transform(&self, point: &Vector3<T>) -> Vector3<T> {
        let w = &self.rotation;
        let theta2 = w.dot(w);
        let rotated = if theta2 > lit::<T>(f64::EPSILON) {
            let theta = theta2.sqrt();
            let axis = w.clone() / theta.clone();
            let (sin, cos) = (theta.clone().sin(), theta.cos());
            let along = axis.dot(point) * (T::one() - cos.clone());
            point * cos + axis.cross(point) * sin + axis * along
        } else {
            point + w.cross(point)
        };
        rotated + self.translation.clone()
    }
}

fn target_point<T: RealField>(point: &Vector3<f64>) -> Vector3<T> {
    Vector3::new(lit::<T>(point.x), lit::<T>(point.y), lit::<T>(point.z))
}

/// Observations of one calibration sample: target points (board frame) and pixels.
#[derive(Debug, Clone)]
pub struct SampleObservations {
    pub object: Vec<Vector3<f64>>,
    pub observed: Vec<Vector2<f64>>,
}

impl SampleObservations {
    pub fn residual_count(&self) -> usize {
        self.observed.len() * 2
    }

    fn residuals<T: RealField>(&self, project: impl Fn(&Vector3<T>) -> Vector2<T>) -> DVector<T> {
        let mut residuals = DVector::zeros(self.residual_count());
        for (i, (object, observed)) in self.object.iter().zip(self.observed.iter()).enumerate() {
            let projected = project(&target_point::<T>(object));
            residuals[i * 2] = projected.x.clone() - lit::<T>(observed.x);
            residuals[i * 2 + 1] = projected.y.clone() - lit::<T>(observed.y);
        }
        residuals
    }
}

/// Parameter blocks: `[lens (9), board pose (6)]`.
///
/// With `square_pixels` the lens block's `fy` entry is ignored and `fx` is
/// used for both axes.
#[derive(Debug, Clone)]
pub struct PlanarReprojectionFactor {
    pub sample: SampleObservations,
    pub square_pixels: bool,
}

impl<T: RealField> Factor<T> for PlanarReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut lens = LensParams::from_block(&params[0], 0);
        if self.square_pixels {
            lens = lens.with_square_pixels();
        }
        let board = AxisAnglePose::from_block(&params[1], 0);
        self.sample
            .residuals(|p: &Vector3<T>| lens.project(&board.transform(p)))
    }
}

/// Reprojection into a camera whose lens is held fixed.
///
/// Parameter blocks: `[board pose (6)]` for the reference view, or
/// `[reference-to-camera pose (6), board pose (6)]` when `chained`.
#[derive(Debug, Clone)]
pub struct FixedLensFactor {
    pub lens: [f64; RAD_TAN_PARAMETER_COUNT],
    pub chained: bool,
    pub sample: SampleObservations,
}

impl<T: RealField> Factor<T> for FixedLensFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let lens = LensParams::<T>::from_f64(&self.lens);
        if self.chained {
            let relative = AxisAnglePose::from_block(&params[0], 0);
            let board = AxisAnglePose::from_block(&params[1], 0);
            self.sample.residuals(|p: &Vector3<T>| {
                lens.project(&relative.transform(&board.transform(p)))
            })
        } else {
            let board = AxisAnglePose::from_block(&params[0], 0);
            self.sample
                .residuals(|p: &Vector3<T>| lens.project(&board.transform(p)))
        }
    }
}

/// Parameter blocks: `[camera (9 lens + 6 pose), board pose in the reference frame (6)]`.
#[derive(Debug, Clone)]
pub struct RigReprojectionFactor {
    pub sample: SampleObservations,
}

impl<T: RealField> Factor<T> for RigReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let lens = LensParams::from_block(&params[0], 0);
        let camera_pose = AxisAnglePose::from_block(&params[0], RAD_TAN_PARAMETER_COUNT);
        let board = AxisAnglePose::from_block(&params[1], 0);
        self.sample.residuals(|p: &Vector3<T>| {
            lens.project(&camera_pose.transform(&board.transform(p)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraProfile, RadTanModel, Resolution};
    use crate::geometry::pose_to_params;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Point3};

    fn model() -> RadTanModel {
        let mut model = RadTanModel::new(&DVector::from_vec(vec![
            800.0, 780.0, 320.0, 240.0, -0.1, 0.05, 0.001, -0.0005, 0.01,
        ]))
        .unwrap();
        model.resolution = Resolution {
            width: 640,
            height: 480,
        };
        model
    }

    #[test]
    fn test_lens_params_match_camera_model() {
        let model = model();
        let lens = LensParams::<f64>::from_block(&model.parameters(), 0);
        let point = Vector3::new(-40.0, 25.0, 550.0);
        assert_relative_eq!(
            lens.project(&point),
            model.project_unbounded(&point).unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_axis_angle_pose_matches_isometry() {
        let point = Vector3::new(75.0, 50.0, 0.0);
        for rotation in [
            Vector3::new(0.3, -0.2, 0.1),
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1e-9, 0.0, -1e-9),
        ] {
            let pose = Isometry3::new(Vector3::new(-90.0, -50.0, 600.0), rotation);
            let params = pose_to_params(&pose);
            let transformed = AxisAnglePose::<f64>::from_block(&params, 0).transform(&point);
            let expected = pose.transform_point(&Point3::from(point)).coords;
            assert_relative_eq!(transformed, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rig_factor_is_zero_at_ground_truth() {
        let model = model();
        let board = Isometry3::new(Vector3::new(-80.0, -60.0, 650.0), Vector3::new(0.1, 0.2, 0.0));
        let extrinsics = Isometry3::new(Vector3::new(-60.0, 0.0, 0.0), Vector3::new(0.0, 0.02, 0.0));
        let profile = CameraProfile::new(1, model.clone()).with_extrinsics(
            extrinsics.rotation.to_rotation_matrix().into_inner(),
            extrinsics.translation.vector,
        );

        let object: Vec<Vector3<f64>> = (0..5)
            .map(|i| Vector3::new(i as f64 * 25.0, 10.0 * i as f64, 0.0))
            .collect();
        let observed = object
            .iter()
            .map(|p| {
                let in_ref = board.transform_point(&Point3::from(*p)).coords;
                profile.project(&in_ref).unwrap()
            })
            .collect();
        let factor = RigReprojectionFactor {
            sample: SampleObservations { object, observed },
        };

        let mut camera_block = model.parameters().as_slice().to_vec();
        camera_block.extend(pose_to_params(&extrinsics).iter());
        let residuals = factor.residual_func(&[
            DVector::from_vec(camera_block),
            pose_to_params(&board),
        ]);
        assert_eq!(residuals.len(), 10);
        assert!(residuals.norm() < 1e-8);
    }
}
