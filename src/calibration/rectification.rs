//! Bouguet stereo rectification and the per-camera remap tables it induces.

use crate::calibration::{CalibrationError, StereoCalibration};
use crate::camera::{CameraId, CameraProfile, PinholeModel, RadTanModel, Resolution};
use crate::frame::GrayImageF32;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Rotation3, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// Lookup table from rectified pixels to source pixels of the raw (distorted) image.
///
/// Entries whose source ray points behind the camera hold `-1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationMap {
    pub width: u32,
    pub height: u32,
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

impl RectificationMap {
    /// Composes undistortion and the rectifying rotation into one table.
    ///
    /// `rotation` takes camera coordinates to the rectified frame and
    /// `new_k` is the shared intrinsic matrix of the rectified views.
    pub fn build(model: &RadTanModel, rotation: &Matrix3<f64>, new_k: &Matrix3<f64>) -> Result<Self, CalibrationError> {
        let new_k_inv = new_k
            .try_inverse()
            .ok_or_else(|| CalibrationError::Numerical("rectified intrinsics are singular".to_string()))?;
        let back = rotation.transpose() * new_k_inv;
        let Resolution { width, height } = model.resolution;

        let size = width as usize * height as usize;
        let mut map_x = Vec::with_capacity(size);
        let mut map_y = Vec::with_capacity(size);
        for v in 0..height {
            for u in 0..width {
                let ray = back * Vector3::new(u as f64, v as f64, 1.0);
                if ray.z <= f64::EPSILON {
                    map_x.push(-1.0);
                    map_y.push(-1.0);
                    continue;
                }
                let distorted = model.distort(&Vector2::new(ray.x / ray.z, ray.y / ray.z));
                let pixel = model.intrinsics.to_pixel(&distorted);
                map_x.push(pixel.x as f32);
                map_y.push(pixel.y as f32);
            }
        }
        Ok(RectificationMap {
            width,
            height,
            map_x,
            map_y,
        })
    }

    /// Source coordinate of rectified pixel `(u, v)`.
    pub fn source(&self, u: u32, v: u32) -> Option<(f32, f32)> {
        if u >= self.width || v >= self.height {
            return None;
        }
        let index = v as usize * self.width as usize + u as usize;
        Some((*self.map_x.get(index)?, *self.map_y.get(index)?))
    }

    /// Resamples `image` through the table with bilinear interpolation.
    /// Rectified pixels whose source falls outside `image` (or outside a
    /// truncated table) are set to zero; an empty `image` gives all zeros.
    pub fn remap(&self, image: &GrayImageF32) -> GrayImageF32 {
        GrayImageF32::from_fn(self.width, self.height, |u, v| {
            let value = self
                .source(u, v)
                .and_then(|(x, y)| bilinear(image, x, y))
                .unwrap_or(0.0);
            image::Luma([value])
        })
    }
}

fn bilinear(image: &GrayImageF32, x: f32, y: f32) -> Option<f32> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let (ax, ay) = (x - x0 as f32, y - y0 as f32);

    let p = |xx: u32, yy: u32| image.get_pixel(xx, yy)[0];
    let top = p(x0, y0) * (1.0 - ax) + p(x1, y0) * ax;
    let bottom = p(x0, y1) * (1.0 - ax) + p(x1, y1) * ax;
    Some(top * (1.0 - ay) + bottom * ay)
}

/// Row-aligned geometry of a calibrated pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoRectification {
    pub left_id: CameraId,
    pub right_id: CameraId,
    /// Left camera frame to rectified frame.
    pub r1: Matrix3<f64>,
    /// Right camera frame to rectified frame.
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    /// `P2[0][3] = f * Tx` with `Tx` the rectified baseline (negative for a right camera).
    pub p2: Matrix3x4<f64>,
    /// Maps `(x, y, disparity, 1)` to homogeneous 3D in the rectified left frame.
    pub q: Matrix4<f64>,
    pub left_map: RectificationMap,
    pub right_map: RectificationMap,
}

impl StereoRectification {
    /// Bouguet's construction: each camera gets half of the relative rotation,
    /// then both are turned so the baseline lies on the x-axis.
    ///
    /// The rectified views share one focal length (mean of the four input
    /// focal lengths) and one principal point (mean of the two).
    pub fn compute(
        left: &CameraProfile,
        right: &CameraProfile,
        stereo: &StereoCalibration,
    ) -> Result<Self, CalibrationError> {
        Self::from_relative_pose(left, right, &stereo.rotation, &stereo.translation)
    }

    /// Rectification of two profiles placed in the same rig frame.
    pub fn from_profiles(left: &CameraProfile, right: &CameraProfile) -> Result<Self, CalibrationError> {
        let relative = right.extrinsics() * left.extrinsics().inverse();
        Self::from_relative_pose(
            left,
            right,
            &relative.rotation.to_rotation_matrix().into_inner(),
            &relative.translation.vector,
        )
    }

    /// `rotation` and `translation` map left-camera to right-camera coordinates.
    pub fn from_relative_pose(
        left: &CameraProfile,
        right: &CameraProfile,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<Self, CalibrationError> {
        let relative = Rotation3::from_matrix(rotation);
        let half = Rotation3::new(-relative.scaled_axis() * 0.5);
        let t = half * translation;
        if t.norm() <= f64::EPSILON {
            return Err(CalibrationError::CalibrationDegenerate(
                "zero baseline cannot be rectified".to_string(),
            ));
        }

        let target_axis = Vector3::new(if t.x > 0.0 { 1.0 } else { -1.0 }, 0.0, 0.0);
        let mut axis = t.cross(&target_axis);
        let axis_norm = axis.norm();
        if axis_norm > 0.0 {
            axis *= (t.x.abs() / t.norm()).clamp(-1.0, 1.0).acos() / axis_norm;
        }
        let align = Rotation3::new(axis);

        let r1 = (align * half.transpose()).into_inner();
        let r2 = (align * half).into_inner();
        let tx = (align * t).x;

        let l = &left.model.intrinsics;
        let r = &right.model.intrinsics;
        let f = (l.fx + l.fy + r.fx + r.fy) / 4.0;
        let cx = (l.cx + r.cx) / 2.0;
        let cy = (l.cy + r.cy) / 2.0;
        let new_k = Matrix3::new(f, 0.0, cx, 0.0, f, cy, 0.0, 0.0, 1.0);

        let mut p1 = Matrix3x4::zeros();
        p1.fixed_view_mut::<3, 3>(0, 0).copy_from(&new_k);
        let mut p2 = p1;
        p2[(0, 3)] = f * tx;

        let q = Matrix4::new(
            1.0, 0.0, 0.0, -cx, //
            0.0, 1.0, 0.0, -cy, //
            0.0, 0.0, 0.0, f, //
            0.0, 0.0, -1.0 / tx, 0.0,
        );

        Ok(StereoRectification {
            left_id: left.camera_id,
            right_id: right.camera_id,
            r1,
            r2,
            p1,
            p2,
            q,
            left_map: RectificationMap::build(&left.model, &r1, &new_k)?,
            right_map: RectificationMap::build(&right.model, &r2, &new_k)?,
        })
    }

    pub fn focal_length(&self) -> f64 {
        self.p1[(0, 0)]
    }

    /// Length of the rectified baseline.
    pub fn baseline(&self) -> f64 {
        (self.p2[(0, 3)] / self.p1[(0, 0)]).abs()
    }

    pub fn rectify_pair(&self, left: &GrayImageF32, right: &GrayImageF32) -> (GrayImageF32, GrayImageF32) {
        (self.left_map.remap(left), self.right_map.remap(right))
    }

    /// Rectified coordinates of a raw pixel observed by `camera_id`.
    pub fn rectify_point(
        &self,
        camera_id: CameraId,
        model: &RadTanModel,
        pixel: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CalibrationError> {
        let rotation = if camera_id == self.left_id {
            &self.r1
        } else if camera_id == self.right_id {
            &self.r2
        } else {
            return Err(CalibrationError::NotCalibrated(camera_id));
        };
        let normalized = model.undistort(&model.intrinsics.to_normalized(pixel))?;
        let ray = rotation * Vector3::new(normalized.x, normalized.y, 1.0);
        Ok(self.rectified_camera()?.project_unbounded(&ray)?)
    }

    /// The shared virtual pinhole camera of both rectified views.
    pub fn rectified_camera(&self) -> Result<PinholeModel, CalibrationError> {
        let resolution = Resolution {
            width: self.left_map.width,
            height: self.left_map.height,
        };
        Ok(PinholeModel::from_projection(&self.p1, resolution)?)
    }

    /// Metric point in the rectified left frame for a rectified pixel and its disparity.
    pub fn reproject(&self, x: f64, y: f64, disparity: f64) -> Option<Vector3<f64>> {
        let h = self.q * Vector4::new(x, y, disparity, 1.0);
        if h.w.abs() <= f64::EPSILON {
            return None;
        }
        Some(Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w))
    }
}
