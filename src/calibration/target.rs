//! Planar calibration target and the samples observed of it.

use crate::calibration::CalibrationError;
use crate::camera::{CameraId, RadTanModel};
use nalgebra::{Isometry3, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Chessboard-like target with `columns x rows` internal corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanarTarget {
    pub columns: usize,
    pub rows: usize,
    /// Corner spacing; sets the unit of every reconstructed length (millimetres by default).
    pub spacing: f64,
}

impl Default for PlanarTarget {
    fn default() -> Self {
        PlanarTarget {
            columns: 9,
            rows: 6,
            spacing: 25.0,
        }
    }
}

impl PlanarTarget {
    pub fn point_count(&self) -> usize {
        self.columns * self.rows
    }

    /// Corners on the `Z = 0` plane, row by row: `(j * spacing, i * spacing, 0)`.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        (0..self.rows)
            .flat_map(|i| {
                (0..self.columns)
                    .map(move |j| Vector3::new(j as f64 * self.spacing, i as f64 * self.spacing, 0.0))
            })
            .collect()
    }

    pub fn plane_points(&self) -> Vec<Vector2<f64>> {
        self.object_points()
            .iter()
            .map(|p| Vector2::new(p.x, p.y))
            .collect()
    }

    /// Center of the corner grid, in the target frame.
    pub fn center(&self) -> Vector3<f64> {
        Vector3::new(
            (self.columns.saturating_sub(1)) as f64 * self.spacing / 2.0,
            (self.rows.saturating_sub(1)) as f64 * self.spacing / 2.0,
            0.0,
        )
    }

    /// Renders the corners seen by `model` with the target at `pose` (target to camera).
    ///
    /// Returns `None` if any corner falls behind the camera or outside the image.
    pub fn observe(&self, model: &RadTanModel, pose: &Isometry3<f64>) -> Option<CalibrationSample> {
        let points = self
            .object_points()
            .iter()
            .map(|p| {
                let in_camera = pose.transform_point(&Point3::from(*p)).coords;
                model
                    .project_unbounded(&in_camera)
                    .ok()
                    .filter(|pixel| model.resolution.contains(pixel))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(CalibrationSample::new(points))
    }
}

/// Observed target corners of one calibration image, in target order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub points: Vec<Vector2<f64>>,
}

impl CalibrationSample {
    pub fn new(points: Vec<Vector2<f64>>) -> Self {
        CalibrationSample { points }
    }
}

/// Calibration samples accumulated per camera.
///
/// Sample `k` of every camera is assumed to show the same physical target pose,
/// which is how stereo calibration and bundle adjustment pair the views.
#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    samples: Vec<Vec<CalibrationSample>>,
}

impl SampleStore {
    pub fn new(camera_count: usize) -> Self {
        SampleStore {
            samples: vec![Vec::new(); camera_count],
        }
    }

    /// Appends a sample after checking it against the target layout.
    pub fn add(
        &mut self,
        camera_id: CameraId,
        sample: CalibrationSample,
        target: &PlanarTarget,
    ) -> Result<usize, CalibrationError> {
        let camera_count = self.samples.len();
        let store = self
            .samples
            .get_mut(camera_id)
            .ok_or(CalibrationError::UnknownCamera {
                camera_id,
                camera_count,
            })?;
        if sample.points.len() != target.point_count() {
            return Err(CalibrationError::SampleSizeMismatch {
                sample: store.len(),
                found: sample.points.len(),
                expected: target.point_count(),
            });
        }
        store.push(sample);
        Ok(store.len())
    }

    pub fn camera(&self, camera_id: CameraId) -> &[CalibrationSample] {
        self.samples.get(camera_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn counts(&self) -> Vec<usize> {
        self.samples.iter().map(Vec::len).collect()
    }

    pub fn clear(&mut self) {
        self.samples.iter_mut().for_each(Vec::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};

    #[test]
    fn test_object_points_layout() {
        let target = PlanarTarget::default();
        let points = target.object_points();
        assert_eq!(points.len(), 54);
        assert_eq!(points[0], Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector3::new(25.0, 0.0, 0.0));
        assert_eq!(points[9], Vector3::new(0.0, 25.0, 0.0));
        assert_eq!(points[53], Vector3::new(200.0, 125.0, 0.0));
        assert_eq!(target.center(), Vector3::new(100.0, 62.5, 0.0));
    }

    #[test]
    fn test_observe_rejects_target_outside_image() {
        let target = PlanarTarget::default();
        let model = RadTanModel::from_intrinsics(
            Intrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
        );
        let visible = Isometry3::translation(-100.0, -62.5, 600.0);
        assert_eq!(target.observe(&model, &visible).unwrap().points.len(), 54);

        let outside = Isometry3::translation(400.0, -62.5, 600.0);
        assert!(target.observe(&model, &outside).is_none());
    }

    #[test]
    fn test_sample_store_checks_layout_and_camera() {
        let target = PlanarTarget::default();
        let mut store = SampleStore::new(2);
        let sample = CalibrationSample::new(target.plane_points());

        assert_eq!(store.add(1, sample.clone(), &target).unwrap(), 1);
        assert!(matches!(
            store.add(1, CalibrationSample::new(vec![Vector2::zeros(); 3]), &target),
            Err(CalibrationError::SampleSizeMismatch { found: 3, expected: 54, .. })
        ));
        assert_eq!(
            store.add(5, sample, &target),
            Err(CalibrationError::UnknownCamera {
                camera_id: 5,
                camera_count: 2
            })
        );
        assert_eq!(store.counts(), vec![0, 1]);
        assert!(store.camera(7).is_empty());

        store.clear();
        assert_eq!(store.counts(), vec![0, 0]);
    }
}
