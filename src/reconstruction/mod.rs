//! Sparse metric reconstruction from matched features of a calibrated camera pair.

use crate::camera::{CameraModelError, CameraProfile};
use crate::features::{CorrespondenceSet, FeatureSet};
use crate::geometry::{triangulate_dlt, GeometryError};
use log::{debug, info, warn};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReconstructionError {
    #[error("Need at least {required} correspondences, got {found}")]
    InsufficientCorrespondences { found: usize, required: usize },
    #[error("Camera model error: {0}")]
    Model(#[from] CameraModelError),
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
}

/// A triangulated point in the reference camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub position: Vector3<f64>,
    /// Mean of the two per-view reprojection errors, in pixels.
    pub reprojection_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    pub min_correspondences: usize,
    /// Mean reprojection error below which a pass is high quality.
    pub high_quality_px: f64,
    /// Mean reprojection error below which a pass is still usable.
    pub degraded_px: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        TriangulationConfig {
            min_correspondences: 8,
            high_quality_px: 1.0,
            degraded_px: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriangulationQuality {
    HighQuality,
    Degraded,
    Unreliable,
}

impl TriangulationQuality {
    pub fn classify(mean_error: f64, config: &TriangulationConfig) -> Self {
        if mean_error < config.high_quality_px {
            TriangulationQuality::HighQuality
        } else if mean_error < config.degraded_px {
            TriangulationQuality::Degraded
        } else {
            TriangulationQuality::Unreliable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    pub points: Vec<Point3D>,
    pub mean_error: f64,
    pub quality: TriangulationQuality,
    /// Correspondences that could not be triangulated or reprojected.
    #[serde(default)]
    pub rejected: usize,
}

/// Triangulates one observed pixel pair and measures its reprojection error.
///
/// Both pixels are raw (distorted) observations of `first` and `second`.
pub fn triangulate_point(
    first: &CameraProfile,
    second: &CameraProfile,
    pixel_a: &Vector2<f64>,
    pixel_b: &Vector2<f64>,
) -> Result<Point3D, ReconstructionError> {
    let ideal_a = first.model.undistort_pixel(pixel_a)?;
    let ideal_b = second.model.undistort_pixel(pixel_b)?;
    let position = triangulate_dlt(
        &first.projection_matrix(),
        &second.projection_matrix(),
        &ideal_a,
        &ideal_b,
    )?;

    let error_a = (first.project(&position)? - pixel_a).norm();
    let error_b = (second.project(&position)? - pixel_b).norm();
    Ok(Point3D {
        position,
        reprojection_error: 0.5 * (error_a + error_b),
    })
}

/// Triangulates every correspondence between two views of a calibrated pair.
///
/// Points that cannot be triangulated or reprojected (at infinity, behind a
/// camera) are dropped and counted in [`Reconstruction::rejected`]; the
/// quality is classified from the mean error of the remaining points.
pub fn triangulate(
    correspondences: &CorrespondenceSet,
    features_a: &FeatureSet,
    features_b: &FeatureSet,
    first: &CameraProfile,
    second: &CameraProfile,
    config: &TriangulationConfig,
) -> Result<Reconstruction, ReconstructionError> {
    if correspondences.len() < config.min_correspondences {
        return Err(ReconstructionError::InsufficientCorrespondences {
            found: correspondences.len(),
            required: config.min_correspondences,
        });
    }

    let pairs = correspondences.point_pairs(features_a, features_b);
    let mut points = Vec::with_capacity(pairs.len());
    let mut rejected = 0;
    for (a, b) in &pairs {
        match triangulate_point(first, second, a, b) {
            Ok(point) => points.push(point),
            Err(err) => {
                debug!("Rejected correspondence {:?} <-> {:?}: {}", a, b, err);
                rejected += 1;
            }
        }
    }
    if rejected > 0 {
        warn!(
            "{} of {} correspondences between cameras {} and {} could not be triangulated",
            rejected,
            pairs.len(),
            first.camera_id,
            second.camera_id
        );
    }
    if points.len() < config.min_correspondences {
        return Err(ReconstructionError::InsufficientCorrespondences {
            found: points.len(),
            required: config.min_correspondences,
        });
    }

    let mean_error = points.iter().map(|p| p.reprojection_error).sum::<f64>() / points.len() as f64;
    let quality = TriangulationQuality::classify(mean_error, config);
    if quality == TriangulationQuality::Unreliable {
        warn!(
            "Triangulation between cameras {} and {} is unreliable: mean reprojection error {:.3} px",
            first.camera_id, second.camera_id, mean_error
        );
    } else {
        info!(
            "Triangulated {} of {} correspondences, mean reprojection error {:.3} px ({:?})",
            points.len(),
            pairs.len(),
            mean_error,
            quality
        );
    }

    Ok(Reconstruction {
        points,
        mean_error,
        quality,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Correspondence, Keypoint};
    use crate::test_utils::{left_profile, right_profile};
    use approx::assert_relative_eq;

    fn scene() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for i in 0..4 {
            for j in 0..3 {
                points.push(Vector3::new(
                    -90.0 + 60.0 * i as f64,
                    -50.0 + 50.0 * j as f64,
                    700.0 + 40.0 * (i + j) as f64,
                ));
            }
        }
        points
    }

    fn observe(profile: &CameraProfile, points: &[Vector3<f64>], noise: f64) -> FeatureSet {
        let keypoints = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let pixel = profile.project(p).unwrap();
                let jitter = if i % 2 == 0 { noise } else { -noise };
                Keypoint {
                    x: pixel.x as f32,
                    y: (pixel.y + jitter) as f32,
                    size: 4.0,
                    angle: 0.0,
                    response: 1.0,
                    octave: 0,
                }
            })
            .collect();
        FeatureSet {
            keypoints,
            descriptors: vec![vec![0.0; 128]; points.len()],
        }
    }

    fn identity_matches(count: usize) -> CorrespondenceSet {
        CorrespondenceSet {
            matches: (0..count)
                .map(|i| Correspondence {
                    a: i,
                    b: i,
                    distance: 0.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_noiseless_views_recover_points() {
        let (left, right) = (left_profile(), right_profile());
        let points = scene();
        let (fa, fb) = (observe(&left, &points, 0.0), observe(&right, &points, 0.0));

        let result = triangulate(
            &identity_matches(points.len()),
            &fa,
            &fb,
            &left,
            &right,
            &TriangulationConfig::default(),
        )
        .unwrap();

        assert_eq!(result.quality, TriangulationQuality::HighQuality);
        assert_eq!(result.points.len(), points.len());
        assert_eq!(result.rejected, 0);
        for (estimated, truth) in result.points.iter().zip(points.iter()) {
            // Keypoints are stored as f32 pixels.
            assert_relative_eq!(estimated.position, *truth, epsilon = 0.5);
            assert!(estimated.reprojection_error < 0.05);
        }
    }

    /// Raw pixel whose ray passes through `point` although it lies behind the camera.
    fn mirrored_pixel(profile: &CameraProfile, point: &Vector3<f64>) -> Keypoint {
        let in_camera = profile.rotation * point + profile.translation;
        let pixel = profile.model.project_unbounded(&-in_camera).unwrap();
        Keypoint {
            x: pixel.x as f32,
            y: pixel.y as f32,
            size: 4.0,
            angle: 0.0,
            response: 1.0,
            octave: 0,
        }
    }

    #[test]
    fn test_point_behind_cameras_is_rejected_and_counted() {
        let (left, right) = (left_profile(), right_profile());
        let points = scene();
        let (mut fa, mut fb) = (observe(&left, &points, 0.0), observe(&right, &points, 0.0));
        let behind = Vector3::new(20.0, 10.0, -800.0);
        fa.keypoints.push(mirrored_pixel(&left, &behind));
        fa.descriptors.push(vec![0.0; 128]);
        fb.keypoints.push(mirrored_pixel(&right, &behind));
        fb.descriptors.push(vec![0.0; 128]);

        let result = triangulate(
            &identity_matches(points.len() + 1),
            &fa,
            &fb,
            &left,
            &right,
            &TriangulationConfig::default(),
        )
        .unwrap();
        assert_eq!(result.rejected, 1);
        assert_eq!(result.points.len(), points.len());
        assert_eq!(result.quality, TriangulationQuality::HighQuality);
    }

    #[test]
    fn test_noisy_views_are_flagged() {
        let (left, right) = (left_profile(), right_profile());
        let points = scene();
        // Vertical offsets cannot be absorbed along the near-horizontal epipolar lines.
        let (fa, fb) = (observe(&left, &points, 3.0), observe(&right, &points, -3.0));

        let result = triangulate(
            &identity_matches(points.len()),
            &fa,
            &fb,
            &left,
            &right,
            &TriangulationConfig::default(),
        )
        .unwrap();
        assert_eq!(result.quality, TriangulationQuality::Unreliable);
        assert!(result.mean_error >= 2.0);
    }

    #[test]
    fn test_too_few_correspondences() {
        let (left, right) = (left_profile(), right_profile());
        let points = scene();
        let (fa, fb) = (observe(&left, &points, 0.0), observe(&right, &points, 0.0));

        let err = triangulate(
            &identity_matches(5),
            &fa,
            &fb,
            &left,
            &right,
            &TriangulationConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ReconstructionError::InsufficientCorrespondences {
                found: 5,
                required: 8
            }
        );
    }

    #[test]
    fn test_quality_thresholds() {
        let config = TriangulationConfig::default();
        assert_eq!(TriangulationQuality::classify(0.3, &config), TriangulationQuality::HighQuality);
        assert_eq!(TriangulationQuality::classify(1.0, &config), TriangulationQuality::Degraded);
        assert_eq!(TriangulationQuality::classify(2.0, &config), TriangulationQuality::Unreliable);
    }
}
