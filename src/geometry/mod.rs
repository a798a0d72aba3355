//! Multi-view geometry primitives shared by calibration and reconstruction.

use nalgebra::{DVector, Isometry3, Matrix3, Vector2, Vector3};

pub mod epipolar;
pub mod homography;
pub mod triangulation;

pub use epipolar::{epipolar_distance, essential_from_extrinsics, fundamental_from_essential};
pub use homography::{dlt_homography, planar_pose_from_homography};
pub use triangulation::triangulate_dlt;

/// Number of scalars in a pose block: rotation vector followed by translation.
pub const POSE_PARAMETER_COUNT: usize = 6;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Need at least {needed} points, got {found}")]
    NotEnoughPoints { needed: usize, found: usize },
    #[error("Mismatched input lengths: {0} vs {1}")]
    LengthMismatch(usize, usize),
    #[error("Degenerate configuration: {0}")]
    Degenerate(String),
    #[error("SVD did not produce the requested factors")]
    SvdFailed,
}

/// Cross-product matrix `[v]x` such that `[v]x * w = v x w`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Flattens a pose into `[rx, ry, rz, tx, ty, tz]` with an axis-angle rotation.
pub fn pose_to_params(pose: &Isometry3<f64>) -> DVector<f64> {
    let axis_angle = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    DVector::from_vec(vec![
        axis_angle.x,
        axis_angle.y,
        axis_angle.z,
        t.x,
        t.y,
        t.z,
    ])
}

/// Inverse of [`pose_to_params`], reading six values starting at `offset`.
pub fn pose_from_params(params: &[f64], offset: usize) -> Isometry3<f64> {
    let axis_angle = Vector3::new(params[offset], params[offset + 1], params[offset + 2]);
    let translation = Vector3::new(params[offset + 3], params[offset + 4], params[offset + 5]);
    Isometry3::new(translation, axis_angle)
}

/// Projects an arbitrary 3x3 matrix onto SO(3) (closest rotation in Frobenius norm).
pub fn orthonormalize(m: &Matrix3<f64>) -> Result<Matrix3<f64>, GeometryError> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Ok(r)
}

/// Chordal L2 mean of a set of poses: the rotations are summed and projected back
/// onto SO(3), the translations averaged.
pub fn mean_pose(poses: &[Isometry3<f64>]) -> Result<Isometry3<f64>, GeometryError> {
    if poses.is_empty() {
        return Err(GeometryError::NotEnoughPoints {
            needed: 1,
            found: 0,
        });
    }
    let mut rotation_sum = Matrix3::zeros();
    let mut translation_sum = Vector3::zeros();
    for pose in poses {
        rotation_sum += pose.rotation.to_rotation_matrix().into_inner();
        translation_sum += pose.translation.vector;
    }
    let rotation = orthonormalize(&rotation_sum)?;
    let axis_angle = nalgebra::Rotation3::from_matrix_unchecked(rotation).scaled_axis();
    Ok(Isometry3::new(
        translation_sum / poses.len() as f64,
        axis_angle,
    ))
}

/// Hartley normalization: zero centroid and mean distance `sqrt(2)`.
///
/// Returns the normalized points and the similarity `T` with `x_n = T x`.
pub fn normalize_points_2d(
    points: &[Vector2<f64>],
) -> Result<(Vec<Vector2<f64>>, Matrix3<f64>), GeometryError> {
    if points.is_empty() {
        return Err(GeometryError::NotEnoughPoints {
            needed: 1,
            found: 0,
        });
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_distance <= f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "all points coincide".to_string(),
        ));
    }
    let scale = std::f64::consts::SQRT_2 / mean_distance;
    let transform = Matrix3::new(
        scale, 0.0, -scale * centroid.x, //
        0.0, scale, -scale * centroid.y, //
        0.0, 0.0, 1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Ok((normalized, transform))
}
