//! Plane-induced homographies and the planar pose they encode.

use super::{normalize_points_2d, orthonormalize, GeometryError};
use nalgebra::{DMatrix, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector2};

/// Estimates `H` with `x_image ~ H x_plane` using the normalized DLT.
///
/// Both point sets are Hartley-normalized, `A h = 0` is solved by SVD and the
/// result is de-normalized and scaled so that `H[2,2] == 1` when possible.
pub fn dlt_homography(
    plane: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    if plane.len() != image.len() {
        return Err(GeometryError::LengthMismatch(plane.len(), image.len()));
    }
    let n = plane.len();
    if n < 4 {
        return Err(GeometryError::NotEnoughPoints {
            needed: 4,
            found: n,
        });
    }

    let (plane_n, t_plane) = normalize_points_2d(plane)?;
    let (image_n, t_image) = normalize_points_2d(image)?;

    // Pad to at least 9 rows so the full V is available from the SVD.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (p, q)) in plane_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or(GeometryError::SvdFailed)?;
    let h = v_t.row(smallest);

    let h_normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("normalization is singular".to_string()))?;
    let mut h_mat = t_image_inv * h_normalized * t_plane;

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    Ok(h_mat)
}

/// Decomposes a plane-to-image homography into the pose of the plane (`Z = 0`)
/// in the camera frame, given the intrinsic matrix.
///
/// The rotation is projected onto SO(3) and the sign is chosen so that the
/// plane lies in front of the camera.
pub fn planar_pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Result<Isometry3<f64>, GeometryError> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("intrinsic matrix is singular".to_string()))?;

    let k_inv_h1 = k_inv * h.column(0);
    let k_inv_h2 = k_inv * h.column(1);
    let k_inv_h3 = k_inv * h.column(2);

    let norm = 0.5 * (k_inv_h1.norm() + k_inv_h2.norm());
    if norm <= f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "homography has vanishing columns".to_string(),
        ));
    }
    let mut lambda = 1.0 / norm;
    if k_inv_h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = k_inv_h1 * lambda;
    let r2 = k_inv_h2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]))?;
    let translation = k_inv_h3 * lambda;

    Ok(Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};

    fn k() -> Matrix3<f64> {
        Matrix3::new(800.0, 0.0, 640.0, 0.0, 780.0, 360.0, 0.0, 0.0, 1.0)
    }

    fn board() -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..9 {
                points.push(Vector2::new(j as f64 * 25.0, i as f64 * 25.0));
            }
        }
        points
    }

    fn project(k: &Matrix3<f64>, pose: &Isometry3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
        let pc = pose.transform_point(&Point3::new(p.x, p.y, 0.0));
        let uvw = k * pc.coords;
        Vector2::new(uvw.x / uvw.z, uvw.y / uvw.z)
    }

    #[test]
    fn test_dlt_homography_maps_points() {
        let pose = Isometry3::new(Vector3::new(-90.0, -50.0, 600.0), Vector3::new(0.2, -0.1, 0.05));
        let plane = board();
        let image: Vec<_> = plane.iter().map(|p| project(&k(), &pose, p)).collect();

        let h = dlt_homography(&plane, &image).unwrap();
        for (p, q) in plane.iter().zip(image.iter()) {
            let mapped = h * p.push(1.0);
            assert_relative_eq!(
                Vector2::new(mapped.x / mapped.z, mapped.y / mapped.z),
                *q,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_planar_pose_from_homography() {
        let pose = Isometry3::new(Vector3::new(-80.0, -40.0, 700.0), Vector3::new(-0.25, 0.3, 0.1));
        let plane = board();
        let image: Vec<_> = plane.iter().map(|p| project(&k(), &pose, p)).collect();

        let h = dlt_homography(&plane, &image).unwrap();
        let recovered = planar_pose_from_homography(&k(), &h).unwrap();
        assert_relative_eq!(
            recovered.to_homogeneous(),
            pose.to_homogeneous(),
            epsilon = 1e-6,
            max_relative = 1e-6
        );
    }

    #[test]
    fn test_dlt_homography_needs_four_points() {
        let plane = board()[..3].to_vec();
        let image = plane.clone();
        assert!(matches!(
            dlt_homography(&plane, &image),
            Err(GeometryError::NotEnoughPoints { needed: 4, found: 3 })
        ));
    }
}
