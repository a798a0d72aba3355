//! Linear two-view triangulation.

use super::GeometryError;
use nalgebra::{Matrix3x4, Matrix4, Vector2, Vector3};

/// Triangulates one point from two ideal (undistorted) pixel observations with
/// the homogeneous DLT.
///
/// Each view contributes the rows `u * P_2 - P_0` and `v * P_2 - P_1`; the
/// solution is the right singular vector of the smallest singular value,
/// de-homogenized by `w`.
pub fn triangulate_dlt(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
) -> Result<Vector3<f64>, GeometryError> {
    let mut a = Matrix4::zeros();
    for (view, (p, x)) in [(p1, x1), (p2, x2)].into_iter().enumerate() {
        a.set_row(2 * view, &(p.row(2) * x.x - p.row(0)));
        a.set_row(2 * view + 1, &(p.row(2) * x.y - p.row(1)));
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let smallest = svd.singular_values.imin();
    let x_h = v_t.row(smallest);

    let w = x_h[3];
    if w.abs() <= f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "triangulated point lies at infinity".to_string(),
        ));
    }
    Ok(Vector3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w))
}
