//! Essential and fundamental matrices of a calibrated pair.

use super::{skew, GeometryError};
use nalgebra::{Matrix3, Vector2, Vector3};

/// `E = [t]x R` for the convention `X2 = R X1 + t`.
pub fn essential_from_extrinsics(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}

/// `F = K2^-T E K1^-1`, normalized to unit Frobenius norm.
pub fn fundamental_from_essential(
    essential: &Matrix3<f64>,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
) -> Result<Matrix3<f64>, GeometryError> {
    let k1_inv = k1
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("K1 is singular".to_string()))?;
    let k2_inv = k2
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("K2 is singular".to_string()))?;
    let f = k2_inv.transpose() * essential * k1_inv;
    let norm = f.norm();
    if norm <= f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "zero baseline gives a vanishing fundamental matrix".to_string(),
        ));
    }
    Ok(f / norm)
}

/// Distance in pixels of `x2` from the epipolar line `F x1`.
pub fn epipolar_distance(fundamental: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let line = fundamental * x1.push(1.0);
    let denom = (line.x * line.x + line.y * line.y).sqrt();
    if denom <= f64::EPSILON {
        return f64::INFINITY;
    }
    (x2.push(1.0).dot(&line)).abs() / denom
}
