//! Reprojection statistics and result export helpers.

use crate::reconstruction::Point3D;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

/// Creates the `output` directory used by the demo and the tests if it doesn't exist.
pub fn ensure_output_dir() -> Result<(), UtilError> {
    let output_dir = Path::new("output");
    if !output_dir.exists() {
        fs::create_dir_all(output_dir)?;
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("CSV Error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
}

/// Summary of per-point reprojection errors, in pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub count: usize,
}

impl ProjectionError {
    /// Statistics over per-point error magnitudes.
    pub fn from_errors(errors: &[f64]) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroProjectionPoints);
        }
        let n = errors.len() as f64;
        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = errors.iter().sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let median = if sorted.len() % 2 == 0 {
            0.5 * (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2])
        } else {
            sorted[sorted.len() / 2]
        };

        Ok(ProjectionError {
            rmse,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev: variance.sqrt(),
            median,
            count: errors.len(),
        })
    }

    /// Statistics over a stacked residual vector `[du0, dv0, du1, dv1, ...]`.
    pub fn from_residuals(residuals: &DVector<f64>) -> Result<Self, UtilError> {
        let errors: Vec<f64> = residuals
            .as_slice()
            .chunks_exact(2)
            .map(|r| (r[0] * r[0] + r[1] * r[1]).sqrt())
            .collect();
        Self::from_errors(&errors)
    }
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RMSE: {:.6} px, Mean: {:.6} px, Median: {:.6} px, Min: {:.6} px, Max: {:.6} px, StdDev: {:.6} px ({} points)",
            self.rmse, self.mean, self.median, self.min, self.max, self.stddev, self.count
        )
    }
}

#[derive(Serialize)]
struct PointRecord {
    x: f64,
    y: f64,
    z: f64,
    reprojection_error: f64,
}

/// Writes triangulated points as `x,y,z,reprojection_error` rows.
pub fn export_points_csv<P: AsRef<Path>>(points: &[Point3D], path: P) -> Result<(), UtilError> {
    let mut writer = csv::Writer::from_path(path)?;
    for point in points {
        writer.serialize(PointRecord {
            x: point.position.x,
            y: point.position.y,
            z: point.position.z,
            reprojection_error: point.reprojection_error,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes any serializable report as pretty-printed JSON.
pub fn export_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<(), UtilError> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.count, 4);

        assert!(matches!(
            ProjectionError::from_errors(&[]),
            Err(UtilError::ZeroProjectionPoints)
        ));
    }

    #[test]
    fn test_projection_error_from_residuals() {
        let residuals = DVector::from_vec(vec![3.0, 4.0, 0.0, 0.0, 0.6, 0.8]);
        let stats = ProjectionError::from_residuals(&residuals).unwrap();
        assert_eq!(stats.count, 3);
        assert_relative_eq!(stats.max, 5.0);
        assert_relative_eq!(stats.median, 1.0);
    }

    #[test]
    fn test_export_points_csv_and_json() {
        ensure_output_dir().unwrap();
        let points = vec![
            Point3D {
                position: Vector3::new(1.0, 2.0, 3.0),
                reprojection_error: 0.25,
            },
            Point3D {
                position: Vector3::new(-4.0, 5.5, 600.0),
                reprojection_error: 0.5,
            },
        ];

        let csv_path = "output/util_points_test.csv";
        export_points_csv(&points, csv_path).unwrap();
        let contents = fs::read_to_string(csv_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "x,y,z,reprojection_error");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("-4.0,5.5,600.0"));
        fs::remove_file(csv_path).unwrap();

        let json_path = "output/util_points_test.json";
        export_json(&points, json_path).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        fs::remove_file(json_path).unwrap();
    }
}
