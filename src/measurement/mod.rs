//! Depth statistics with a 95% uncertainty band.

use crate::depth::DepthMap;
use crate::reconstruction::Point3D;
use serde::{Deserialize, Serialize};

/// Two-sided 95% quantile of the normal distribution.
const Z_95: f64 = 1.96;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthStatistics {
    pub mean: f64,
    pub stddev: f64,
    pub lower_95: f64,
    pub upper_95: f64,
    pub count: usize,
}

impl DepthStatistics {
    /// Population statistics of `values`; `None` when there are none.
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let stddev = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        Some(DepthStatistics {
            mean,
            stddev,
            lower_95: mean - Z_95 * stddev,
            upper_95: mean + Z_95 * stddev,
            count: values.len(),
        })
    }
}

/// Uncertainty summary of one frame pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementReport {
    /// Over the valid pixels of the dense depth map.
    pub dense: Option<DepthStatistics>,
    /// Over the depth (`z`) of the triangulated points.
    pub sparse: Option<DepthStatistics>,
}

impl MeasurementReport {
    pub fn summarize(depth: Option<&DepthMap>, points: &[Point3D]) -> Self {
        MeasurementReport {
            dense: depth.and_then(|map| DepthStatistics::from_values(map.valid_values().map(f64::from))),
            sparse: DepthStatistics::from_values(points.iter().map(|p| p.position.z)),
        }
    }
}
