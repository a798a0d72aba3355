//! Dense depth from a rectified stereo pair.

use crate::calibration::StereoRectification;
use crate::frame::GrayImageF32;
use log::info;
use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

pub mod filter;
pub mod sgm;

pub use filter::{bilateral_filter, filter_speckles, BilateralConfig};
pub use sgm::{compute_disparity, AggregationPaths, SgmConfig};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DepthError {
    #[error("Invalid depth configuration: {0}")]
    InvalidConfig(String),
    #[error("Image sizes differ: left {left:?}, right {right:?}")]
    SizeMismatch { left: (u32, u32), right: (u32, u32) },
}

/// Row-major per-pixel disparity of the rectified left view; NaN marks invalid pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisparityMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// Row-major metric depth aligned with the rectified left view; NaN marks invalid pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

macro_rules! dense_map_accessors {
    ($map:ty) => {
        impl $map {
            pub fn get(&self, x: u32, y: u32) -> Option<f32> {
                if x >= self.width || y >= self.height {
                    return None;
                }
                let value = self.data[(y * self.width + x) as usize];
                (!value.is_nan()).then_some(value)
            }

            pub fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
                self.data.iter().copied().filter(|v| !v.is_nan())
            }

            pub fn valid_count(&self) -> usize {
                self.valid_values().count()
            }

            /// Share of valid pixels, the quality metric of the map.
            pub fn valid_fraction(&self) -> f64 {
                if self.data.is_empty() {
                    0.0
                } else {
                    self.valid_count() as f64 / self.data.len() as f64
                }
            }
        }
    };
}

dense_map_accessors!(DisparityMap);
dense_map_accessors!(DepthMap);

impl DepthMap {
    /// Depth `Z` of `Q (x, y, d, 1)`. Non-positive disparities and points
    /// behind the camera are invalid.
    pub fn from_disparity(disparity: &DisparityMap, q: &Matrix4<f64>) -> Self {
        let width = disparity.width as usize;
        let data = disparity
            .data
            .iter()
            .enumerate()
            .map(|(index, &d)| {
                if d.is_nan() || d <= 0.0 {
                    return f32::NAN;
                }
                let (x, y) = ((index % width) as f64, (index / width) as f64);
                let h = q * Vector4::new(x, y, d as f64, 1.0);
                let z = h.z / h.w;
                if z.is_finite() && z > 0.0 {
                    z as f32
                } else {
                    f32::NAN
                }
            })
            .collect();
        DepthMap {
            width: disparity.width,
            height: disparity.height,
            data,
        }
    }
}

/// Output of the dense depth stage for one frame pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseDepth {
    pub disparity: DisparityMap,
    pub depth: DepthMap,
    /// Valid-pixel fraction of the depth map.
    pub quality: f64,
}

/// Disparity, depth and smoothing for an already rectified pair.
pub fn compute_depth(
    left: &GrayImageF32,
    right: &GrayImageF32,
    rectification: &StereoRectification,
    config: &SgmConfig,
) -> Result<DenseDepth, DepthError> {
    let disparity = compute_disparity(left, right, config)?;
    let mut depth = DepthMap::from_disparity(&disparity, &rectification.q);
    if config.bilateral.enabled {
        depth = bilateral_filter(&depth, &config.bilateral);
    }
    let quality = depth.valid_fraction();
    info!(
        "Dense depth for cameras ({}, {}): {:.1}% valid pixels",
        rectification.left_id,
        rectification.right_id,
        quality * 100.0
    );
    Ok(DenseDepth {
        disparity,
        depth,
        quality,
    })
}
