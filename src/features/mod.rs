//! Sparse features: scale-invariant keypoints with 128-dimensional
//! descriptors, and the brute-force matcher that pairs them across views.

use serde::{Deserialize, Serialize};

pub mod matcher;
pub mod sift;

pub use matcher::{match_features, Correspondence, CorrespondenceSet, MatcherConfig};
pub use sift::{detect_and_compute, SiftConfig};

/// A detected keypoint in full-resolution image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighbourhood, in pixels.
    pub size: f32,
    /// Dominant gradient direction in radians, measured with image y pointing down.
    pub angle: f32,
    /// Absolute DoG contrast at the refined extremum.
    pub response: f32,
    pub octave: usize,
}

/// Keypoints and their descriptors, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Vec<f32>>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}
