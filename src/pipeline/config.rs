//! Pipeline configuration, loadable from YAML.

use crate::calibration::{IntrinsicOptions, PlanarTarget, StereoOptions};
use crate::camera::{CameraId, Resolution};
use crate::depth::SgmConfig;
use crate::features::{MatcherConfig, SiftConfig};
use crate::frame::SyncConfig;
use crate::optimization::BundleOptions;
use crate::pipeline::PipelineError;
use crate::reconstruction::TriangulationConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Largest rig the capture side supports.
pub const DEFAULT_MAX_CAMERAS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub camera_count: usize,
    pub max_cameras: usize,
    /// Camera whose frame is the rig frame.
    pub reference_camera: CameraId,
    /// Pair used for dense depth and sparse reconstruction, `(left, right)`.
    pub primary_pair: (CameraId, CameraId),
    pub target: PlanarTarget,
    pub sync: SyncConfig,
    pub intrinsic: IntrinsicOptions,
    pub stereo: StereoOptions,
    pub sgm: SgmConfig,
    pub sift: SiftConfig,
    pub matcher: MatcherConfig,
    pub triangulation: TriangulationConfig,
    pub bundle: BundleOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            width: 640,
            height: 480,
            camera_count: 2,
            max_cameras: DEFAULT_MAX_CAMERAS,
            reference_camera: 0,
            primary_pair: (0, 1),
            target: PlanarTarget::default(),
            sync: SyncConfig::default(),
            intrinsic: IntrinsicOptions::default(),
            stereo: StereoOptions::default(),
            sgm: SgmConfig::default(),
            sift: SiftConfig::default(),
            matcher: MatcherConfig::default(),
            triangulation: TriangulationConfig::default(),
            bundle: BundleOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(width: u32, height: u32, camera_count: usize) -> Self {
        PipelineConfig {
            width,
            height,
            camera_count,
            ..PipelineConfig::default()
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        (0..self.camera_count).collect()
    }

    pub fn has_stereo_pair(&self) -> bool {
        self.camera_count >= 2
    }

    /// Rejects configurations no pipeline pass could run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.camera_count < 1 || self.camera_count > self.max_cameras {
            return Err(PipelineError::InvalidCameraCount {
                count: self.camera_count,
                max: self.max_cameras,
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.reference_camera >= self.camera_count {
            return Err(PipelineError::InvalidConfig(format!(
                "reference camera {} is out of range",
                self.reference_camera
            )));
        }
        if self.has_stereo_pair() {
            let (left, right) = self.primary_pair;
            if left == right || left >= self.camera_count || right >= self.camera_count {
                return Err(PipelineError::InvalidConfig(format!(
                    "primary pair ({}, {}) must be two distinct cameras of the rig",
                    left, right
                )));
            }
        }
        if self.target.columns < 2 || self.target.rows < 2 || self.target.spacing <= 0.0 {
            return Err(PipelineError::InvalidConfig(
                "calibration target needs at least 2x2 corners and a positive spacing".to_string(),
            ));
        }
        if self.sync.tolerance_seconds < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "sync tolerance must not be negative".to_string(),
            ));
        }
        self.sgm
            .validate()
            .map_err(|err| PipelineError::InvalidConfig(err.to_string()))?;
        if self.sift.octave_layers < 1 || self.sift.descriptor_width < 1 || self.sift.descriptor_bins < 1 {
            return Err(PipelineError::InvalidConfig(
                "feature detector layers and descriptor dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads a configuration; missing fields take their defaults.
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), PipelineError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}
