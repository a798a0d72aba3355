//! The [`Pipeline`] ties every stage together: frame ingestion, calibration,
//! refinement and the per-frame-set reconstruction pass.
//!
//! Calibration state is published as an immutable snapshot behind an
//! `RwLock<Arc<_>>`. A frame pass clones the `Arc` once and works on that
//! snapshot, so a concurrent re-calibration never changes the state under it.

use crate::calibration::{
    calibrate_intrinsics, calibrate_stereo, CalibrationError, CalibrationSample, SampleStore,
    StereoRectification,
};
use crate::camera::{CalibrationFile, CameraId, CameraProfile};
use crate::depth::compute_depth;
use crate::features::{detect_and_compute, match_features};
use crate::frame::{
    to_intensity, DecodeError, FrameDecoder, FrameError, FrameSyncBuffer, GrayImageF32, ImageDecoder,
    SynchronizedFrameSet,
};
use crate::measurement::MeasurementReport;
use crate::optimization::bundle::{BundleAdjustment, BundleCamera};
use crate::reconstruction::{triangulate, ReconstructionError, TriangulationQuality};
use log::{debug, info, warn};
use nalgebra::Vector2;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod config;
pub mod report;

pub use config::PipelineConfig;
pub use report::{
    CalibrationReport, FrameResult, IntrinsicSummary, OptimizationReport, Stage, StageIssue,
};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Camera count {count} is outside 1..={max}")]
    InvalidCameraCount { count: usize, max: usize },
    #[error("Camera {camera_id} is not part of a {camera_count}-camera rig")]
    UnknownCamera {
        camera_id: CameraId,
        camera_count: usize,
    },
    #[error("Pipeline has been shut down")]
    ShutDown,
    #[error("Camera {camera_id}: {source}")]
    DecodeFailure {
        camera_id: CameraId,
        source: DecodeError,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
}

impl From<FrameError> for PipelineError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::UnknownCamera {
                camera_id,
                camera_count,
            } => PipelineError::UnknownCamera {
                camera_id,
                camera_count,
            },
            FrameError::Decode { camera_id, source } => {
                PipelineError::DecodeFailure { camera_id, source }
            }
        }
    }
}

/// Published calibration of the rig.
#[derive(Debug, Clone, Default)]
pub struct CalibrationState {
    pub profiles: BTreeMap<CameraId, CameraProfile>,
    /// Cameras whose extrinsics are known (the reference camera included).
    pub posed: BTreeSet<CameraId>,
    /// Rectification of the primary pair.
    pub rectification: Option<StereoRectification>,
    /// Increases with every published state.
    pub generation: u64,
}

impl CalibrationState {
    pub fn profile(&self, camera_id: CameraId) -> Option<&CameraProfile> {
        self.profiles.get(&camera_id)
    }

    /// Intrinsics and extrinsics of the camera are both known.
    pub fn is_posed(&self, camera_id: CameraId) -> bool {
        self.posed.contains(&camera_id) && self.profiles.contains_key(&camera_id)
    }

    fn posed_pair(&self, (left, right): (CameraId, CameraId)) -> Option<(&CameraProfile, &CameraProfile)> {
        if self.is_posed(left) && self.is_posed(right) {
            Some((self.profiles.get(&left)?, self.profiles.get(&right)?))
        } else {
            None
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    buffer: FrameSyncBuffer,
    samples: Mutex<SampleStore>,
    calibration: RwLock<Arc<CalibrationState>>,
    shut_down: AtomicBool,
}

impl Pipeline {
    /// A pipeline with default settings for a rig of `camera_count` cameras.
    pub fn initialize(width: u32, height: u32, camera_count: usize) -> Result<Self, PipelineError> {
        Self::with_config(PipelineConfig::new(width, height, camera_count))
    }

    pub fn with_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_decoder(config, Arc::new(ImageDecoder))
    }

    pub fn with_decoder(config: PipelineConfig, decoder: Arc<dyn FrameDecoder>) -> Result<Self, PipelineError> {
        config.validate()?;
        info!(
            "Pipeline initialized: {} cameras at {}x{}, reference {}, primary pair {:?}",
            config.camera_count, config.width, config.height, config.reference_camera, config.primary_pair
        );
        Ok(Pipeline {
            buffer: FrameSyncBuffer::new(config.camera_count, decoder, config.sync),
            samples: Mutex::new(SampleStore::new(config.camera_count)),
            calibration: RwLock::new(Arc::new(CalibrationState::default())),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(PipelineError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn check_camera(&self, camera_id: CameraId) -> Result<(), PipelineError> {
        if camera_id >= self.config.camera_count {
            return Err(PipelineError::UnknownCamera {
                camera_id,
                camera_count: self.config.camera_count,
            });
        }
        Ok(())
    }

    /// Current calibration; stays valid even if a new one is published meanwhile.
    pub fn calibration_snapshot(&self) -> Arc<CalibrationState> {
        Arc::clone(&self.calibration.read())
    }

    fn publish(&self, mut state: CalibrationState) {
        let mut current = self.calibration.write();
        state.generation = current.generation + 1;
        *current = Arc::new(state);
    }

    /// Publishes `state` only if the published calibration is still at
    /// `generation`. Returns whether it was published.
    fn publish_if_unchanged(&self, generation: u64, mut state: CalibrationState) -> bool {
        let mut current = self.calibration.write();
        if current.generation != generation {
            return false;
        }
        state.generation = generation + 1;
        *current = Arc::new(state);
        true
    }

    /// Rectification of the primary pair, when both cameras are posed.
    fn primary_rectification(
        &self,
        profiles: &BTreeMap<CameraId, CameraProfile>,
        posed: &BTreeSet<CameraId>,
    ) -> Option<Result<StereoRectification, CalibrationError>> {
        if !self.config.has_stereo_pair() {
            return None;
        }
        let (left, right) = self.config.primary_pair;
        let pair = match (profiles.get(&left), profiles.get(&right)) {
            (Some(l), Some(r)) if posed.contains(&left) && posed.contains(&right) => (l, r),
            (Some(_), _) if posed.contains(&left) => {
                return Some(Err(CalibrationError::NotCalibrated(right)))
            }
            _ => return Some(Err(CalibrationError::NotCalibrated(left))),
        };
        Some(StereoRectification::from_profiles(pair.0, pair.1))
    }

    /// Hands one encoded frame to the synchronization buffer.
    ///
    /// A decode failure is returned and also recorded for the next frame set.
    pub fn submit_frame(&self, camera_id: CameraId, bytes: &[u8], timestamp: f64) -> Result<(), PipelineError> {
        self.ensure_running()?;
        self.buffer.submit(camera_id, bytes, timestamp)?;
        Ok(())
    }

    /// Records the observed target corners of one calibration image.
    ///
    /// Returns the number of samples now held for the camera.
    pub fn add_calibration_sample(
        &self,
        camera_id: CameraId,
        observed_points: Vec<Vector2<f64>>,
    ) -> Result<usize, PipelineError> {
        self.ensure_running()?;
        self.check_camera(camera_id)?;
        let count = self.samples.lock().add(
            camera_id,
            CalibrationSample::new(observed_points),
            &self.config.target,
        )?;
        debug!("Camera {}: calibration sample {} added", camera_id, count);
        Ok(count)
    }

    pub fn sample_counts(&self) -> Vec<usize> {
        self.samples.lock().counts()
    }

    pub fn clear_calibration_samples(&self) {
        self.samples.lock().clear();
    }

    /// Calibrates every camera's intrinsics, then every camera's pose relative
    /// to the reference camera, and publishes the result.
    ///
    /// Per-camera failures are recorded in the report. The previous
    /// calibration stays published when no camera could be calibrated.
    pub fn run_calibration(&self) -> Result<CalibrationReport, PipelineError> {
        self.ensure_running()?;
        let samples = self.samples.lock().clone();
        let config = &self.config;
        let reference = config.reference_camera;
        let mut report = CalibrationReport::default();

        let mut profiles = BTreeMap::new();
        for camera_id in config.camera_ids() {
            let result = calibrate_intrinsics(
                camera_id,
                samples.camera(camera_id),
                &config.target,
                config.resolution(),
                &config.intrinsic,
            );
            match result {
                Ok(calibration) => {
                    report.intrinsics.insert(
                        camera_id,
                        Ok(IntrinsicSummary {
                            profile: calibration.profile.clone(),
                            error: calibration.error,
                            suspect: calibration.suspect,
                        }),
                    );
                    profiles.insert(camera_id, calibration.profile);
                }
                Err(err) => {
                    warn!("Camera {} intrinsic calibration failed: {}", camera_id, err);
                    report.intrinsics.insert(camera_id, Err(err));
                }
            }
        }

        let mut posed = BTreeSet::new();
        if profiles.contains_key(&reference) {
            posed.insert(reference);
        }
        let reference_profile = profiles.get(&reference).cloned();
        for camera_id in config.camera_ids().into_iter().filter(|&id| id != reference) {
            let Some(profile) = profiles.get_mut(&camera_id) else {
                continue;
            };
            let Some(reference_profile) = &reference_profile else {
                report
                    .extrinsics
                    .insert(camera_id, Err(CalibrationError::NotCalibrated(reference)));
                continue;
            };
            let result = calibrate_stereo(
                reference_profile,
                profile,
                &config.target,
                samples.camera(reference),
                samples.camera(camera_id),
                &config.stereo,
            );
            match &result {
                Ok(stereo) => {
                    profile.rotation = stereo.rotation;
                    profile.translation = stereo.translation;
                    posed.insert(camera_id);
                }
                Err(err) => warn!("Camera {} extrinsic calibration failed: {}", camera_id, err),
            }
            report.extrinsics.insert(camera_id, result);
        }

        let rectification = self.primary_rectification(&profiles, &posed);
        report.rectification = rectification.as_ref().map(|result| match result {
            Ok(rect) => Ok((rect.left_id, rect.right_id)),
            Err(err) => Err(err.clone()),
        });

        if profiles.is_empty() {
            warn!("No camera could be calibrated; keeping the published calibration");
            return Ok(report);
        }
        self.publish(CalibrationState {
            profiles,
            posed,
            rectification: rectification.and_then(Result::ok),
            generation: 0,
        });
        report.published = true;
        info!(
            "Calibration published for cameras {:?}",
            report.calibrated_cameras()
        );
        Ok(report)
    }

    /// Jointly refines the published calibration and publishes the result.
    ///
    /// The result is published only if no other calibration was published
    /// while the optimization ran; otherwise the report has `published: false`
    /// and the newer calibration stays in place.
    pub fn run_bundle_adjustment(&self) -> Result<OptimizationReport, PipelineError> {
        self.ensure_running()?;
        let state = self.calibration_snapshot();
        let samples = self.samples.lock().clone();
        let cameras = state
            .profiles
            .values()
            .map(|profile| BundleCamera {
                profile: profile.clone(),
                extrinsics_known: state.posed.contains(&profile.camera_id),
            })
            .collect();

        let mut bundle = BundleAdjustment::new(
            cameras,
            self.config.reference_camera,
            &self.config.target,
            &samples,
            self.config.bundle,
        )?;
        let result = bundle.run(false)?;

        let profiles: BTreeMap<CameraId, CameraProfile> = result
            .profiles
            .iter()
            .map(|profile| (profile.camera_id, profile.clone()))
            .collect();
        let (refined, rectification_rebuilt) = self.refined_state(&state, profiles);
        let published = self.publish_if_unchanged(state.generation, refined);
        if !published {
            warn!(
                "Calibration changed during bundle adjustment (generation {}); refined result not published",
                state.generation
            );
        }
        Ok(OptimizationReport {
            initial_rms: result.initial_rms,
            final_rms: result.final_rms,
            optimized: result.optimized,
            fixed: result.fixed,
            rectification_rebuilt,
            published,
        })
    }

    /// Successor of `previous` holding `profiles`, with the primary pair's
    /// rectification rebuilt. A failed rebuild keeps the previous rectification.
    fn refined_state(
        &self,
        previous: &CalibrationState,
        profiles: BTreeMap<CameraId, CameraProfile>,
    ) -> (CalibrationState, bool) {
        let rebuilt = self
            .primary_rectification(&profiles, &previous.posed)
            .and_then(|r| {
                r.map_err(|err| warn!("Rectification not rebuilt, keeping the previous one: {}", err))
                    .ok()
            });
        let rectification_rebuilt = rebuilt.is_some();
        let state = CalibrationState {
            profiles,
            posed: previous.posed.clone(),
            rectification: rebuilt.or_else(|| previous.rectification.clone()),
            generation: previous.generation,
        };
        (state, rectification_rebuilt)
    }

    /// Publishes externally provided profiles, all taken as fully calibrated.
    pub fn install_calibration(&self, profiles: Vec<CameraProfile>) -> Result<(), PipelineError> {
        self.ensure_running()?;
        let mut installed = BTreeMap::new();
        for profile in profiles {
            self.check_camera(profile.camera_id)?;
            profile.validate().map_err(CalibrationError::from)?;
            installed.insert(profile.camera_id, profile);
        }
        let posed: BTreeSet<CameraId> = installed.keys().copied().collect();
        let rectification = self
            .primary_rectification(&installed, &posed)
            .and_then(|r| r.map_err(|err| debug!("No rectification installed: {}", err)).ok());
        info!("Installed calibration for cameras {:?}", posed);
        self.publish(CalibrationState {
            profiles: installed,
            posed,
            rectification,
            generation: 0,
        });
        Ok(())
    }

    /// Writes the posed cameras of the published calibration as YAML.
    pub fn save_calibration<P: AsRef<Path>>(&self, path: P) -> Result<(), PipelineError> {
        let state = self.calibration_snapshot();
        let file = CalibrationFile {
            cameras: state
                .profiles
                .values()
                .filter(|profile| state.posed.contains(&profile.camera_id))
                .cloned()
                .collect(),
        };
        fs::write(path, serde_yaml::to_string(&file)?)?;
        Ok(())
    }

    pub fn load_calibration<P: AsRef<Path>>(&self, path: P) -> Result<(), PipelineError> {
        let contents = fs::read_to_string(path)?;
        let file: CalibrationFile = serde_yaml::from_str(&contents)?;
        self.install_calibration(file.cameras)
    }

    /// Waits up to the configured timeout for every camera, then processes
    /// whatever arrived.
    pub fn process_frame_set(&self) -> Result<FrameResult, PipelineError> {
        self.ensure_running()?;
        let set = self
            .buffer
            .wait_for_cameras(&self.config.camera_ids(), self.config.sync.wait_timeout());
        self.process(set)
    }

    /// Runs the reconstruction stages on an already drained frame set.
    pub fn process(&self, set: SynchronizedFrameSet) -> Result<FrameResult, PipelineError> {
        self.ensure_running()?;
        let state = self.calibration_snapshot();
        let mut result = FrameResult {
            cameras: set.camera_ids(),
            timestamp: set
                .frames
                .values()
                .map(|frame| frame.timestamp)
                .min_by(|a, b| a.total_cmp(b)),
            ..FrameResult::default()
        };

        for (camera_id, err) in &set.decode_failures {
            result.issues.push(StageIssue::DecodeFailure {
                camera_id: *camera_id,
                reason: err.to_string(),
            });
        }
        if let Some(spread) = set.sync_warning() {
            result.issues.push(StageIssue::SynchronizationWarning {
                spread_seconds: spread,
                tolerance_seconds: set.tolerance_seconds,
            });
        }

        let intensities: BTreeMap<CameraId, GrayImageF32> = set
            .frames
            .iter()
            .map(|(id, frame)| (*id, to_intensity(&frame.image)))
            .collect();
        let (left_id, right_id) = self.config.primary_pair;
        let pair = match (intensities.get(&left_id), intensities.get(&right_id)) {
            (Some(left), Some(right)) if self.config.has_stereo_pair() => Some((left, right)),
            _ => None,
        };

        self.dense_stage(&state, pair, &mut result);

        for (camera_id, image) in &intensities {
            result
                .features
                .insert(*camera_id, detect_and_compute(image, &self.config.sift));
        }
        self.sparse_stage(&state, &mut result);

        result.measurement = MeasurementReport::summarize(
            result.depth.as_ref().map(|d| &d.depth),
            result
                .reconstruction
                .as_ref()
                .map(|r| r.points.as_slice())
                .unwrap_or(&[]),
        );
        info!(
            "Processed frame set of cameras {:?}: {} issue(s)",
            result.cameras,
            result.issues.len()
        );
        Ok(result)
    }

    fn missing_pair_reason(&self) -> String {
        if self.config.has_stereo_pair() {
            "primary pair frames are not both present".to_string()
        } else {
            "rig has a single camera".to_string()
        }
    }

    fn dense_stage(
        &self,
        state: &CalibrationState,
        pair: Option<(&GrayImageF32, &GrayImageF32)>,
        result: &mut FrameResult,
    ) {
        let skip = |reason: String| StageIssue::StageSkipped {
            stage: Stage::DenseDepth,
            reason,
        };
        let Some((left, right)) = pair else {
            result.issues.push(skip(self.missing_pair_reason()));
            return;
        };
        let Some(rectification) = &state.rectification else {
            result
                .issues
                .push(skip("primary pair is not calibrated".to_string()));
            return;
        };
        let (left, right) = rectification.rectify_pair(left, right);
        match compute_depth(&left, &right, rectification, &self.config.sgm) {
            Ok(depth) => result.depth = Some(depth),
            Err(err) => {
                warn!("Dense depth failed: {}", err);
                result.issues.push(skip(err.to_string()));
            }
        }
    }

    fn sparse_stage(&self, state: &CalibrationState, result: &mut FrameResult) {
        let (left_id, right_id) = self.config.primary_pair;
        let skip = |stage: Stage, reason: String| StageIssue::StageSkipped { stage, reason };
        let (Some(features_a), Some(features_b)) = (
            result.features.get(&left_id),
            result.features.get(&right_id),
        ) else {
            result
                .issues
                .push(skip(Stage::Triangulation, self.missing_pair_reason()));
            return;
        };
        if !self.config.has_stereo_pair() {
            result
                .issues
                .push(skip(Stage::Triangulation, self.missing_pair_reason()));
            return;
        }

        let correspondences = match_features(features_a, features_b, &self.config.matcher);
        let outcome = match state.posed_pair((left_id, right_id)) {
            None => Err(skip(
                Stage::Triangulation,
                "primary pair is not calibrated".to_string(),
            )),
            Some((first, second)) => triangulate(
                &correspondences,
                features_a,
                features_b,
                first,
                second,
                &self.config.triangulation,
            )
            .map_err(|err| match err {
                ReconstructionError::InsufficientCorrespondences { found, required } => {
                    StageIssue::InsufficientCorrespondences { found, required }
                }
                other => skip(Stage::Triangulation, other.to_string()),
            }),
        };

        match outcome {
            Ok(reconstruction) => {
                if reconstruction.rejected > 0 {
                    result.issues.push(StageIssue::RejectedCorrespondences {
                        count: reconstruction.rejected,
                    });
                }
                if reconstruction.quality == TriangulationQuality::Unreliable {
                    result.issues.push(StageIssue::UnreliableTriangulation {
                        mean_error: reconstruction.mean_error,
                    });
                }
                result.reconstruction = Some(reconstruction);
            }
            Err(issue) => {
                debug!("Sparse reconstruction: {}", issue);
                result.issues.push(issue);
            }
        }
        result.correspondences = Some(correspondences);
    }

    /// Releases samples, buffered frames and calibration. Every later call
    /// fails with [`PipelineError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.buffer.clear();
        self.samples.lock().clear();
        *self.calibration.write() = Arc::new(CalibrationState::default());
        info!("Pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::PlanarTarget;
    use crate::camera::{Intrinsics, RadTanModel, Resolution};
    use crate::frame::TimedFrame;
    use crate::test_utils::{encode_png, left_profile, observe_rig, right_profile, textured_image};
    use approx::assert_relative_eq;
    use image::{DynamicImage, GrayImage, Luma};
    use nalgebra::Vector3;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn calibrated_pipeline() -> Pipeline {
        init_logger();
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        pipeline
            .install_calibration(vec![left_profile(), right_profile()])
            .unwrap();
        pipeline
    }

    fn feed_rig_samples(pipeline: &Pipeline, left_count: usize, right_count: usize) {
        let (left, right) = observe_rig(&PlanarTarget::default());
        for sample in left.into_iter().take(left_count) {
            pipeline.add_calibration_sample(0, sample.points).unwrap();
        }
        for sample in right.into_iter().take(right_count) {
            pipeline.add_calibration_sample(1, sample.points).unwrap();
        }
    }

    /// Distortion-free pair with identical intrinsics and a pure 60 mm baseline,
    /// so that rectification leaves the images untouched.
    fn aligned_rig(width: u32, height: u32) -> Vec<CameraProfile> {
        let model = RadTanModel::from_intrinsics(
            Intrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: width as f64 / 2.0,
                cy: height as f64 / 2.0,
            },
            Resolution { width, height },
        );
        vec![
            CameraProfile::new(0, model.clone()),
            CameraProfile::new(1, model)
                .with_extrinsics(nalgebra::Matrix3::identity(), Vector3::new(-60.0, 0.0, 0.0)),
        ]
    }

    fn frame(image: GrayImage, timestamp: f64) -> TimedFrame {
        TimedFrame {
            image: DynamicImage::ImageLuma8(image),
            timestamp,
        }
    }

    #[test]
    fn test_calibration_recovers_rig() {
        init_logger();
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        feed_rig_samples(&pipeline, 15, 15);
        assert_eq!(pipeline.sample_counts(), vec![15, 15]);

        let report = pipeline.run_calibration().unwrap();
        assert!(report.is_complete());
        assert!(report.published);
        assert_eq!(report.calibrated_cameras(), vec![0, 1]);

        let state = pipeline.calibration_snapshot();
        assert_eq!(state.generation, 1);
        let left = state.profile(0).unwrap();
        assert_relative_eq!(left.model.intrinsics.fx, 800.0, max_relative = 1e-3);
        assert_relative_eq!(left.model.intrinsics.fy, 790.0, max_relative = 1e-3);
        assert!(left.rms_error.unwrap() < 1e-3);
        let right = state.profile(1).unwrap();
        assert_relative_eq!(right.model.intrinsics.fx, 805.0, max_relative = 1e-3);
        assert_relative_eq!(right.translation, right_profile().translation, epsilon = 0.05);
        assert!(state.rectification.is_some());
    }

    #[test]
    fn test_one_camera_short_of_samples() {
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        feed_rig_samples(&pipeline, 15, 6);

        let report = pipeline.run_calibration().unwrap();
        assert!(report.intrinsics[&0].is_ok());
        assert_eq!(
            report.intrinsics[&1],
            Err(CalibrationError::InsufficientSamples {
                camera_id: 1,
                found: 6,
                required: 10
            })
        );
        assert!(!report.is_complete());
        assert_eq!(report.rectification, Some(Err(CalibrationError::NotCalibrated(1))));

        // The sibling still calibrated and was published.
        let state = pipeline.calibration_snapshot();
        assert!(state.is_posed(0));
        assert!(!state.is_posed(1));
        assert!(state.rectification.is_none());
    }

    #[test]
    fn test_bundle_adjustment_after_calibration() {
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        feed_rig_samples(&pipeline, 15, 15);
        pipeline.run_calibration().unwrap();

        let report = pipeline.run_bundle_adjustment().unwrap();
        assert_eq!(report.optimized, vec![0, 1]);
        assert!(report.fixed.is_empty());
        assert!(report.final_rms <= report.initial_rms + 1e-9);
        assert!(report.final_rms < 1e-3);
        assert!(report.rectification_rebuilt);
        assert!(report.published);
        let state = pipeline.calibration_snapshot();
        assert_eq!(state.generation, 2);
        assert!(state.profiles[&1].rms_error.unwrap() < 1e-3);
    }

    #[test]
    fn test_bundle_adjustment_does_not_overwrite_newer_calibration() {
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        feed_rig_samples(&pipeline, 15, 15);
        pipeline.run_calibration().unwrap();
        let started_from = pipeline.calibration_snapshot();
        let (refined, _) = pipeline.refined_state(&started_from, started_from.profiles.clone());

        // Another caller publishes while the optimization is running.
        pipeline
            .install_calibration(vec![left_profile(), right_profile()])
            .unwrap();
        assert!(!pipeline.publish_if_unchanged(started_from.generation, refined));

        let current = pipeline.calibration_snapshot();
        assert_eq!(current.generation, started_from.generation + 1);
        assert_eq!(current.profiles[&0], left_profile());
        assert_eq!(current.profiles[&1], right_profile());
    }

    #[test]
    fn test_concurrent_publications_are_never_lost() {
        init_logger();
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        feed_rig_samples(&pipeline, 15, 15);
        pipeline.run_calibration().unwrap();

        let (report, installs) = std::thread::scope(|scope| {
            let adjustment = scope.spawn(|| pipeline.run_bundle_adjustment().unwrap());
            let mut installs = 0u64;
            while !adjustment.is_finished() {
                pipeline
                    .install_calibration(vec![left_profile(), right_profile()])
                    .unwrap();
                installs += 1;
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            (adjustment.join().unwrap(), installs)
        });

        let state = pipeline.calibration_snapshot();
        assert_eq!(state.generation, 1 + installs + report.published as u64);
        if !report.published {
            assert_eq!(state.profiles[&0], left_profile());
        }
    }

    #[test]
    fn test_failed_rectification_rebuild_keeps_previous() {
        let pipeline = calibrated_pipeline();
        let previous = pipeline.calibration_snapshot();
        assert!(previous.rectification.is_some());

        let mut profiles = previous.profiles.clone();
        let mut collapsed = right_profile();
        collapsed.set_extrinsics(&nalgebra::Isometry3::identity());
        profiles.insert(1, collapsed);

        let (state, rebuilt) = pipeline.refined_state(&previous, profiles);
        assert!(!rebuilt);
        assert_eq!(state.rectification, previous.rectification);
        assert_eq!(state.posed, previous.posed);
    }

    #[test]
    fn test_bundle_adjustment_requires_reference() {
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        assert!(matches!(
            pipeline.run_bundle_adjustment(),
            Err(PipelineError::Calibration(CalibrationError::NotCalibrated(0)))
        ));
    }

    #[test]
    fn test_invalid_calls_fail() {
        assert!(matches!(
            Pipeline::initialize(640, 480, 0),
            Err(PipelineError::InvalidCameraCount { .. })
        ));
        let pipeline = Pipeline::initialize(640, 480, 2).unwrap();
        assert!(matches!(
            pipeline.add_calibration_sample(2, vec![]),
            Err(PipelineError::UnknownCamera { camera_id: 2, .. })
        ));
        assert!(matches!(
            pipeline.add_calibration_sample(0, vec![Vector2::new(1.0, 2.0)]),
            Err(PipelineError::Calibration(CalibrationError::SampleSizeMismatch { .. }))
        ));
        assert!(matches!(
            pipeline.submit_frame(5, &[1, 2, 3], 0.0),
            Err(PipelineError::UnknownCamera { camera_id: 5, .. })
        ));
        assert!(matches!(
            pipeline.submit_frame(0, &[1, 2, 3], 0.0),
            Err(PipelineError::DecodeFailure { camera_id: 0, .. })
        ));
    }

    #[test]
    fn test_shutdown_rejects_later_calls() {
        let pipeline = calibrated_pipeline();
        let png = encode_png(&textured_image(32, 24, 0.0, 3));
        pipeline.submit_frame(0, &png, 0.0).unwrap();
        pipeline.shutdown();

        assert!(pipeline.calibration_snapshot().profiles.is_empty());
        assert!(matches!(pipeline.submit_frame(0, &png, 0.1), Err(PipelineError::ShutDown)));
        assert!(matches!(pipeline.run_calibration(), Err(PipelineError::ShutDown)));
        assert!(matches!(pipeline.process_frame_set(), Err(PipelineError::ShutDown)));
        pipeline.shutdown();
    }

    #[test]
    fn test_decode_failure_of_one_of_three_cameras() {
        let pipeline = Pipeline::initialize(96, 72, 3).unwrap();
        let png = encode_png(&textured_image(96, 72, 0.0, 4));
        pipeline.submit_frame(0, &png, 10.000).unwrap();
        pipeline.submit_frame(1, &png, 10.004).unwrap();
        assert!(pipeline.submit_frame(2, b"not an image", 10.002).is_err());

        let result = pipeline.process_frame_set().unwrap();
        assert_eq!(result.cameras, vec![0, 1]);
        assert!(result.has_issue(|issue| matches!(issue, StageIssue::DecodeFailure { camera_id: 2, .. })));
        assert!(!result.has_issue(|issue| matches!(issue, StageIssue::SynchronizationWarning { .. })));
        assert_eq!(result.features.len(), 2);
        assert_eq!(result.timestamp, Some(10.0));
    }

    #[test]
    fn test_sync_warning_is_reported_not_fatal() {
        let pipeline = Pipeline::initialize(64, 48, 2).unwrap();
        let png = encode_png(&textured_image(64, 48, 0.0, 5));
        pipeline.submit_frame(0, &png, 1.000).unwrap();
        pipeline.submit_frame(1, &png, 1.050).unwrap();

        let result = pipeline.process_frame_set().unwrap();
        assert_eq!(result.cameras, vec![0, 1]);
        assert!(result.has_issue(|issue| matches!(issue, StageIssue::SynchronizationWarning { .. })));
    }

    #[test]
    fn test_uncalibrated_pass_skips_geometry() {
        let pipeline = Pipeline::initialize(64, 48, 2).unwrap();
        let mut set = SynchronizedFrameSet {
            tolerance_seconds: 1.0 / 60.0,
            ..Default::default()
        };
        set.frames.insert(0, frame(textured_image(64, 48, 0.0, 6), 0.0));
        set.frames.insert(1, frame(textured_image(64, 48, 3.0, 6), 0.0));

        let result = pipeline.process(set).unwrap();
        assert!(result.depth.is_none());
        assert!(result.reconstruction.is_none());
        assert!(result.correspondences.is_some());
        assert!(result.has_issue(|issue| matches!(
            issue,
            StageIssue::StageSkipped {
                stage: Stage::DenseDepth,
                ..
            }
        )));
        assert!(result.has_issue(|issue| matches!(
            issue,
            StageIssue::StageSkipped {
                stage: Stage::Triangulation,
                ..
            }
        )));
    }

    #[test]
    fn test_single_camera_rig_detects_features_only() {
        let pipeline = Pipeline::initialize(64, 48, 1).unwrap();
        let mut set = SynchronizedFrameSet::default();
        set.frames.insert(0, frame(textured_image(64, 48, 0.0, 8), 0.0));

        let result = pipeline.process(set).unwrap();
        assert_eq!(result.features.len(), 1);
        assert!(result.depth.is_none());
        assert!(result.correspondences.is_none());
        let skipped: Vec<Stage> = result
            .issues
            .iter()
            .filter_map(|issue| match issue {
                StageIssue::StageSkipped { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec![Stage::DenseDepth, Stage::Triangulation]);
    }

    #[test]
    fn test_few_correspondences_still_give_depth() {
        let (width, height) = (96, 72);
        let mut config = PipelineConfig::new(width, height, 2);
        config.sgm.num_disparities = 16;
        config.sgm.block_size = 5;
        let pipeline = Pipeline::with_config(config).unwrap();
        pipeline.install_calibration(aligned_rig(width, height)).unwrap();

        let mut set = SynchronizedFrameSet {
            tolerance_seconds: 1.0 / 60.0,
            ..Default::default()
        };
        let flat = GrayImage::from_pixel(width, height, Luma([128]));
        set.frames.insert(0, frame(flat.clone(), 0.0));
        set.frames.insert(1, frame(flat, 0.0));

        let result = pipeline.process(set).unwrap();
        assert!(result.has_issue(|issue| matches!(
            issue,
            StageIssue::InsufficientCorrespondences { required: 8, .. }
        )));
        assert!(result.reconstruction.is_none());
        let depth = result.depth.expect("dense depth runs on every calibrated pair");
        assert_eq!((depth.depth.width, depth.depth.height), (width, height));
        assert!(result.measurement.sparse.is_none());
    }

    fn median(mut values: Vec<f64>) -> f64 {
        values.sort_by(|a, b| a.total_cmp(b));
        values[values.len() / 2]
    }

    #[test]
    fn test_textured_pair_gives_metric_depth() {
        init_logger();
        let (width, height) = (160, 120);
        let mut config = PipelineConfig::new(width, height, 2);
        config.sgm.num_disparities = 16;
        config.sgm.block_size = 5;
        config.sgm.speckle_window_size = 20;
        let pipeline = Pipeline::with_config(config).unwrap();
        pipeline.install_calibration(aligned_rig(width, height)).unwrap();

        let png_left = encode_png(&textured_image(width, height, 0.0, 11));
        let png_right = encode_png(&textured_image(width, height, 8.0, 11));
        pipeline.submit_frame(0, &png_left, 2.0).unwrap();
        pipeline.submit_frame(1, &png_right, 2.001).unwrap();

        let result = pipeline.process_frame_set().unwrap();
        let depth = result.depth.as_ref().unwrap();
        assert!(depth.quality > 0.5, "valid fraction {}", depth.quality);
        // 800 px focal length, 60 mm baseline, 8 px disparity.
        let dense_median = median(depth.depth.valid_values().map(f64::from).collect());
        assert_relative_eq!(dense_median, 6000.0, max_relative = 0.05);
        let dense = result.measurement.dense.as_ref().unwrap();
        assert_eq!(dense.count, depth.depth.valid_count());
        assert!(dense.lower_95 <= dense.mean && dense.mean <= dense.upper_95);

        let reconstruction = result.reconstruction.as_ref().unwrap();
        assert!(reconstruction.points.len() >= 8);
        let sparse_median = median(reconstruction.points.iter().map(|p| p.position.z).collect());
        assert_relative_eq!(sparse_median, 6000.0, max_relative = 0.1);
        assert!(result.measurement.sparse.is_some());
    }

    #[test]
    fn test_calibration_file_round_trip() {
        std::fs::create_dir_all("output").expect("Failed to create output directory for test.");
        let path = "output/pipeline_calibration.yaml";
        let pipeline = calibrated_pipeline();
        pipeline.save_calibration(path).unwrap();

        let restored = Pipeline::initialize(640, 480, 2).unwrap();
        restored.load_calibration(path).unwrap();
        let state = restored.calibration_snapshot();
        assert!(state.is_posed(0) && state.is_posed(1));
        assert_relative_eq!(
            state.profile(1).unwrap().translation,
            right_profile().translation,
            epsilon = 1e-9
        );
        assert!(state.rectification.is_some());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_pipeline_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Pipeline>();

        let pipeline = Arc::new(Pipeline::initialize(32, 24, 3).unwrap());
        let png = encode_png(&textured_image(32, 24, 0.0, 9));
        let handles: Vec<_> = (0..3)
            .map(|camera_id| {
                let pipeline = Arc::clone(&pipeline);
                let png = png.clone();
                std::thread::spawn(move || pipeline.submit_frame(camera_id, &png, 0.5).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let result = pipeline.process_frame_set().unwrap();
        assert_eq!(result.cameras, vec![0, 1, 2]);
    }

    #[test]
    fn test_snapshot_survives_republish() {
        let pipeline = calibrated_pipeline();
        let before = pipeline.calibration_snapshot();
        pipeline.install_calibration(vec![left_profile()]).unwrap();
        let after = pipeline.calibration_snapshot();
        assert_eq!(before.profiles.len(), 2);
        assert_eq!(after.profiles.len(), 1);
        assert!(after.generation > before.generation);
        assert!(matches!(
            pipeline.install_calibration(vec![CameraProfile::new(3, left_profile().model)]),
            Err(PipelineError::UnknownCamera { camera_id: 3, .. })
        ));
    }
}
