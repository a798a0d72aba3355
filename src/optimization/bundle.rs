//! Joint refinement of every camera, extrinsic and target pose of the rig.
//!
//! The stacked parameter vector holds 15 values per optimized camera
//! (`[fx, fy, cx, cy, k1, k2, p1, p2, k3, rx, ry, rz, tx, ty, tz]`, the pose
//! being reference-to-camera) followed by 6 values per target pose
//! (target-to-reference). [`BundleLayout`] maps each camera and board to its
//! slice of that vector and to the named blocks of the solver problem.

use crate::calibration::{CalibrationError, CalibrationSample, PlanarTarget, SampleStore};
use crate::camera::rad_tan::RAD_TAN_PARAMETER_COUNT;
use crate::camera::{CameraId, CameraModel, CameraProfile, RadTanModel};
use crate::geometry::{pose_from_params, pose_to_params, POSE_PARAMETER_COUNT};
use crate::optimization::factors::{RigReprojectionFactor, SampleObservations};
use crate::optimization::stereo::sample_pose;
use crate::optimization::{Optimizer, SolverOptions};
use crate::util::ProjectionError;
use log::{debug, info, warn};
use nalgebra::{DVector, Isometry3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Scalars per camera block: lens followed by the reference-to-camera pose.
pub const CAMERA_BLOCK_SIZE: usize = RAD_TAN_PARAMETER_COUNT + POSE_PARAMETER_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleOptions {
    pub max_iterations: usize,
    pub relative_tolerance: f64,
    /// Cameras with fewer samples are held fixed.
    pub min_samples: usize,
}

impl Default for BundleOptions {
    fn default() -> Self {
        BundleOptions {
            max_iterations: 100,
            relative_tolerance: 1e-6,
            min_samples: 10,
        }
    }
}

impl BundleOptions {
    fn solver(&self) -> SolverOptions {
        SolverOptions {
            max_iterations: self.max_iterations,
            relative_tolerance: self.relative_tolerance,
            ..SolverOptions::default()
        }
    }
}

/// Why a camera was excluded from refinement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedReason {
    TooFewSamples { found: usize, required: usize },
    UnknownExtrinsics,
    NoObservedBoard,
}

impl fmt::Display for FixedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixedReason::TooFewSamples { found, required } => {
                write!(f, "{} samples, at least {} required", found, required)
            }
            FixedReason::UnknownExtrinsics => write!(f, "extrinsics are not calibrated"),
            FixedReason::NoObservedBoard => write!(f, "no observed target pose"),
        }
    }
}

/// A camera entering bundle adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleCamera {
    pub profile: CameraProfile,
    /// Whether `profile` carries calibrated extrinsics (always true for the reference).
    pub extrinsics_known: bool,
}

/// Index metadata of the stacked parameter vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleLayout {
    /// Camera ids in block order.
    pub cameras: Vec<CameraId>,
    /// Sample indices of the target poses, in block order.
    pub boards: Vec<usize>,
}

impl BundleLayout {
    pub fn camera_offset(&self, slot: usize) -> usize {
        slot * CAMERA_BLOCK_SIZE
    }

    pub fn board_offset(&self, slot: usize) -> usize {
        self.cameras.len() * CAMERA_BLOCK_SIZE + slot * POSE_PARAMETER_COUNT
    }

    pub fn parameter_count(&self) -> usize {
        self.board_offset(self.boards.len())
    }

    pub fn camera_slot(&self, camera_id: CameraId) -> Option<usize> {
        self.cameras.iter().position(|&id| id == camera_id)
    }

    pub fn camera_name(&self, slot: usize) -> String {
        format!("cam/{}", self.cameras[slot])
    }

    pub fn board_name(&self, slot: usize) -> String {
        format!("board/{}", self.boards[slot])
    }

    fn camera_block(&self, params: &DVector<f64>, slot: usize) -> DVector<f64> {
        params.rows(self.camera_offset(slot), CAMERA_BLOCK_SIZE).into_owned()
    }

    fn board_block(&self, params: &DVector<f64>, slot: usize) -> DVector<f64> {
        params.rows(self.board_offset(slot), POSE_PARAMETER_COUNT).into_owned()
    }
}

/// One camera's view of one target pose.
#[derive(Debug, Clone)]
pub struct BundleObservation {
    pub camera: usize,
    pub board: usize,
    pub factor: RigReprojectionFactor,
}

/// Stacked reprojection residuals of every observation at `params`.
pub fn bundle_residuals(
    params: &DVector<f64>,
    layout: &BundleLayout,
    observations: &[BundleObservation],
) -> DVector<f64> {
    let values: Vec<f64> = observations
        .iter()
        .flat_map(|observation| {
            observation
                .factor
                .residual_func(&[
                    layout.camera_block(params, observation.camera),
                    layout.board_block(params, observation.board),
                ])
                .as_slice()
                .to_vec()
        })
        .collect();
    DVector::from_vec(values)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleResult {
    /// Every input profile; refined ones carry the new parameters.
    pub profiles: Vec<CameraProfile>,
    pub initial_rms: f64,
    pub final_rms: f64,
    pub optimized: Vec<CameraId>,
    pub fixed: Vec<(CameraId, FixedReason)>,
}

pub struct BundleAdjustment {
    cameras: Vec<BundleCamera>,
    reference: CameraId,
    object: Vec<Vector3<f64>>,
    plane: Vec<Vector2<f64>>,
    samples: HashMap<CameraId, Vec<CalibrationSample>>,
    options: BundleOptions,
    layout: BundleLayout,
    observations: Vec<BundleObservation>,
    params: DVector<f64>,
    fixed: Vec<(CameraId, FixedReason)>,
}

impl BundleAdjustment {
    /// # Errors
    ///
    /// [`CalibrationError::NotCalibrated`] if the reference camera is missing or
    /// its extrinsics are not marked as known.
    pub fn new(
        cameras: Vec<BundleCamera>,
        reference: CameraId,
        target: &PlanarTarget,
        samples: &SampleStore,
        options: BundleOptions,
    ) -> Result<Self, CalibrationError> {
        if !cameras
            .iter()
            .any(|c| c.profile.camera_id == reference && c.extrinsics_known)
        {
            return Err(CalibrationError::NotCalibrated(reference));
        }
        let samples = cameras
            .iter()
            .map(|c| (c.profile.camera_id, samples.camera(c.profile.camera_id).to_vec()))
            .collect();
        Ok(BundleAdjustment {
            cameras,
            reference,
            object: target.object_points(),
            plane: target.plane_points(),
            samples,
            options,
            layout: BundleLayout::default(),
            observations: Vec::new(),
            params: DVector::zeros(0),
            fixed: Vec::new(),
        })
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    pub fn observations(&self) -> &[BundleObservation] {
        &self.observations
    }

    pub fn params(&self) -> &DVector<f64> {
        &self.params
    }

    fn is_fixed(&self, camera_id: CameraId) -> bool {
        self.fixed.iter().any(|(id, _)| *id == camera_id)
    }

    fn camera(&self, camera_id: CameraId) -> Option<&BundleCamera> {
        self.cameras.iter().find(|c| c.profile.camera_id == camera_id)
    }

    fn samples_of(&self, camera_id: CameraId) -> &[CalibrationSample] {
        self.samples.get(&camera_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Target-to-reference pose of sample `k`, from the first camera that can
    /// resolve it (the reference camera first).
    fn initial_board(&self, k: usize) -> Option<Isometry3<f64>> {
        let mut order = self.layout.cameras.clone();
        order.sort_by_key(|&id| id != self.reference);
        order.into_iter().find_map(|id| {
            let camera = self.camera(id)?;
            let sample = self.samples_of(id).get(k)?;
            let seen = sample_pose(&camera.profile.model, &self.plane, sample).ok()?;
            Some(camera.profile.extrinsics().inverse() * seen)
        })
    }

    /// Refined profile of a camera in the layout.
    fn profile_at(&self, slot: usize, base: &CameraProfile) -> Result<CameraProfile, CalibrationError> {
        let block = self.layout.camera_block(&self.params, slot);
        let lens = block.rows(0, RAD_TAN_PARAMETER_COUNT).into_owned();
        let mut model = RadTanModel::new(&lens)?;
        model.resolution = base.model.resolution;
        model.validate_params()?;
        let mut profile = base.clone();
        profile.model = model;
        profile.set_extrinsics(&pose_from_params(block.as_slice(), RAD_TAN_PARAMETER_COUNT));
        Ok(profile)
    }

    /// RMS reprojection error (px) of the observations of the camera in `slot`.
    fn camera_rms(&self, slot: usize) -> Option<f64> {
        let values: Vec<f64> = self
            .observations
            .iter()
            .filter(|observation| observation.camera == slot)
            .flat_map(|observation| {
                observation
                    .factor
                    .residual_func(&[
                        self.layout.camera_block(&self.params, slot),
                        self.layout.board_block(&self.params, observation.board),
                    ])
                    .as_slice()
                    .to_vec()
            })
            .collect();
        ProjectionError::from_residuals(&DVector::from_vec(values))
            .ok()
            .map(|error| error.rmse)
    }

    /// Initializes, refines and reports.
    ///
    /// Refined profiles carry their own post-adjustment RMS in `rms_error`.
    pub fn run(&mut self, verbose: bool) -> Result<BundleResult, CalibrationError> {
        self.linear_estimation()?;
        let initial_rms = self.reprojection_error().rmse;
        self.optimize(verbose)?;
        let final_rms = self.reprojection_error().rmse;

        let mut profiles = Vec::with_capacity(self.cameras.len());
        for camera in &self.cameras {
            let id = camera.profile.camera_id;
            match self.layout.camera_slot(id) {
                Some(slot) if !self.is_fixed(id) => {
                    let mut profile = self.profile_at(slot, &camera.profile)?;
                    profile.rms_error = self.camera_rms(slot);
                    profiles.push(profile);
                }
                _ => profiles.push(camera.profile.clone()),
            }
        }
        let optimized: Vec<CameraId> = self
            .layout
            .cameras
            .iter()
            .copied()
            .filter(|&id| !self.is_fixed(id))
            .collect();

        info!(
            "Bundle adjustment: RMS {:.4} px -> {:.4} px, optimized cameras {:?}",
            initial_rms, final_rms, optimized
        );
        Ok(BundleResult {
            profiles,
            initial_rms,
            final_rms,
            optimized,
            fixed: self.fixed.clone(),
        })
    }
}

impl fmt::Debug for BundleAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BundleAdjustment Summary:\n cameras: {:?}\n boards: {}\n observations: {}\n fixed: {:?} ",
            self.layout.cameras,
            self.layout.boards.len(),
            self.observations.len(),
            self.fixed,
        )
    }
}

impl Optimizer for BundleAdjustment {
    /// Levenberg-Marquardt over every camera and board block. The reference
    /// pose and the held-fixed cameras stay constant.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.observations.is_empty() {
            return Err(CalibrationError::Numerical(
                "linear estimation must run before optimization".to_string(),
            ));
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        for slot in 0..self.layout.cameras.len() {
            initial_values.insert(
                self.layout.camera_name(slot),
                self.layout.camera_block(&self.params, slot),
            );
        }
        for slot in 0..self.layout.boards.len() {
            initial_values.insert(
                self.layout.board_name(slot),
                self.layout.board_block(&self.params, slot),
            );
        }

        for observation in &self.observations {
            let camera = self.layout.camera_name(observation.camera);
            let board = self.layout.board_name(observation.board);
            problem.add_residual_block(
                observation.factor.sample.residual_count(),
                &[camera.as_str(), board.as_str()],
                Box::new(observation.factor.clone()),
                None,
            );
        }

        for (slot, &id) in self.layout.cameras.iter().enumerate() {
            let name = self.layout.camera_name(slot);
            if self.is_fixed(id) {
                (0..CAMERA_BLOCK_SIZE).for_each(|index| problem.fix_variable(&name, index));
            } else if id == self.reference {
                (RAD_TAN_PARAMETER_COUNT..CAMERA_BLOCK_SIZE)
                    .for_each(|index| problem.fix_variable(&name, index));
            }
        }

        if verbose {
            info!("Starting bundle adjustment with tiny_solver Levenberg-Marquardt...");
            info!("{:?}", self);
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.options.solver().to_optimizer_options(verbose)),
            )
            .ok_or_else(|| CalibrationError::Numerical("Optimization failed".to_string()))?;

        let mut params = self.params.clone();
        for slot in 0..self.layout.cameras.len() {
            let block = result.get(&self.layout.camera_name(slot)).ok_or_else(|| {
                CalibrationError::Numerical(format!("camera block {} missing", slot))
            })?;
            params
                .rows_mut(self.layout.camera_offset(slot), CAMERA_BLOCK_SIZE)
                .copy_from(block);
        }
        for slot in 0..self.layout.boards.len() {
            let block = result.get(&self.layout.board_name(slot)).ok_or_else(|| {
                CalibrationError::Numerical(format!("board block {} missing", slot))
            })?;
            params
                .rows_mut(self.layout.board_offset(slot), POSE_PARAMETER_COUNT)
                .copy_from(block);
        }
        if params.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::Numerical(
                "bundle adjustment diverged".to_string(),
            ));
        }
        self.params = params;
        Ok(())
    }

    /// Selects the participating cameras and seeds every target pose from
    /// the current profiles.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        self.fixed.clear();
        let mut ids: Vec<CameraId> = self.cameras.iter().map(|c| c.profile.camera_id).collect();
        ids.sort_unstable();

        let mut layout = BundleLayout::default();
        for id in ids {
            let Some(camera) = self.camera(id) else { continue };
            if !camera.extrinsics_known {
                warn!("Camera {} is excluded from bundle adjustment: extrinsics unknown", id);
                self.fixed.push((id, FixedReason::UnknownExtrinsics));
                continue;
            }
            let found = self.samples_of(id).len();
            if found < self.options.min_samples {
                warn!("Camera {} is held fixed: {} samples", id, found);
                self.fixed.push((
                    id,
                    FixedReason::TooFewSamples {
                        found,
                        required: self.options.min_samples,
                    },
                ));
            }
            layout.cameras.push(id);
        }
        self.layout = layout;

        let board_count = self
            .layout
            .cameras
            .iter()
            .map(|&id| self.samples_of(id).len())
            .max()
            .unwrap_or(0);
        let mut boards = Vec::new();
        for k in 0..board_count {
            match self.initial_board(k) {
                Some(pose) => boards.push((k, pose)),
                None => debug!("Target pose {} could not be initialized and is skipped", k),
            }
        }
        if boards.is_empty() {
            return Err(CalibrationError::CalibrationDegenerate(
                "no target pose could be initialized".to_string(),
            ));
        }
        self.layout.boards = boards.iter().map(|(k, _)| *k).collect();

        let mut observations = Vec::new();
        for (camera_slot, &id) in self.layout.cameras.iter().enumerate() {
            let samples = self.samples_of(id);
            let before = observations.len();
            for (board_slot, &k) in self.layout.boards.iter().enumerate() {
                if let Some(sample) = samples.get(k) {
                    observations.push(BundleObservation {
                        camera: camera_slot,
                        board: board_slot,
                        factor: RigReprojectionFactor {
                            sample: SampleObservations {
                                object: self.object.clone(),
                                observed: sample.points.clone(),
                            },
                        },
                    });
                }
            }
            if observations.len() == before && !self.is_fixed(id) {
                self.fixed.push((id, FixedReason::NoObservedBoard));
            }
        }
        self.observations = observations;

        let mut params = DVector::zeros(self.layout.parameter_count());
        for (slot, &id) in self.layout.cameras.iter().enumerate() {
            if let Some(camera) = self.camera(id) {
                let offset = self.layout.camera_offset(slot);
                params
                    .rows_mut(offset, RAD_TAN_PARAMETER_COUNT)
                    .copy_from(&camera.profile.model.parameters());
                params
                    .rows_mut(offset + RAD_TAN_PARAMETER_COUNT, POSE_PARAMETER_COUNT)
                    .copy_from(&pose_to_params(&camera.profile.extrinsics()));
            }
        }
        for (slot, (_, pose)) in boards.iter().enumerate() {
            params
                .rows_mut(self.layout.board_offset(slot), POSE_PARAMETER_COUNT)
                .copy_from(&pose_to_params(pose));
        }
        self.params = params;
        debug!("{:?}", self);
        Ok(())
    }

    fn reprojection_error(&self) -> ProjectionError {
        ProjectionError::from_residuals(&bundle_residuals(
            &self.params,
            &self.layout,
            &self.observations,
        ))
        .unwrap_or_default()
    }
}
