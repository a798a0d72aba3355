//! Relative pose of a calibrated camera pair.
//!
//! Both lenses are held fixed. The unknowns are the reference-to-second-camera
//! transform and one target pose per shared sample (expressed in the first
//! camera's frame). Each sample contributes the reprojection error of the
//! target in both views.

use crate::calibration::{CalibrationError, CalibrationSample, PlanarTarget};
use crate::camera::RadTanModel;
use crate::geometry::{
    dlt_homography, mean_pose, planar_pose_from_homography, pose_from_params, pose_to_params,
    POSE_PARAMETER_COUNT,
};
use crate::optimization::factors::{FixedLensFactor, SampleObservations};
use crate::optimization::{Optimizer, SolverOptions};
use crate::util::ProjectionError;
use log::{debug, info};
use nalgebra::{DMatrix, DVector, Isometry3, Vector2, Vector3};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const RELATIVE: &str = "relative";

fn board_name(index: usize) -> String {
    format!("board/{}", index)
}

fn lens_array(model: &RadTanModel) -> [f64; 9] {
    let params = model.parameters();
    std::array::from_fn(|i| params[i])
}

/// Target-to-camera pose from one sample, using the homography of the undistorted corners.
pub fn sample_pose(
    model: &RadTanModel,
    plane: &[Vector2<f64>],
    sample: &CalibrationSample,
) -> Result<Isometry3<f64>, CalibrationError> {
    let ideal = sample
        .points
        .iter()
        .map(|p| model.undistort_pixel(p))
        .collect::<Result<Vec<_>, _>>()?;
    let h = dlt_homography(plane, &ideal)?;
    Ok(planar_pose_from_homography(&model.intrinsics.matrix(), &h)?)
}

#[derive(Clone)]
pub struct StereoOptimizationCost {
    left: RadTanModel,
    right: RadTanModel,
    object: Vec<Vector3<f64>>,
    plane: Vec<Vector2<f64>>,
    left_samples: Vec<CalibrationSample>,
    right_samples: Vec<CalibrationSample>,
    relative: Isometry3<f64>,
    boards: Vec<Isometry3<f64>>,
    solver: SolverOptions,
}

impl StereoOptimizationCost {
    /// `left_samples[k]` and `right_samples[k]` must show the same target pose.
    pub fn new(
        left: &RadTanModel,
        right: &RadTanModel,
        target: &PlanarTarget,
        left_samples: &[CalibrationSample],
        right_samples: &[CalibrationSample],
        solver: SolverOptions,
    ) -> Self {
        let shared = left_samples.len().min(right_samples.len());
        StereoOptimizationCost {
            left: left.clone(),
            right: right.clone(),
            object: target.object_points(),
            plane: target.plane_points(),
            left_samples: left_samples[..shared].to_vec(),
            right_samples: right_samples[..shared].to_vec(),
            relative: Isometry3::identity(),
            boards: Vec::new(),
            solver,
        }
    }

    /// Reference-to-second-camera transform (`X_right = R X_left + t`).
    pub fn relative_pose(&self) -> &Isometry3<f64> {
        &self.relative
    }

    /// Target poses in the first camera's frame, one per shared sample.
    pub fn board_poses(&self) -> &[Isometry3<f64>] {
        &self.boards
    }

    fn left_factor(&self, index: usize) -> FixedLensFactor {
        FixedLensFactor {
            lens: lens_array(&self.left),
            chained: false,
            sample: SampleObservations {
                object: self.object.clone(),
                observed: self.left_samples[index].points.clone(),
            },
        }
    }

    fn right_factor(&self, index: usize) -> FixedLensFactor {
        FixedLensFactor {
            lens: lens_array(&self.right),
            chained: true,
            sample: SampleObservations {
                object: self.object.clone(),
                observed: self.right_samples[index].points.clone(),
            },
        }
    }

    /// Second-view residuals as a function of the relative pose, with the board poses held.
    fn right_residuals(&self, relative: &DVector<f64>) -> DVector<f64> {
        let blocks: Vec<f64> = self
            .boards
            .iter()
            .enumerate()
            .flat_map(|(index, board)| {
                self.right_factor(index)
                    .residual_func(&[relative.clone(), pose_to_params(board)])
                    .as_slice()
                    .to_vec()
            })
            .collect();
        DVector::from_vec(blocks)
    }

    /// Condition number of the column-scaled Jacobian of the residual with
    /// respect to the six relative-pose parameters, by central differences.
    ///
    /// Returns `f64::INFINITY` when a parameter has no influence on the residual.
    pub fn relative_pose_condition_number(&self) -> f64 {
        let params = pose_to_params(&self.relative);
        let rows = self.boards.len() * self.object.len() * 2;
        if rows < POSE_PARAMETER_COUNT {
            return f64::INFINITY;
        }

        let mut jacobian = DMatrix::<f64>::zeros(rows, POSE_PARAMETER_COUNT);
        for column in 0..POSE_PARAMETER_COUNT {
            let step = 1e-6 * params[column].abs().max(1.0);
            let mut forward = params.clone();
            let mut backward = params.clone();
            forward[column] += step;
            backward[column] -= step;
            let derivative =
                (self.right_residuals(&forward) - self.right_residuals(&backward)) / (2.0 * step);
            let norm = derivative.norm();
            if !norm.is_finite() || norm <= f64::EPSILON {
                return f64::INFINITY;
            }
            jacobian.set_column(column, &(derivative / norm));
        }

        let singular_values = jacobian.singular_values();
        let largest = singular_values.max();
        let smallest = singular_values.min();
        if smallest <= 0.0 || !smallest.is_finite() {
            f64::INFINITY
        } else {
            largest / smallest
        }
    }
}

impl fmt::Debug for StereoOptimizationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StereoOptimizationCost Summary:\n relative: {:?}\n shared samples: {} ",
            self.relative,
            self.left_samples.len(),
        )
    }
}

impl Optimizer for StereoOptimizationCost {
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.boards.len() != self.left_samples.len() || self.boards.is_empty() {
            return Err(CalibrationError::Numerical(
                "linear estimation must run before optimization".to_string(),
            ));
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(RELATIVE.to_string(), pose_to_params(&self.relative));

        for (index, board) in self.boards.iter().enumerate() {
            let name = board_name(index);
            let left = self.left_factor(index);
            let right = self.right_factor(index);
            problem.add_residual_block(
                left.sample.residual_count(),
                &[name.as_str()],
                Box::new(left),
                None,
            );
            problem.add_residual_block(
                right.sample.residual_count(),
                &[RELATIVE, name.as_str()],
                Box::new(right),
                None,
            );
            initial_values.insert(name, pose_to_params(board));
        }

        if verbose {
            info!("Starting stereo optimization with tiny_solver Levenberg-Marquardt...");
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.solver.to_optimizer_options(verbose)),
            )
            .ok_or_else(|| CalibrationError::Numerical("Optimization failed".to_string()))?;

        let relative = result
            .get(RELATIVE)
            .ok_or_else(|| CalibrationError::Numerical("relative pose missing".to_string()))?;
        if relative.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::Numerical(
                "relative pose is not finite".to_string(),
            ));
        }
        let boards = (0..self.boards.len())
            .map(|index| {
                result
                    .get(&board_name(index))
                    .map(|params| pose_from_params(params.as_slice(), 0))
                    .ok_or_else(|| CalibrationError::Numerical(format!("board {} missing", index)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.relative = pose_from_params(relative.as_slice(), 0);
        self.boards = boards;
        if verbose {
            info!("Optimized relative pose: {:?}", self.relative);
        }
        Ok(())
    }

    /// Chordal mean of the per-sample relative poses.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        let mut boards = Vec::with_capacity(self.left_samples.len());
        let mut relatives = Vec::with_capacity(self.left_samples.len());
        for (left, right) in self.left_samples.iter().zip(self.right_samples.iter()) {
            let left_pose = sample_pose(&self.left, &self.plane, left)?;
            let right_pose = sample_pose(&self.right, &self.plane, right)?;
            relatives.push(right_pose * left_pose.inverse());
            boards.push(left_pose);
        }
        self.relative = mean_pose(&relatives)?;
        debug!("Initial relative pose: {:?}", self.relative);
        self.boards = boards;
        Ok(())
    }

    fn reprojection_error(&self) -> ProjectionError {
        let relative = pose_to_params(&self.relative);
        let mut residuals = self.right_residuals(&relative).as_slice().to_vec();
        for (index, board) in self.boards.iter().enumerate() {
            residuals.extend_from_slice(
                self.left_factor(index)
                    .residual_func(&[pose_to_params(board)])
                    .as_slice(),
            );
        }
        ProjectionError::from_residuals(&DVector::from_vec(residuals)).unwrap_or_default()
    }
}
