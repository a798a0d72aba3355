//! The `optimization` module provides the non-linear refinement problems of the rig.
//!
//! This module defines the [`Optimizer`] trait, which outlines the common interface
//! of the three calibration problems solved with tiny-solver's Levenberg-Marquardt:
//!
//! * [`IntrinsicOptimizationCost`]: one camera's lens and its per-sample board poses.
//! * [`StereoOptimizationCost`]: the relative pose of a pair with both lenses held fixed.
//! * [`BundleAdjustment`]: every camera, extrinsic and board pose of the rig at once.
//!
//! Each problem first runs a linear estimation to get an initial guess and then
//! minimizes the reprojection error of the observed target points.

use serde::{Deserialize, Serialize};
use tiny_solver::optimizer::OptimizerOptions;

pub mod bundle;
pub mod factors;
pub mod intrinsic;
pub mod stereo;

pub use bundle::{
    bundle_residuals, BundleAdjustment, BundleCamera, BundleLayout, BundleOptions, BundleResult, FixedReason,
};
pub use intrinsic::IntrinsicOptimizationCost;
pub use stereo::StereoOptimizationCost;

use crate::calibration::CalibrationError;
use crate::util::ProjectionError;

/// Termination criteria handed to the Levenberg-Marquardt solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Stop once the relative cost decrease of an iteration falls below this value.
    pub relative_tolerance: f64,
    /// Stop once the absolute cost decrease of an iteration falls below this value.
    pub absolute_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: 100,
            relative_tolerance: 1e-5,
            absolute_tolerance: 1e-10,
        }
    }
}

impl SolverOptions {
    pub fn to_optimizer_options(&self, verbose: bool) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.max_iterations,
            min_rel_error_decrease_threshold: self.relative_tolerance,
            min_abs_error_decrease_threshold: self.absolute_tolerance,
            verbosity_level: usize::from(verbose),
            ..OptimizerOptions::default()
        }
    }
}

/// A trait for the calibration refinement problems.
///
/// Implementors own their observations and the current parameter estimate.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, the optimizer logs progress information.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the optimization was successful and the parameters
    ///   have been updated.
    /// * `Err(CalibrationError)` - If the solver failed or produced invalid parameters.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Computes a closed-form initial guess for the parameters.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    /// Reprojection statistics of the current estimate over all observations.
    fn reprojection_error(&self) -> ProjectionError;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solver_options_conversion() {
        let options = SolverOptions {
            max_iterations: 42,
            relative_tolerance: 1e-7,
            absolute_tolerance: 1e-12,
        };
        let converted = options.to_optimizer_options(true);
        assert_eq!(converted.max_iteration, 42);
        assert_eq!(converted.min_rel_error_decrease_threshold, 1e-7);
        assert_eq!(converted.min_abs_error_decrease_threshold, 1e-12);
        assert_eq!(converted.verbosity_level, 1);
    }
}
