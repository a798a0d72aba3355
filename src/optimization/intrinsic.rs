//! Single-camera calibration problem: lens parameters and one target pose per sample.
//!
//! The linear estimation follows Zhang: one homography per sample, closed-form
//! intrinsics from the image of the absolute conic, and the sample poses
//! recovered from the homographies. The optimization then refines the lens
//! (including distortion) jointly with all sample poses.

use crate::calibration::intrinsic::{intrinsics_from_homographies, square_pixel_intrinsics_from_homographies};
use crate::calibration::{CalibrationError, CalibrationSample, IntrinsicOptions, PlanarTarget};
use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::geometry::{dlt_homography, planar_pose_from_homography, pose_from_params, pose_to_params};
use crate::optimization::factors::{PlanarReprojectionFactor, SampleObservations};
use crate::optimization::Optimizer;
use crate::util::ProjectionError;
use log::{debug, info};
use nalgebra::{DVector, Isometry3, Matrix3, Vector2, Vector3};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const LENS: &str = "lens";

fn pose_name(index: usize) -> String {
    format!("pose/{}", index)
}

/// Cost function for refining a [`RadTanModel`] from planar target samples.
#[derive(Clone)]
pub struct IntrinsicOptimizationCost {
    model: RadTanModel,
    poses: Vec<Isometry3<f64>>,
    object: Vec<Vector3<f64>>,
    plane: Vec<Vector2<f64>>,
    samples: Vec<CalibrationSample>,
    options: IntrinsicOptions,
}

impl IntrinsicOptimizationCost {
    /// The model starts at the image center with zero distortion; call
    /// [`Optimizer::linear_estimation`] before optimizing.
    pub fn new(
        resolution: Resolution,
        target: &PlanarTarget,
        samples: &[CalibrationSample],
        options: IntrinsicOptions,
    ) -> Self {
        let center = resolution.center();
        let focal = resolution.width.max(resolution.height) as f64;
        let model = RadTanModel::from_intrinsics(
            Intrinsics {
                fx: focal,
                fy: focal,
                cx: center.x,
                cy: center.y,
            },
            resolution,
        );
        IntrinsicOptimizationCost {
            model,
            poses: Vec::new(),
            object: target.object_points(),
            plane: target.plane_points(),
            samples: samples.to_vec(),
            options,
        }
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    /// Target-to-camera pose of each sample, valid after linear estimation.
    pub fn poses(&self) -> &[Isometry3<f64>] {
        &self.poses
    }

    fn factor(&self, sample: &CalibrationSample) -> PlanarReprojectionFactor {
        PlanarReprojectionFactor {
            sample: SampleObservations {
                object: self.object.clone(),
                observed: sample.points.clone(),
            },
            square_pixels: self.options.fix_aspect_ratio,
        }
    }

    fn apply_fixed_terms(&mut self) {
        if self.options.fix_aspect_ratio {
            self.model.intrinsics.fy = self.model.intrinsics.fx;
        }
        if self.options.fix_principal_point {
            let center = self.model.resolution.center();
            self.model.intrinsics.cx = center.x;
            self.model.intrinsics.cy = center.y;
        }
        if self.options.zero_tangential {
            self.model.distortions[2] = 0.0;
            self.model.distortions[3] = 0.0;
        }
        if self.options.fix_k3 {
            self.model.distortions[4] = 0.0;
        }
    }
}

impl fmt::Debug for IntrinsicOptimizationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IntrinsicOptimizationCost Summary:\n model: {:?}\n samples: {}, points per sample: {} ",
            self.model,
            self.samples.len(),
            self.object.len(),
        )
    }
}

impl Optimizer for IntrinsicOptimizationCost {
    /// Refines the lens and every sample pose with Levenberg-Marquardt.
    ///
    /// Parameters pinned by [`IntrinsicOptions`] are held at their fixed values
    /// throughout the optimization.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.poses.len() != self.samples.len() {
            return Err(CalibrationError::Numerical(
                "linear estimation must run before optimization".to_string(),
            ));
        }
        self.apply_fixed_terms();

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(LENS.to_string(), self.model.parameters());

        for (index, (sample, pose)) in self.samples.iter().zip(self.poses.iter()).enumerate() {
            let name = pose_name(index);
            let factor = self.factor(sample);
            problem.add_residual_block(
                factor.sample.residual_count(),
                &[LENS, name.as_str()],
                Box::new(factor),
                None,
            );
            initial_values.insert(name, pose_to_params(pose));
        }

        if self.options.fix_aspect_ratio {
            problem.fix_variable(LENS, 1);
        }
        if self.options.fix_principal_point {
            problem.fix_variable(LENS, 2);
            problem.fix_variable(LENS, 3);
        }
        if self.options.zero_tangential {
            problem.fix_variable(LENS, 6);
            problem.fix_variable(LENS, 7);
        }
        if self.options.fix_k3 {
            problem.fix_variable(LENS, 8);
        }

        if verbose {
            info!("Starting intrinsic optimization with tiny_solver Levenberg-Marquardt...");
            info!("Initial model: {:?}", self.model);
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.options.solver.to_optimizer_options(verbose)),
            )
            .ok_or_else(|| CalibrationError::Numerical("Optimization failed".to_string()))?;

        let lens = result
            .get(LENS)
            .ok_or_else(|| CalibrationError::Numerical("lens parameters missing".to_string()))?;
        let mut model = RadTanModel::new(lens)?;
        model.resolution = self.model.resolution;

        let poses = (0..self.samples.len())
            .map(|index| {
                result
                    .get(&pose_name(index))
                    .map(|params| pose_from_params(params.as_slice(), 0))
                    .ok_or_else(|| CalibrationError::Numerical(format!("pose {} missing", index)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        model.validate_params()?;
        self.model = model;
        self.poses = poses;
        self.apply_fixed_terms();

        if verbose {
            info!("Optimized model: {:?}", self.model);
        }
        Ok(())
    }

    /// Zhang's closed-form initialization.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        let homographies = self
            .samples
            .iter()
            .map(|sample| dlt_homography(&self.plane, &sample.points))
            .collect::<Result<Vec<Matrix3<f64>>, _>>()?;

        let intrinsics = if self.options.fix_aspect_ratio {
            square_pixel_intrinsics_from_homographies(&homographies)?
        } else {
            intrinsics_from_homographies(&homographies)?
        };
        debug!("Closed-form intrinsics: {:?}", intrinsics);
        self.model.intrinsics = intrinsics;
        self.model.distortions = [0.0; 5];
        self.apply_fixed_terms();
        self.model.validate_params()?;

        let k = self.model.intrinsics.matrix();
        self.poses = homographies
            .iter()
            .map(|h| planar_pose_from_homography(&k, h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    fn reprojection_error(&self) -> ProjectionError {
        let lens = self.model.parameters();
        let residuals: Vec<f64> = self
            .samples
            .iter()
            .zip(self.poses.iter())
            .flat_map(|(sample, pose)| {
                let block = self
                    .factor(sample)
                    .residual_func(&[lens.clone(), pose_to_params(pose)]);
                block.as_slice().to_vec()
            })
            .collect();
        ProjectionError::from_residuals(&DVector::from_vec(residuals)).unwrap_or_default()
    }
}
