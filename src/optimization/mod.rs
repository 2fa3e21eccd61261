//! The `optimization` module builds and runs the nonlinear least-squares
//! problems of the calibration pipeline on top of `tiny_solver`.
//!
//! This module defines the [`Optimizer`] trait, the common interface for the
//! single-camera problems:
//!
//! * [`PlanarCalibrationCost`]: intrinsics, distortion and one board pose per
//!   frame from several views of the planar target.
//! * [`PoseEstimationCost`]: the board pose in one frame with the intrinsics
//!   held fixed.
//!
//! Both follow the same two steps:
//! 1. A linear estimation (homography decomposition) for the initial poses.
//! 2. A Levenberg-Marquardt refinement of all free parameters.
//!
//! The multi-camera problem lives in [`bundle`] and has its own solver seam.

use crate::camera::{Intrinsics, Resolution};
use crate::error::CalibrationError;
use nalgebra::{DVector, RealField, Vector3};
use tiny_solver::OptimizerOptions;

pub mod bundle;
pub mod planar;
pub mod pose;

pub use bundle::{BundleSolver, LevenbergMarquardtSolver, OptimizationStatus};
pub use planar::{PlanarCalibrationCost, PlanarView};
pub use pose::{estimate_board_pose, PoseEstimationCost};

/// A trait for camera model optimization tasks.
///
/// Types implementing `Optimizer` refine the parameters they own by
/// minimizing the reprojection error of 3D-2D correspondences.
pub trait Optimizer {
    /// Performs non-linear optimization of the owned parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is logged at `info` level.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The parameters have been updated.
    /// * `Err(CalibrationError)` - Invalid input, or the solver produced no
    ///   usable (finite) result.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Closed-form initial guess used before [`optimize`](Self::optimize).
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64>;
}

/// Solver options shared by the single-camera problems.
pub(crate) fn solver_options(max_iterations: usize) -> OptimizerOptions {
    OptimizerOptions {
        max_iteration: max_iterations,
        verbosity_level: 0,
        ..OptimizerOptions::default()
    }
}

/// Converts an `f64` constant into the solver scalar type.
#[inline]
pub(crate) fn constant<T: RealField>(value: f64) -> T {
    T::from_f64(value).unwrap()
}

pub(crate) fn constant_vector<T: RealField>(v: &Vector3<f64>) -> Vector3<T> {
    Vector3::new(constant(v.x), constant(v.y), constant(v.z))
}

/// Reads `[fx, fy, cx, cy]` and `[k1, k2, p1, p2, k3]` from a 9-vector.
pub(crate) fn split_intrinsics<T: RealField>(params: &DVector<T>) -> ([T; 4], [T; 5]) {
    (
        [
            params[0].clone(),
            params[1].clone(),
            params[2].clone(),
            params[3].clone(),
        ],
        [
            params[4].clone(),
            params[5].clone(),
            params[6].clone(),
            params[7].clone(),
            params[8].clone(),
        ],
    )
}

/// Values must all be finite before they are written back.
pub(crate) fn ensure_finite(name: &str, values: &DVector<f64>) -> Result<(), CalibrationError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CalibrationError::NumericalFailure(format!(
            "optimization produced non-finite values for '{name}'"
        )))
    }
}
