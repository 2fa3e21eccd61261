//! Single-frame board pose estimation with fixed intrinsics.

use crate::camera::rad_tan::project_generic;
use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{rotate_axis_angle, RigidTransform};
use crate::optimization::planar::{planar_pose, PlanarView};
use crate::optimization::{constant, constant_vector, ensure_finite, solver_options, Optimizer};
use crate::util::{reprojection_distances, rms};

use nalgebra::{DVector, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Reprojection residual with the camera held constant. Parameter: `[pose]`.
#[derive(Debug, Clone)]
struct PoseCost {
    intrinsics: [f64; 4],
    distortions: [f64; 5],
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
}

impl<T: nalgebra::RealField> Factor<T> for PoseCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let t = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());
        let intr = self.intrinsics.map(constant::<T>);
        let dist = self.distortions.map(constant::<T>);

        let mut residuals = DVector::zeros(self.points2d.len() * 2);
        for (i, (p3d, p2d)) in self.points3d.iter().zip(self.points2d.iter()).enumerate() {
            let p_cam = rotate_axis_angle(&rvec, &constant_vector(p3d)) + t.clone();
            let projected = project_generic(&intr, &dist, &p_cam);
            residuals[i * 2] = projected.x.clone() - constant::<T>(p2d.x);
            residuals[i * 2 + 1] = projected.y.clone() - constant::<T>(p2d.y);
        }
        residuals
    }
}

/// Board pose in one frame against a fixed [`RadTanModel`].
#[derive(Clone)]
pub struct PoseEstimationCost {
    model: RadTanModel,
    view: PlanarView,
    pose: RigidTransform,
    max_iterations: usize,
}

impl PoseEstimationCost {
    pub fn new(model: RadTanModel, view: PlanarView, max_iterations: usize) -> Self {
        PoseEstimationCost {
            model,
            view,
            pose: RigidTransform::identity(),
            max_iterations,
        }
    }

    pub fn pose(&self) -> &RigidTransform {
        &self.pose
    }

    /// RMS pixel error of the current pose.
    pub fn rms_error(&self) -> Result<f64, CalibrationError> {
        let distances =
            reprojection_distances(&self.model, &self.pose, &self.view.points3d, &self.view.points2d)?;
        Ok(rms(&distances))
    }
}

impl Optimizer for PoseEstimationCost {
    fn optimize(&mut self, _verbose: bool) -> Result<(), CalibrationError> {
        if self.view.points3d.len() != self.view.points2d.len() || self.view.points3d.len() < 4 {
            return Err(CalibrationError::MalformedInput(format!(
                "pose estimation needs at least 4 matched points, got {} and {}",
                self.view.points3d.len(),
                self.view.points2d.len()
            )));
        }

        let rvec = self.pose.axis_angle();
        let t = self.pose.translation;
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "pose".to_string(),
            DVector::from_vec(vec![rvec.x, rvec.y, rvec.z, t.x, t.y, t.z]),
        );

        let intrinsics = self.model.intrinsics;
        let cost = PoseCost {
            intrinsics: [intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy],
            distortions: self.model.distortions,
            points3d: self.view.points3d.clone(),
            points2d: self.view.points2d.clone(),
        };
        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(self.view.points2d.len() * 2, &["pose"], Box::new(cost), None);

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(solver_options(self.max_iterations)))
            .ok_or_else(|| CalibrationError::NumericalFailure("pose estimation failed".to_string()))?;
        let p = result.get("pose").ok_or_else(|| {
            CalibrationError::NumericalFailure("solver dropped the pose block".to_string())
        })?;
        ensure_finite("pose", p)?;

        self.pose = RigidTransform::from_axis_angle(
            &Vector3::new(p[0], p[1], p[2]),
            Vector3::new(p[3], p[4], p[5]),
        );
        Ok(())
    }

    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        self.pose = planar_pose(&self.model, &self.view)?;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.model.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model.get_distortion()
    }
}

/// Board-to-camera pose of one frame and its RMS pixel error.
///
/// # Arguments
///
/// * `model` - Intrinsic model of the observing camera.
/// * `points3d`, `points2d` - Board corners and their detected pixels, in
///   matching order.
/// * `min_points` - Required correspondences; never fewer than four.
/// * `max_iterations` - Refinement iteration limit.
///
/// # Errors
///
/// * [`CalibrationError::MalformedInput`]: Below `min_points`
///   correspondences.
/// * [`CalibrationError::NumericalFailure`]: If the homography seed or the
///   refinement fails.
pub fn estimate_board_pose(
    model: &RadTanModel,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    min_points: usize,
    max_iterations: usize,
) -> Result<(RigidTransform, f64), CalibrationError> {
    let required = min_points.max(4);
    if points3d.len() < required {
        return Err(CalibrationError::MalformedInput(format!(
            "pose estimation needs at least {required} corners, got {}",
            points3d.len()
        )));
    }
    let view = PlanarView {
        points3d: points3d.to_vec(),
        points2d: points2d.to_vec(),
    };
    let mut cost = PoseEstimationCost::new(*model, view, max_iterations);
    cost.linear_estimation()?;
    cost.optimize(false)?;
    let error = cost.rms_error()?;
    Ok((cost.pose, error))
}
