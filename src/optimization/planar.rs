//! Cost function and optimization routine for calibrating a [`RadTanModel`]
//! from several views of a planar target.
//!
//! All parameters live in one `params` vector: the intrinsics
//! `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` followed by `[rx, ry, rz, tx, ty, tz]`
//! (axis-angle rotation, translation) for every view. A single block keeps
//! the column layout fixed, so repeated runs give identical results.
//!
//! # Scaling
//!
//! Automatic differentiation carries one dual component per entry of the
//! block for every residual, so an iteration costs `O(N²)` in the number of
//! views `N`. For large captures, thin the frames out through the intrinsic
//! exclusions first.

use crate::camera::rad_tan::project_generic;
use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{estimate_homography, planar_pose_from_homography, rotate_axis_angle, RigidTransform};
use crate::optimization::{constant, constant_vector, ensure_finite, solver_options, Optimizer};

use log::info;
use nalgebra::{DVector, Matrix3, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const INTRINSIC_COUNT: usize = 9;
const POSE_COUNT: usize = 6;

/// Board points of one frame and where they were observed.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarView {
    pub points3d: Vec<Vector3<f64>>,
    pub points2d: Vec<Vector2<f64>>,
}

/// Reprojection residuals of all views.
#[derive(Debug, Clone)]
struct PlanarCost {
    views: Vec<PlanarView>,
}

impl<T: nalgebra::RealField> Factor<T> for PlanarCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let p = &params[0];
        let intr = [p[0].clone(), p[1].clone(), p[2].clone(), p[3].clone()];
        let dist = [p[4].clone(), p[5].clone(), p[6].clone(), p[7].clone(), p[8].clone()];

        let total: usize = self.views.iter().map(|v| v.points2d.len()).sum();
        let mut residuals = DVector::zeros(total * 2);
        let mut row = 0;
        for (k, view) in self.views.iter().enumerate() {
            let o = INTRINSIC_COUNT + k * POSE_COUNT;
            let rvec = Vector3::new(p[o].clone(), p[o + 1].clone(), p[o + 2].clone());
            let t = Vector3::new(p[o + 3].clone(), p[o + 4].clone(), p[o + 5].clone());

            for (p3d, p2d) in view.points3d.iter().zip(view.points2d.iter()) {
                let p_cam = rotate_axis_angle(&rvec, &constant_vector(p3d)) + t.clone();
                let projected = project_generic(&intr, &dist, &p_cam);
                residuals[row] = projected.x.clone() - constant::<T>(p2d.x);
                residuals[row + 1] = projected.y.clone() - constant::<T>(p2d.y);
                row += 2;
            }
        }
        residuals
    }
}

/// Multi-view planar calibration of a [`RadTanModel`].
///
/// Holds the model being refined, the views, and one board-to-camera pose
/// per view. Call [`linear_estimation`](Optimizer::linear_estimation) to
/// seed the poses from the current model, then [`optimize`](Optimizer::optimize).
#[derive(Clone)]
pub struct PlanarCalibrationCost {
    model: RadTanModel,
    views: Vec<PlanarView>,
    poses: Vec<RigidTransform>,
    max_iterations: usize,
}

impl PlanarCalibrationCost {
    pub fn new(model: RadTanModel, views: Vec<PlanarView>, max_iterations: usize) -> Self {
        let poses = vec![RigidTransform::identity(); views.len()];
        PlanarCalibrationCost {
            model,
            views,
            poses,
            max_iterations,
        }
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    /// Board-to-camera pose per view, in view order.
    pub fn poses(&self) -> &[RigidTransform] {
        &self.poses
    }

    pub fn views(&self) -> &[PlanarView] {
        &self.views
    }

    fn validate_views(&self) -> Result<(), CalibrationError> {
        if self.views.is_empty() {
            return Err(CalibrationError::MalformedInput(
                "planar calibration needs at least one view".to_string(),
            ));
        }
        for (k, view) in self.views.iter().enumerate() {
            if view.points3d.len() != view.points2d.len() {
                return Err(CalibrationError::MalformedInput(format!(
                    "view {k}: number of 2D and 3D points must match"
                )));
            }
            if view.points3d.len() < 4 {
                return Err(CalibrationError::MalformedInput(format!(
                    "view {k}: at least 4 points are needed, got {}",
                    view.points3d.len()
                )));
            }
        }
        Ok(())
    }
}

impl Optimizer for PlanarCalibrationCost {
    /// Refines intrinsics, distortion and per-view poses.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        self.validate_views()?;

        let mut initial_params = self.model.parameters().as_slice().to_vec();
        for pose in &self.poses {
            let rvec = pose.axis_angle();
            initial_params.extend_from_slice(&[
                rvec.x,
                rvec.y,
                rvec.z,
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
            ]);
        }

        let cost_function = PlanarCost {
            views: self.views.clone(),
        };
        let num_residuals = self.views.iter().map(|v| v.points2d.len() * 2).sum();
        // Jacobian width grows with the view count; see the module docs
        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(num_residuals, &["params"], Box::new(cost_function), None);

        let mut initial_values = HashMap::new();
        initial_values.insert("params".to_string(), DVector::from_vec(initial_params));

        if verbose {
            info!(
                "Starting planar calibration with tiny-solver Levenberg-Marquardt ({} views)...",
                self.views.len()
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(solver_options(self.max_iterations)))
            .ok_or_else(|| CalibrationError::NumericalFailure("planar calibration failed".to_string()))?;

        if verbose {
            info!("Optimization finished");
        }

        let optimized = result.get("params").ok_or_else(|| {
            CalibrationError::NumericalFailure("solver dropped the parameter block".to_string())
        })?;
        ensure_finite("params", optimized)?;

        let intrinsics = optimized.rows(0, INTRINSIC_COUNT).into_owned();
        let poses = (0..self.views.len())
            .map(|k| {
                let o = INTRINSIC_COUNT + k * POSE_COUNT;
                RigidTransform::from_axis_angle(
                    &Vector3::new(optimized[o], optimized[o + 1], optimized[o + 2]),
                    Vector3::new(optimized[o + 3], optimized[o + 4], optimized[o + 5]),
                )
            })
            .collect();

        let mut model = RadTanModel::new(&intrinsics)?;
        model.resolution = self.model.resolution;
        model.validate_params()?;

        self.model = model;
        self.poses = poses;
        Ok(())
    }

    /// Seeds each view's pose from the homography between the board plane and
    /// the undistorted, normalized observations.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        self.validate_views()?;
        let poses = self
            .views
            .iter()
            .map(|view| planar_pose(&self.model, view))
            .collect::<Result<Vec<_>, _>>()?;
        self.poses = poses;
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

/// Closed-form board pose of a single view under `model`.
pub(crate) fn planar_pose(
    model: &RadTanModel,
    view: &PlanarView,
) -> Result<RigidTransform, CalibrationError> {
    let plane: Vec<Vector2<f64>> = view.points3d.iter().map(|p| Vector2::new(p.x, p.y)).collect();
    let normalized = view
        .points2d
        .iter()
        .map(|p| model.undistort(p))
        .collect::<Result<Vec<_>, _>>()?;
    let homography = estimate_homography(&plane, &normalized)?;
    planar_pose_from_homography(&Matrix3::identity(), &homography)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{reprojection_distances, rms};
    use approx::assert_relative_eq;

    fn ground_truth() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 1100.0,
                fy: 1095.0,
                cx: 645.0,
                cy: 355.0,
            },
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            distortions: [-0.05, 0.01, 0.0005, -0.0003, 0.0],
        }
    }

    fn board_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for row in 1..7 {
            for col in 1..9 {
                points.push(Vector3::new(col as f64 * 0.05, row as f64 * 0.05, 0.0));
            }
        }
        points
    }

    fn synthetic_views(model: &RadTanModel) -> (Vec<PlanarView>, Vec<RigidTransform>) {
        let poses = vec![
            RigidTransform::from_axis_angle(&Vector3::new(0.1, -0.2, 0.05), Vector3::new(-0.2, -0.15, 1.0)),
            RigidTransform::from_axis_angle(&Vector3::new(-0.3, 0.1, -0.1), Vector3::new(-0.25, -0.1, 1.2)),
            RigidTransform::from_axis_angle(&Vector3::new(0.25, 0.3, 0.2), Vector3::new(-0.15, -0.2, 0.9)),
            RigidTransform::from_axis_angle(&Vector3::new(-0.1, -0.35, -0.2), Vector3::new(-0.1, -0.1, 1.1)),
        ];
        let points3d = board_points();
        let views = poses
            .iter()
            .map(|pose| PlanarView {
                points3d: points3d.clone(),
                points2d: points3d
                    .iter()
                    .map(|p| model.project(&pose.transform_point(p)).unwrap())
                    .collect(),
            })
            .collect();
        (views, poses)
    }

    #[test]
    fn test_planar_calibration_recovers_intrinsics() {
        let truth = ground_truth();
        let (views, true_poses) = synthetic_views(&truth);

        let seed = RadTanModel::from_field_of_view(truth.resolution, 60.0).unwrap();
        let mut cost = PlanarCalibrationCost::new(seed, views, 100);
        cost.linear_estimation().unwrap();
        cost.optimize(false).unwrap();

        let fitted = cost.model();
        assert_relative_eq!(fitted.intrinsics.fx, truth.intrinsics.fx, max_relative = 5e-3);
        assert_relative_eq!(fitted.intrinsics.fy, truth.intrinsics.fy, max_relative = 5e-3);
        assert_relative_eq!(fitted.intrinsics.cx, truth.intrinsics.cx, max_relative = 5e-3);
        assert_relative_eq!(fitted.intrinsics.cy, truth.intrinsics.cy, max_relative = 5e-3);
        assert_eq!(cost.get_distortion().len(), 5);

        for ((view, pose), truth_pose) in cost.views().iter().zip(cost.poses()).zip(&true_poses) {
            let distances = reprojection_distances(fitted, pose, &view.points3d, &view.points2d).unwrap();
            assert!(rms(&distances) < 1e-2, "rms {}", rms(&distances));
            assert_relative_eq!(pose.translation, truth_pose.translation, epsilon = 5e-3);
        }
    }

    #[test]
    fn test_linear_estimation_recovers_pose_with_known_model() {
        let truth = ground_truth();
        let (views, true_poses) = synthetic_views(&truth);
        let mut cost = PlanarCalibrationCost::new(truth, views, 10);
        cost.linear_estimation().unwrap();
        for (pose, truth_pose) in cost.poses().iter().zip(&true_poses) {
            assert_relative_eq!(pose.rotation, truth_pose.rotation, epsilon = 1e-6);
            assert_relative_eq!(pose.translation, truth_pose.translation, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_many_views_calibrate_identically_twice() {
        let truth = ground_truth();
        let (base_views, _) = synthetic_views(&truth);
        let points3d = board_points();
        let mut views = base_views;
        for k in 0..8 {
            let angle = 0.05 * k as f64;
            let pose = RigidTransform::from_axis_angle(
                &Vector3::new(0.2 - angle, angle - 0.15, 0.1),
                Vector3::new(-0.2 + 0.01 * k as f64, -0.15, 1.0 + 0.05 * k as f64),
            );
            views.push(PlanarView {
                points3d: points3d.clone(),
                points2d: points3d
                    .iter()
                    .map(|p| truth.project(&pose.transform_point(p)).unwrap())
                    .collect(),
            });
        }
        assert_eq!(views.len(), 12);

        let calibrate = |views: Vec<PlanarView>| {
            let seed = RadTanModel::from_field_of_view(truth.resolution, 60.0).unwrap();
            let mut cost = PlanarCalibrationCost::new(seed, views, 100);
            cost.linear_estimation().unwrap();
            cost.optimize(false).unwrap();
            cost
        };
        let first = calibrate(views.clone());
        let second = calibrate(views);
        assert_eq!(first.model().intrinsics, second.model().intrinsics);
        assert_eq!(first.get_distortion(), second.get_distortion());
        assert_eq!(first.poses(), second.poses());
        assert_relative_eq!(first.model().intrinsics.fx, truth.intrinsics.fx, max_relative = 5e-3);
    }

    #[test]
    fn test_rejects_underdetermined_view() {
        let view = PlanarView {
            points3d: vec![Vector3::zeros(); 3],
            points2d: vec![Vector2::zeros(); 3],
        };
        let mut cost = PlanarCalibrationCost::new(ground_truth(), vec![view], 10);
        assert!(matches!(cost.optimize(false), Err(CalibrationError::MalformedInput(_))));
    }
}
