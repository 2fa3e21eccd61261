//! Solver seam for the multi-camera bundle adjustment.
//!
//! [`BundleSolver`] consumes an assembled [`BundleAdjustmentProblem`] and
//! returns optimized cameras and points. [`LevenbergMarquardtSolver`] is the
//! default implementation.
//!
//! Parameter blocks, in column order:
//! * per camera, by index: rotation `[qx, qy, qz, qw]` on the quaternion
//!   manifold (3 tangent columns), translation `[tx, ty, tz]` and intrinsics
//!   `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`;
//! * per point, by index: `[x, y, z]`, eliminated with the Schur complement.
//!
//! Residuals and Jacobians come from `tiny_solver` automatic differentiation.
//! The normal equations are assembled and solved here in that fixed order, so
//! two runs on the same problem give bit-identical results.

use crate::calibration::bundle_adjustment::BundleAdjustmentProblem;
use crate::camera::rad_tan::project_generic;
use crate::config::LossKind;
use crate::error::CalibrationError;
use crate::geometry::rotate_quaternion;
use crate::optimization::{constant, split_intrinsics};

use log::{debug, info};
use nalgebra::{DMatrix, DVector, Matrix3, MatrixXx3, Quaternion, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tiny_solver::factors::Factor;
use tiny_solver::manifold::so3::QuaternionManifold;
use tiny_solver::parameter_block::ParameterBlock;
use tiny_solver::ResidualBlock;

/// Tangent sizes of the rotation, translation and intrinsics blocks.
const CAMERA_BLOCKS: [usize; 3] = [3, 3, 9];
/// Where each camera block starts in one observation's Jacobian.
const CAMERA_OFFSETS: [usize; 3] = [0, 3, 6];
const POINT_OFFSET: usize = 15;

const INITIAL_DAMPING: f64 = 1e-3;
const DAMPING_MIN: f64 = 1e-12;
const DAMPING_MAX: f64 = 1e12;
const DAMPING_INCREASE: f64 = 10.0;
const DAMPING_DECREASE: f64 = 0.1;

/// One camera in the flattened problem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Unit quaternion `[w, x, y, z]` of the reference-to-camera rotation.
    pub rotation: [f64; 4],
    pub translation: [f64; 3],
    /// `[fx, fy]`
    pub focal: [f64; 2],
    /// `[cx, cy]`
    pub principal_point: [f64; 2],
    /// `[k1, k2, p1, p2, k3]`
    pub distortion: [f64; 5],
}

impl CameraParameters {
    pub fn from_rotation_matrix(
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        focal: [f64; 2],
        principal_point: [f64; 2],
        distortion: [f64; 5],
    ) -> Self {
        let q = UnitQuaternion::from_matrix(rotation);
        CameraParameters {
            rotation: [q.w, q.i, q.j, q.k],
            translation: [translation.x, translation.y, translation.z],
            focal,
            principal_point,
            distortion,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        let [w, x, y, z] = self.rotation;
        UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
            .to_rotation_matrix()
            .into_inner()
    }

    pub fn translation_vector(&self) -> Vector3<f64> {
        Vector3::from(self.translation)
    }

    fn intrinsics_vector(&self) -> DVector<f64> {
        let [fx, fy] = self.focal;
        let [cx, cy] = self.principal_point;
        let [k1, k2, p1, p2, k3] = self.distortion;
        DVector::from_vec(vec![fx, fy, cx, cy, k1, k2, p1, p2, k3])
    }

    /// Solver blocks: rotation `[qx, qy, qz, qw]` on the quaternion
    /// manifold, translation, intrinsics.
    fn parameter_blocks(&self) -> [ParameterBlock; 3] {
        let [w, x, y, z] = self.rotation;
        let mut rotation = ParameterBlock::from_vec(DVector::from_vec(vec![x, y, z, w]));
        rotation.set_manifold(Arc::new(QuaternionManifold));
        [
            rotation,
            ParameterBlock::from_vec(DVector::from_row_slice(&self.translation)),
            ParameterBlock::from_vec(self.intrinsics_vector()),
        ]
    }

    fn from_parameter_blocks(blocks: &[ParameterBlock; 3]) -> Self {
        let [rotation, translation, intrinsics] = blocks;
        let (q, t, k) = (&rotation.params, &translation.params, &intrinsics.params);
        CameraParameters {
            rotation: [q[3], q[0], q[1], q[2]],
            translation: [t[0], t[1], t[2]],
            focal: [k[0], k[1]],
            principal_point: [k[2], k[3]],
            distortion: [k[4], k[5], k[6], k[7], k[8]],
        }
    }

    /// Pixel projection of a reference-frame point, `None` behind the camera.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        let p_cam = rotate_quaternion(&self.rotation, point) + self.translation_vector();
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        let intr = [self.focal[0], self.focal[1], self.principal_point[0], self.principal_point[1]];
        Some(project_generic(&intr, &self.distortion, &p_cam))
    }

    pub fn is_finite(&self) -> bool {
        self.rotation
            .iter()
            .chain(self.translation.iter())
            .chain(self.focal.iter())
            .chain(self.principal_point.iter())
            .chain(self.distortion.iter())
            .all(|v| v.is_finite())
    }
}

/// One observed pixel of a point by a camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera: usize,
    pub point: usize,
    pub x: f64,
    pub y: f64,
}

/// Represents the outcome of an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizationStatus {
    Converged,
    MaxIterationsReached,
    CostToleranceReached,
    ParameterToleranceReached,
    GradientToleranceReached,
    NumericalFailure,
    Failed(String),
}

impl OptimizationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
            OptimizationStatus::Failed(msg) => write!(f, "Failed: {msg}"),
        }
    }
}

/// What a [`BundleSolver`] hands back. Never discarded on non-convergence.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    pub cameras: Vec<CameraParameters>,
    pub points: Vec<[f64; 3]>,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub status: OptimizationStatus,
}

/// The nonlinear least-squares engine behind bundle adjustment.
pub trait BundleSolver {
    /// Minimizes the reprojection error of an already validated and filtered
    /// problem.
    fn solve(&self, problem: &BundleAdjustmentProblem) -> Result<SolverOutput, CalibrationError>;
}

/// Reprojection residual of one observation.
/// Parameters: `[rotation (xyzw), translation, intrinsics, point]`.
#[derive(Debug, Clone)]
struct ReprojectionFactor {
    observed: Vector2<f64>,
}

impl<T: nalgebra::RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let q = &params[0];
        let quaternion = [q[3].clone(), q[0].clone(), q[1].clone(), q[2].clone()];
        let t = Vector3::new(params[1][0].clone(), params[1][1].clone(), params[1][2].clone());
        let (intr, dist) = split_intrinsics(&params[2]);
        let point = Vector3::new(params[3][0].clone(), params[3][1].clone(), params[3][2].clone());

        let p_cam = rotate_quaternion(&quaternion, &point) + t;
        let projected = project_generic(&intr, &dist, &p_cam);

        DVector::from_vec(vec![
            projected.x.clone() - constant::<T>(self.observed.x),
            projected.y.clone() - constant::<T>(self.observed.y),
        ])
    }
}

/// Robust kernel `ρ(s)` on the squared residual norm, and its derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustKernel {
    kind: LossKind,
    scale: f64,
}

impl RobustKernel {
    pub fn new(kind: LossKind, scale: f64) -> Self {
        RobustKernel { kind, scale }
    }

    pub fn rho(&self, s: f64) -> f64 {
        let d2 = self.scale * self.scale;
        match self.kind {
            LossKind::None => s,
            LossKind::Huber if s <= d2 => s,
            LossKind::Huber => 2.0 * self.scale * s.sqrt() - d2,
            LossKind::Cauchy => d2 * (1.0 + s / d2).ln(),
        }
    }

    pub fn weight(&self, s: f64) -> f64 {
        let d2 = self.scale * self.scale;
        match self.kind {
            LossKind::None => 1.0,
            LossKind::Huber if s <= d2 => 1.0,
            LossKind::Huber => self.scale / s.sqrt(),
            LossKind::Cauchy => 1.0 / (1.0 + s / d2),
        }
    }
}

/// Levenberg-Marquardt bundle adjustment with a Schur-complement step.
///
/// The damping `λ` is carried across iterations. A step is accepted when it
/// lowers the cost, and the gain ratio between actual and predicted decrease
/// then scales `λ` down (ratio above 0.75) or up (below 0.25). A rejected
/// step multiplies `λ` by ten and is retried from the same linearization;
/// once `λ` would pass its upper bound the run ends as
/// [`OptimizationStatus::Failed`].
///
/// Termination tests run only after an accepted step, in order: cost at the
/// rounding floor of the initial cost, cost tolerance `Δf ≤ ftol·f`,
/// parameter tolerance `‖Δx‖ ≤ xtol·(xtol + ‖x‖)`. The gradient tolerance
/// `‖Jᵀρ'r‖∞ < gtol` is tested on every fresh linearization. Every attempted
/// step counts towards `max_iterations`.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardtSolver {
    pub verbose: bool,
}

impl LevenbergMarquardtSolver {
    pub fn new(verbose: bool) -> Self {
        LevenbergMarquardtSolver { verbose }
    }
}

/// Current values of every parameter block.
#[derive(Clone)]
struct Parameters {
    cameras: Vec<[ParameterBlock; 3]>,
    points: Vec<ParameterBlock>,
}

impl Parameters {
    fn observation_blocks(&self, obs: &Observation) -> [&ParameterBlock; 4] {
        let [rotation, translation, intrinsics] = &self.cameras[obs.camera];
        [rotation, translation, intrinsics, &self.points[obs.point]]
    }
}

/// `JᵀWJ` and `JᵀWr` split into the camera system and the per-point blocks.
struct NormalEquations {
    camera_hessian: DMatrix<f64>,
    camera_gradient: DVector<f64>,
    point_hessians: Vec<Matrix3<f64>>,
    point_gradients: Vec<Vector3<f64>>,
    /// `J_cᵀ W J_p` for every free point.
    coupling: Vec<MatrixXx3<f64>>,
}

impl NormalEquations {
    fn zeros(camera_dim: usize, point_count: usize) -> Self {
        NormalEquations {
            camera_hessian: DMatrix::zeros(camera_dim, camera_dim),
            camera_gradient: DVector::zeros(camera_dim),
            point_hessians: vec![Matrix3::zeros(); point_count],
            point_gradients: vec![Vector3::zeros(); point_count],
            coupling: vec![MatrixXx3::zeros(camera_dim); point_count],
        }
    }

    fn gradient_norm(&self) -> f64 {
        self.camera_gradient
            .iter()
            .chain(self.point_gradients.iter().flat_map(|g| g.iter()))
            .fold(0.0, |acc: f64, v| acc.max(v.abs()))
    }
}

struct Step {
    cameras: DVector<f64>,
    points: Vec<Vector3<f64>>,
}

impl Step {
    fn norm_squared(&self) -> f64 {
        self.cameras.norm_squared() + self.points.iter().map(|p| p.norm_squared()).sum::<f64>()
    }

    fn is_finite(&self) -> bool {
        self.cameras
            .iter()
            .chain(self.points.iter().flat_map(|p| p.iter()))
            .all(|v| v.is_finite())
    }

    /// `½ hᵀ(λh − g)`, the decrease promised by the damped linear model.
    fn predicted_reduction(&self, equations: &NormalEquations, damping: f64) -> f64 {
        let along_gradient = self.cameras.dot(&equations.camera_gradient)
            + self
                .points
                .iter()
                .zip(&equations.point_gradients)
                .map(|(h, g)| h.dot(g))
                .sum::<f64>();
        0.5 * (damping * self.norm_squared() - along_gradient)
    }
}

/// Column bookkeeping for one solve.
struct Layout<'a> {
    problem: &'a BundleAdjustmentProblem,
    kernel: RobustKernel,
    residuals: Vec<ResidualBlock>,
    /// First column of each free camera block in the reduced camera system.
    camera_columns: Vec<[Option<usize>; 3]>,
    camera_dim: usize,
    /// Position of each free point among the eliminated point blocks.
    point_slots: Vec<Option<usize>>,
    point_count: usize,
}

impl<'a> Layout<'a> {
    fn new(problem: &'a BundleAdjustmentProblem) -> Result<Self, CalibrationError> {
        let config = &problem.config;
        let mut observed_cameras = vec![false; problem.cameras.len()];
        let mut observed_points = vec![false; problem.points.len()];
        for obs in &problem.observations {
            if obs.camera >= problem.cameras.len() || obs.point >= problem.points.len() {
                return Err(CalibrationError::MalformedInput(format!(
                    "observation of point {} by camera {} is out of range",
                    obs.point, obs.camera
                )));
            }
            observed_cameras[obs.camera] = true;
            observed_points[obs.point] = true;
        }

        let mut camera_dim = 0;
        let mut camera_columns = Vec::with_capacity(problem.cameras.len());
        for (camera, observed) in observed_cameras.iter().enumerate() {
            let pose_free = *observed && config.optimize_extrinsics && camera != config.reference_camera;
            let free = [pose_free, pose_free, *observed && config.optimize_intrinsics];
            let mut columns = [None; 3];
            for (block, is_free) in free.iter().enumerate() {
                if *is_free {
                    columns[block] = Some(camera_dim);
                    camera_dim += CAMERA_BLOCKS[block];
                }
            }
            camera_columns.push(columns);
        }

        let mut point_count = 0;
        let mut point_slots = Vec::with_capacity(problem.points.len());
        for observed in observed_points {
            if observed && config.optimize_points {
                point_slots.push(Some(point_count));
                point_count += 1;
            } else {
                point_slots.push(None);
            }
        }

        let residuals = problem
            .observations
            .iter()
            .enumerate()
            .map(|(id, obs)| {
                ResidualBlock::new(
                    id,
                    2,
                    2 * id,
                    &[],
                    Box::new(ReprojectionFactor {
                        observed: Vector2::new(obs.x, obs.y),
                    }),
                    None,
                )
            })
            .collect();

        Ok(Layout {
            problem,
            kernel: RobustKernel::new(config.loss, config.loss_scale),
            residuals,
            camera_columns,
            camera_dim,
            point_slots,
            point_count,
        })
    }

    fn is_fixed(&self) -> bool {
        self.camera_dim == 0 && self.point_count == 0
    }

    fn initial_parameters(&self) -> Parameters {
        Parameters {
            cameras: self.problem.cameras.iter().map(|c| c.parameter_blocks()).collect(),
            points: self
                .problem
                .points
                .iter()
                .map(|p| ParameterBlock::from_vec(DVector::from_row_slice(p)))
                .collect(),
        }
    }

    /// `½ Σ ρ(‖r‖²)`.
    fn cost(&self, params: &Parameters) -> f64 {
        self.problem
            .observations
            .iter()
            .zip(&self.residuals)
            .map(|(obs, block)| {
                let residual = block.residual(&params.observation_blocks(obs), false);
                self.kernel.rho(residual.norm_squared())
            })
            .sum::<f64>()
            * 0.5
    }

    /// Accumulates the IRLS-weighted normal equations, one observation at a
    /// time in input order.
    fn linearize(&self, params: &Parameters) -> NormalEquations {
        let mut eq = NormalEquations::zeros(self.camera_dim, self.point_count);
        for (obs, block) in self.problem.observations.iter().zip(&self.residuals) {
            let (residual, jacobian) = block.residual_and_jacobian(&params.observation_blocks(obs));
            let weight = self.kernel.weight(residual.norm_squared());

            // (column, jacobian offset, size) of the free camera blocks
            let segments: Vec<(usize, usize, usize)> = self.camera_columns[obs.camera]
                .iter()
                .enumerate()
                .filter_map(|(b, column)| column.map(|c| (c, CAMERA_OFFSETS[b], CAMERA_BLOCKS[b])))
                .collect();

            for &(row, offset, dim) in &segments {
                let jt = jacobian.columns(offset, dim).transpose();
                let mut gradient = eq.camera_gradient.rows_mut(row, dim);
                gradient += &jt * &residual * weight;
                for &(column, other_offset, other_dim) in &segments {
                    let mut hessian = eq.camera_hessian.view_mut((row, column), (dim, other_dim));
                    hessian += &jt * jacobian.columns(other_offset, other_dim) * weight;
                }
            }

            if let Some(slot) = self.point_slots[obs.point] {
                let jp = jacobian.fixed_columns::<3>(POINT_OFFSET);
                let jpt = jp.transpose();
                eq.point_hessians[slot] += &jpt * jp * weight;
                eq.point_gradients[slot] += &jpt * &residual * weight;
                for &(row, offset, dim) in &segments {
                    let mut coupling = eq.coupling[slot].rows_mut(row, dim);
                    coupling += jacobian.columns(offset, dim).transpose() * jp * weight;
                }
            }
        }
        eq
    }

    /// Solves `(H + λI) h = −g` by eliminating the points. `None` when a
    /// block or the reduced camera system is not positive definite.
    fn solve_step(&self, eq: &NormalEquations, damping: f64) -> Option<Step> {
        let mut reduced = eq.camera_hessian.clone();
        for i in 0..self.camera_dim {
            reduced[(i, i)] += damping;
        }
        let mut rhs = -&eq.camera_gradient;

        let mut inverses = Vec::with_capacity(self.point_count);
        for ((hessian, gradient), coupling) in
            eq.point_hessians.iter().zip(&eq.point_gradients).zip(&eq.coupling)
        {
            let inverse = (hessian + Matrix3::identity() * damping).try_inverse()?;
            let scaled = coupling * inverse;
            reduced -= &scaled * coupling.transpose();
            rhs += &scaled * gradient;
            inverses.push(inverse);
        }

        let cameras = if self.camera_dim == 0 {
            DVector::zeros(0)
        } else {
            reduced.cholesky()?.solve(&rhs)
        };
        let points = inverses
            .iter()
            .zip(&eq.point_gradients)
            .zip(&eq.coupling)
            .map(|((inverse, gradient), coupling)| inverse * (-gradient - coupling.transpose() * &cameras))
            .collect();
        Some(Step { cameras, points })
    }

    fn apply(&self, params: &Parameters, step: &Step) -> Parameters {
        let mut next = params.clone();
        for (blocks, columns) in next.cameras.iter_mut().zip(&self.camera_columns) {
            for ((block, column), dim) in blocks.iter_mut().zip(columns).zip(CAMERA_BLOCKS) {
                if let Some(column) = column {
                    block.params = block.plus_f64(step.cameras.rows(*column, dim));
                }
            }
        }
        for (point, slot) in next.points.iter_mut().zip(&self.point_slots) {
            if let Some(slot) = slot {
                let delta = DVector::from_column_slice(step.points[*slot].as_slice());
                point.params = point.plus_f64(delta.as_view());
            }
        }
        next
    }

    fn free_norm(&self, params: &Parameters) -> f64 {
        let cameras = params
            .cameras
            .iter()
            .zip(&self.camera_columns)
            .flat_map(|(blocks, columns)| blocks.iter().zip(columns))
            .filter(|(_, column)| column.is_some())
            .map(|(block, _)| block.params.norm_squared());
        let points = params
            .points
            .iter()
            .zip(&self.point_slots)
            .filter(|(_, slot)| slot.is_some())
            .map(|(point, _)| point.params.norm_squared());
        cameras.chain(points).sum::<f64>().sqrt()
    }

    fn output(
        &self,
        params: &Parameters,
        initial_cost: f64,
        final_cost: f64,
        iterations: usize,
        status: OptimizationStatus,
    ) -> SolverOutput {
        SolverOutput {
            cameras: params.cameras.iter().map(CameraParameters::from_parameter_blocks).collect(),
            points: params
                .points
                .iter()
                .map(|p| [p.params[0], p.params[1], p.params[2]])
                .collect(),
            initial_cost,
            final_cost,
            iterations,
            status,
        }
    }
}

impl BundleSolver for LevenbergMarquardtSolver {
    fn solve(&self, problem: &BundleAdjustmentProblem) -> Result<SolverOutput, CalibrationError> {
        let config = &problem.config;
        let layout = Layout::new(problem)?;
        let mut params = layout.initial_parameters();

        let initial_cost = layout.cost(&params);
        if !initial_cost.is_finite() {
            return Err(CalibrationError::NumericalFailure(
                "initial bundle adjustment cost is not finite".to_string(),
            ));
        }
        if layout.is_fixed() {
            info!("Bundle adjustment has no free parameters");
            return Ok(layout.output(&params, initial_cost, initial_cost, 0, OptimizationStatus::Converged));
        }

        if self.verbose {
            info!(
                "Starting bundle adjustment: {} cameras, {} points, {} observations, {} camera columns, {} free points",
                problem.cameras.len(),
                problem.points.len(),
                problem.observations.len(),
                layout.camera_dim,
                layout.point_count
            );
        }

        let mut cost = initial_cost;
        let mut damping = INITIAL_DAMPING;
        let mut iterations = 0;
        let mut equations = layout.linearize(&params);
        let mut linearized = true;

        let status = loop {
            if linearized && equations.gradient_norm() < config.gradient_tolerance {
                break OptimizationStatus::GradientToleranceReached;
            }
            linearized = false;
            if iterations >= config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            iterations += 1;

            let step = match layout.solve_step(&equations, damping) {
                Some(step) if step.is_finite() => Some(step),
                Some(_) => break OptimizationStatus::NumericalFailure,
                None => None,
            };
            let candidate = step.map(|step| {
                let next = layout.apply(&params, &step);
                let next_cost = layout.cost(&next);
                (step, next, next_cost)
            });

            match candidate {
                Some((step, next, next_cost)) if next_cost.is_finite() && next_cost < cost => {
                    let predicted = step.predicted_reduction(&equations, damping);
                    let decrease = cost - next_cost;
                    let gain = if predicted > 0.0 { decrease / predicted } else { 1.0 };
                    let step_norm = step.norm_squared().sqrt();
                    let x_norm = layout.free_norm(&params);
                    debug!(
                        "iteration {iterations}: cost {cost:.6e} -> {next_cost:.6e}, |dx| {step_norm:.3e}, damping {damping:.3e}, gain {gain:.3}"
                    );

                    params = next;
                    cost = next_cost;
                    if gain > 0.75 {
                        damping = (damping * DAMPING_DECREASE).max(DAMPING_MIN);
                    } else if gain < 0.25 {
                        damping = (damping * DAMPING_INCREASE).min(DAMPING_MAX);
                    }

                    if cost <= f64::EPSILON * initial_cost {
                        break OptimizationStatus::Converged;
                    }
                    if decrease <= config.cost_tolerance * cost {
                        break OptimizationStatus::CostToleranceReached;
                    }
                    if step_norm <= config.parameter_tolerance * (config.parameter_tolerance + x_norm) {
                        break OptimizationStatus::ParameterToleranceReached;
                    }
                    equations = layout.linearize(&params);
                    linearized = true;
                }
                _ => {
                    debug!("iteration {iterations}: step rejected at damping {damping:.3e}");
                    if damping >= DAMPING_MAX {
                        break OptimizationStatus::Failed("damping limit reached".to_string());
                    }
                    damping = (damping * DAMPING_INCREASE).min(DAMPING_MAX);
                }
            }
        };

        if self.verbose {
            info!(
                "Bundle adjustment finished after {iterations} iteration(s): {status}, cost {initial_cost:.6e} -> {cost:.6e}"
            );
        }

        Ok(layout.output(&params, initial_cost, cost, iterations, status))
    }
}
