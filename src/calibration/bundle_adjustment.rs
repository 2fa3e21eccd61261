//! Assembles the joint problem over the calibrated cameras and triangulated
//! corners, filters it, runs a [`BundleSolver`] and turns the solver output
//! into new per-camera parameters.

use crate::calibration::chain::ExtrinsicPose;
use crate::calibration::intrinsic::IntrinsicParameters;
use crate::error::CalibrationError;
use crate::export::DiagnosticRecord;
use crate::geometry::RigidTransform;
use crate::optimization::bundle::{BundleSolver, CameraParameters, Observation};

pub use crate::config::{BundleAdjustmentConfig, LossKind};

use log::{info, warn};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Flattened bundle-adjustment input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentProblem {
    pub cameras: Vec<CameraParameters>,
    /// Record index of each entry of `cameras`.
    pub camera_indices: Vec<usize>,
    pub points: Vec<[f64; 3]>,
    pub observations: Vec<Observation>,
    /// Originating frame of each point; required for frame exclusion.
    pub point_frames: Option<Vec<u32>>,
    pub config: BundleAdjustmentConfig,
}

/// What filtering removed before the solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStatistics {
    pub observations_in: usize,
    pub excluded_frame_observations: usize,
    pub outlier_observations: usize,
    /// Points left with fewer than two observations.
    pub dropped_points: usize,
    pub observations_used: usize,
    pub points_used: usize,
}

/// A filtered problem and the original index of each of its points.
#[derive(Debug, Clone)]
pub struct FilteredProblem {
    pub problem: BundleAdjustmentProblem,
    pub point_indices: Vec<usize>,
    pub statistics: FilterStatistics,
}

/// Output of one bundle-adjustment run. Nothing is applied until the caller
/// swaps `intrinsics` and `extrinsics` in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentResult {
    /// State version the input record was taken from.
    pub source_version: u64,
    /// Record index of each entry of `cameras`.
    pub camera_indices: Vec<usize>,
    pub cameras: Vec<CameraParameters>,
    /// Aligned with the input points; points removed by filtering keep their
    /// input position.
    pub points: Vec<[f64; 3]>,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub converged: bool,
    pub status: String,
    pub statistics: FilterStatistics,
    /// Refined parameters by record camera index. Cameras that took no part
    /// in the run have no entry.
    pub intrinsics: BTreeMap<usize, IntrinsicParameters>,
    pub extrinsics: BTreeMap<usize, ExtrinsicPose>,
}

fn malformed(message: impl Into<String>) -> CalibrationError {
    CalibrationError::MalformedInput(message.into())
}

impl BundleAdjustmentProblem {
    /// Builds the problem from a diagnostic record.
    ///
    /// Only cameras with both intrinsics and extrinsics take part. They are
    /// numbered in record order and `camera_indices` maps them back; each
    /// triangulated point contributes one observation per contributing
    /// camera that takes part.
    ///
    /// # Arguments
    ///
    /// * `record` - Diagnostic record of the current calibration state.
    /// * `config` - Solver configuration; `reference_camera` is a record index
    ///   and is translated to the problem numbering.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::MalformedInput`] if the reference camera is not
    /// calibrated, or a point names a camera or observation the record does
    /// not hold.
    pub fn from_diagnostics(
        record: &DiagnosticRecord,
        mut config: BundleAdjustmentConfig,
    ) -> Result<Self, CalibrationError> {
        let mut compact = vec![None; record.cameras.len()];
        let mut camera_indices = Vec::new();
        let mut cameras = Vec::new();
        for (index, camera) in record.cameras.iter().enumerate() {
            let (Some(intrinsics), Some(extrinsics)) = (&camera.intrinsics, &camera.extrinsics) else {
                info!("Camera '{}' is not calibrated and is left out of bundle adjustment", camera.name);
                continue;
            };
            let k = &intrinsics.camera_matrix;
            compact[index] = Some(cameras.len());
            camera_indices.push(index);
            cameras.push(CameraParameters::from_rotation_matrix(
                &extrinsics.rotation,
                &extrinsics.translation,
                [k[(0, 0)], k[(1, 1)]],
                [k[(0, 2)], k[(1, 2)]],
                intrinsics.distortion,
            ));
        }
        config.reference_camera = compact
            .get(config.reference_camera)
            .copied()
            .flatten()
            .ok_or_else(|| {
                malformed(format!(
                    "reference camera #{} is not calibrated",
                    config.reference_camera
                ))
            })?;

        let mut points = Vec::with_capacity(record.points.len());
        let mut point_frames = Vec::with_capacity(record.points.len());
        let mut observations = Vec::new();
        for (index, point) in record.points.iter().enumerate() {
            for camera in &point.cameras {
                let slot = compact.get(*camera).ok_or_else(|| {
                    malformed(format!(
                        "frame {}, corner {}: camera #{camera} is not in the record",
                        point.frame, point.corner_id
                    ))
                })?;
                let Some(compact_camera) = *slot else {
                    continue;
                };
                let [x, y] = record
                    .observation(point.frame, *camera, point.corner_id)
                    .ok_or_else(|| {
                        malformed(format!(
                            "frame {}, corner {}: no observation by camera #{camera}",
                            point.frame, point.corner_id
                        ))
                    })?;
                observations.push(Observation {
                    camera: compact_camera,
                    point: index,
                    x,
                    y,
                });
            }
            points.push([point.position.x, point.position.y, point.position.z]);
            point_frames.push(point.frame);
        }

        Ok(BundleAdjustmentProblem {
            cameras,
            camera_indices,
            points,
            observations,
            point_frames: Some(point_frames),
            config,
        })
    }

/// Checks the problem before any solver work.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.config.validate()?;
        if self.cameras.is_empty() {
            return Err(malformed("bundle adjustment needs at least one camera"));
        }
        if self.points.is_empty() {
            return Err(malformed("bundle adjustment needs at least one point"));
        }
        if self.observations.is_empty() {
            return Err(malformed("bundle adjustment needs at least one observation"));
        }
        if self.camera_indices.len() != self.cameras.len() {
            return Err(malformed(format!(
                "{} camera index(es) for {} camera(s)",
                self.camera_indices.len(),
                self.cameras.len()
            )));
        }
        if self.config.reference_camera >= self.cameras.len() {
            return Err(malformed(format!(
                "reference camera {} out of range ({} camera(s))",
                self.config.reference_camera,
                self.cameras.len()
            )));
        }
        if let Some(index) = self.cameras.iter().position(|c| !c.is_finite()) {
            return Err(malformed(format!("camera #{index} has non-finite parameters")));
        }
        if let Some(index) = self
            .points
            .iter()
            .position(|p| !p.iter().all(|v| v.is_finite()))
        {
            return Err(malformed(format!("point #{index} has non-finite coordinates")));
        }
        for (i, obs) in self.observations.iter().enumerate() {
            if obs.camera >= self.cameras.len() || obs.point >= self.points.len() {
                return Err(malformed(format!(
                    "observation #{i} references camera #{} / point #{} out of range",
                    obs.camera, obs.point
                )));
            }
            if !obs.x.is_finite() || !obs.y.is_finite() {
                return Err(malformed(format!("observation #{i} has non-finite pixel")));
            }
        }
        match &self.point_frames {
            Some(frames) if frames.len() != self.points.len() => Err(malformed(format!(
                "point_frames has {} entries for {} point(s)",
                frames.len(),
                self.points.len()
            ))),
            None if !self.config.exclude_frames.is_empty() => {
                Err(malformed("frame exclusion requires point_frames"))
            }
            _ => Ok(()),
        }
    }

    /// Drops observations of excluded frames and initial outliers, then
    /// points left with fewer than two observations, and compacts the point
    /// indices. Cameras keep their numbering.
    pub fn filter(&self) -> FilteredProblem {
        let excluded: BTreeSet<u32> = self.config.exclude_frames.iter().copied().collect();
        let threshold = self.config.outlier_threshold;
        let mut statistics = FilterStatistics {
            observations_in: self.observations.len(),
            ..FilterStatistics::default()
        };

        let mut kept = Vec::with_capacity(self.observations.len());
        for obs in &self.observations {
            let frame = self.point_frames.as_ref().map(|frames| frames[obs.point]);
            if frame.is_some_and(|f| excluded.contains(&f)) {
                statistics.excluded_frame_observations += 1;
                continue;
            }
            if threshold > 0.0 {
                let residual = self.cameras[obs.camera]
                    .project(&Vector3::from(self.points[obs.point]))
                    .map(|pixel| (pixel - Vector2::new(obs.x, obs.y)).norm());
                if residual.map_or(true, |r| r > threshold) {
                    statistics.outlier_observations += 1;
                    continue;
                }
            }
            kept.push(*obs);
        }

        let mut counts = vec![0usize; self.points.len()];
        for obs in &kept {
            counts[obs.point] += 1;
        }
        let mut remap = vec![None; self.points.len()];
        let mut point_indices = Vec::new();
        for (index, count) in counts.iter().enumerate() {
            if *count >= 2 {
                remap[index] = Some(point_indices.len());
                point_indices.push(index);
            }
        }
        statistics.dropped_points = self.points.len() - point_indices.len();

        let observations: Vec<Observation> = kept
            .into_iter()
            .filter_map(|obs| {
                remap[obs.point].map(|point| Observation { point, ..obs })
            })
            .collect();
        statistics.observations_used = observations.len();
        statistics.points_used = point_indices.len();

        let problem = BundleAdjustmentProblem {
            cameras: self.cameras.clone(),
            camera_indices: self.camera_indices.clone(),
            points: point_indices.iter().map(|i| self.points[*i]).collect(),
            observations,
            point_frames: self
                .point_frames
                .as_ref()
                .map(|frames| point_indices.iter().map(|i| frames[*i]).collect()),
            config: self.config.clone(),
        };
        FilteredProblem {
            problem,
            point_indices,
            statistics,
        }
    }
}

/// Per-camera RMS pixel residual over `problem`'s observations.
fn camera_rms(problem: &BundleAdjustmentProblem, cameras: &[CameraParameters], points: &[[f64; 3]]) -> Vec<Option<f64>> {
    let mut sums = vec![(0.0, 0usize); cameras.len()];
    for obs in &problem.observations {
        if let Some(pixel) = cameras[obs.camera].project(&Vector3::from(points[obs.point])) {
            let (sum, count) = &mut sums[obs.camera];
            *sum += (pixel - Vector2::new(obs.x, obs.y)).norm_squared();
            *count += 1;
        }
    }
    sums.into_iter()
        .map(|(sum, count)| (count > 0).then(|| (sum / count as f64).sqrt()))
        .collect()
}

/// Runs the full orchestration on a diagnostic record.
///
/// Cameras without intrinsics or extrinsics sit the run out and keep their
/// state; the result only carries parameters for the cameras that took part.
///
/// # Arguments
///
/// * `record` - Diagnostic record of the state to refine.
/// * `config` - Solver configuration, with `reference_camera` as a record
///   index.
/// * `solver` - Nonlinear least-squares backend.
///
/// # Errors
///
/// Input problems fail fast with [`CalibrationError::MalformedInput`],
/// including a filter that leaves no observation. Solver errors are passed
/// through, and a solver output of the wrong shape is a
/// [`CalibrationError::NumericalFailure`]. A run that does not converge is
/// not an error: it returns its best-effort result with `converged == false`.
pub fn run_bundle_adjustment(
    record: &DiagnosticRecord,
    config: BundleAdjustmentConfig,
    solver: &dyn BundleSolver,
) -> Result<BundleAdjustmentResult, CalibrationError> {
    let problem = BundleAdjustmentProblem::from_diagnostics(record, config)?;
    problem.validate()?;
    let filtered = problem.filter();
    if filtered.problem.observations.is_empty() {
        return Err(malformed("no observations left after filtering"));
    }
    info!(
        "Bundle adjustment: {} of {} camera(s), {} of {} point(s), {} of {} observation(s)",
        filtered.problem.cameras.len(),
        record.cameras.len(),
        filtered.statistics.points_used,
        problem.points.len(),
        filtered.statistics.observations_used,
        filtered.statistics.observations_in
    );

    let output = solver.solve(&filtered.problem)?;
    if output.cameras.len() != problem.cameras.len()
        || output.points.len() != filtered.problem.points.len()
    {
        return Err(CalibrationError::NumericalFailure(
            "solver returned a differently sized problem".to_string(),
        ));
    }
    let converged = output.status.is_converged();
    if !converged {
        warn!("Bundle adjustment did not converge: {}", output.status);
    }

    let mut points = problem.points.clone();
    for (filtered_index, original) in filtered.point_indices.iter().enumerate() {
        points[*original] = output.points[filtered_index];
    }

    let rms = camera_rms(&filtered.problem, &output.cameras, &output.points);
    let mut intrinsics = BTreeMap::new();
    let mut extrinsics = BTreeMap::new();
    for (index, (camera, record_index)) in
        output.cameras.iter().zip(&problem.camera_indices).enumerate()
    {
        let diagnostics = &record.cameras[*record_index];
        // from_diagnostics only keeps cameras that have both
        let (Some(previous_intrinsics), Some(previous_extrinsics)) =
            (&diagnostics.intrinsics, &diagnostics.extrinsics)
        else {
            return Err(malformed(format!("camera '{}' lost its parameters", diagnostics.name)));
        };
        let camera_matrix = Matrix3::new(
            camera.focal[0],
            0.0,
            camera.principal_point[0],
            0.0,
            camera.focal[1],
            camera.principal_point[1],
            0.0,
            0.0,
            1.0,
        );
        intrinsics.insert(
            *record_index,
            IntrinsicParameters {
                camera_matrix,
                distortion: camera.distortion,
                rms_error: rms[index].unwrap_or(previous_intrinsics.rms_error),
                ..previous_intrinsics.clone()
            },
        );
        let transform = RigidTransform::new(camera.rotation_matrix(), camera.translation_vector());
        let error = if index == problem.config.reference_camera {
            0.0
        } else {
            previous_extrinsics.error
        };
        extrinsics.insert(*record_index, ExtrinsicPose::from_transform(&transform, error));
    }

    info!(
        "Bundle adjustment {} after {} iteration(s): cost {:.6e} -> {:.6e}",
        output.status, output.iterations, output.initial_cost, output.final_cost
    );

    Ok(BundleAdjustmentResult {
        source_version: record.version,
        camera_indices: problem.camera_indices,
        cameras: output.cameras,
        points,
        initial_cost: output.initial_cost,
        final_cost: output.final_cost,
        iterations: output.iterations,
        converged,
        status: output.status.to_string(),
        statistics: filtered.statistics,
        intrinsics,
        extrinsics,
    })
}
