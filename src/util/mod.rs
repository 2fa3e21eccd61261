//! Reprojection error statistics.

use crate::camera::CameraModel;
use crate::error::CalibrationError;
use crate::geometry::RigidTransform;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summary statistics over per-point pixel distances.
    pub fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Per-point pixel distances after mapping board points through `pose` and
/// projecting with `camera_model`.
///
/// A point that cannot be projected (behind the camera) is an error, so a bad
/// pose never yields an optimistic score.
pub fn reprojection_distances<T>(
    camera_model: &T,
    pose: &RigidTransform,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
) -> Result<Vec<f64>, CalibrationError>
where
    T: ?Sized + CameraModel,
{
    if points3d.len() != points2d.len() {
        return Err(CalibrationError::MalformedInput(
            "Number of 2D and 3D points must match".to_string(),
        ));
    }
    points3d
        .iter()
        .zip(points2d.iter())
        .map(|(p3d, p2d)| {
            let projected = camera_model.project(&pose.transform_point(p3d))?;
            Ok((projected - p2d).norm())
        })
        .collect()
}

/// Root-mean-square of pixel distances, `sqrt(mean(d²))`.
pub fn rms(distances: &[f64]) -> f64 {
    if distances.is_empty() {
        return 0.0;
    }
    (distances.iter().map(|d| d * d).sum::<f64>() / distances.len() as f64).sqrt()
}
