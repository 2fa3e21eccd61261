//! Linear (DLT) triangulation of board corners seen by several calibrated
//! cameras.

use crate::board::BoardModel;
use crate::camera::{CameraModel, RadTanModel};
use crate::config::TriangulationConfig;
use crate::detection::DetectionStore;
use crate::error::CalibrationError;
use crate::exclusion::ExclusionSet;
use crate::geometry::{ray_angle_deg, RigidTransform};

use log::{debug, info, warn};
use nalgebra::{DMatrix, Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A camera with both intrinsics and extrinsics available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedCamera {
    pub index: usize,
    pub model: RadTanModel,
    /// Reference-to-camera transform.
    pub extrinsic: RigidTransform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangulatedPoint {
    pub frame: u32,
    pub corner_id: u32,
    /// Position in the reference camera frame.
    pub position: Vector3<f64>,
    /// Contributing camera indices, ascending.
    pub cameras: Vec<usize>,
    /// Pixel reprojection error per entry of `cameras`.
    pub reprojection_errors: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Triangulation {
    /// Ordered by frame, then corner id.
    pub points: Vec<TriangulatedPoint>,
    pub failures: Vec<CalibrationError>,
}

fn degenerate(frame: u32, corner_id: u32, reason: impl Into<String>) -> CalibrationError {
    CalibrationError::DegenerateGeometry {
        frame,
        corner_id,
        reason: reason.into(),
    }
}

/// Triangulates one corner from `(camera, pixel)` observations.
///
/// # Arguments
///
/// * `frame`, `corner_id` - Identify the corner in the returned point and
///   in error messages.
/// * `observations` - Calibrated camera and pixel of every view of the corner.
/// * `config` - Conditioning and parallax limits.
///
/// # Errors
///
/// * [`CalibrationError::DegenerateGeometry`]: With fewer than two
///   views, a rank-deficient or non-finite system, a point at infinity or
///   behind a camera, or parallax below `config.min_parallax_deg`.
pub fn triangulate_point(
    frame: u32,
    corner_id: u32,
    observations: &[(&CalibratedCamera, Vector2<f64>)],
    config: &TriangulationConfig,
) -> Result<TriangulatedPoint, CalibrationError> {
    if observations.len() < 2 {
        return Err(degenerate(frame, corner_id, "fewer than two views"));
    }

    let mut a = DMatrix::<f64>::zeros(observations.len() * 2, 4);
    for (i, (camera, pixel)) in observations.iter().enumerate() {
        let normalized = camera.model.undistort(pixel).map_err(|err| {
            degenerate(frame, corner_id, format!("camera #{}: {err}", camera.index))
        })?;
        let r = &camera.extrinsic.rotation;
        let t = &camera.extrinsic.translation;
        for (row, coordinate, axis) in [(2 * i, normalized.x, 0), (2 * i + 1, normalized.y, 1)] {
            for col in 0..3 {
                a[(row, col)] = coordinate * r[(2, col)] - r[(axis, col)];
            }
            a[(row, 3)] = coordinate * t.z - t[axis];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| degenerate(frame, corner_id, "SVD did not converge"))?;
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|i, j| svd.singular_values[*i].total_cmp(&svd.singular_values[*j]));
    let largest = svd.singular_values[order[order.len() - 1]];
    let second = svd.singular_values[order[1]];
    if second <= f64::EPSILON || largest / second > config.max_condition {
        return Err(degenerate(frame, corner_id, "rank-deficient system"));
    }

    let solution = v_t.row(order[0]).transpose();
    let w = solution[3];
    if !solution.iter().all(|v| v.is_finite()) {
        return Err(degenerate(frame, corner_id, "non-finite solution"));
    }
    if w.abs() <= 1e-12 * solution.norm() {
        return Err(degenerate(frame, corner_id, "point at infinity"));
    }
    let position = Vector3::new(solution[0] / w, solution[1] / w, solution[2] / w);

    let mut parallax: f64 = 0.0;
    for (i, (first, _)) in observations.iter().enumerate() {
        for (second, _) in &observations[i + 1..] {
            let angle = ray_angle_deg(
                &(position - first.extrinsic.center()),
                &(position - second.extrinsic.center()),
            );
            parallax = parallax.max(angle);
        }
    }
    if parallax < config.min_parallax_deg {
        return Err(degenerate(
            frame,
            corner_id,
            format!("parallax {parallax:.4} deg below {} deg", config.min_parallax_deg),
        ));
    }

    let mut cameras = Vec::with_capacity(observations.len());
    let mut reprojection_errors = Vec::with_capacity(observations.len());
    for (camera, pixel) in observations {
        let in_camera = camera.extrinsic.transform_point(&position);
        if in_camera.z <= 0.0 {
            return Err(degenerate(
                frame,
                corner_id,
                format!("point behind camera #{}", camera.index),
            ));
        }
        let projected = camera
            .model
            .project(&in_camera)
            .map_err(|err| degenerate(frame, corner_id, format!("camera #{}: {err}", camera.index)))?;
        cameras.push(camera.index);
        reprojection_errors.push((projected - pixel).norm());
    }

    Ok(TriangulatedPoint {
        frame,
        corner_id,
        position,
        cameras,
        reprojection_errors,
    })
}

/// Triangulates every on-board corner of `frame` seen by at least two of
/// `cameras`, in corner id order.
///
/// # Arguments
///
/// * `cameras` - Cameras with both intrinsics and extrinsics.
/// * `frame` - Capture instant to triangulate.
///
/// Corners that fail land in [`Triangulation::failures`].
pub fn triangulate_frame(
    store: &DetectionStore,
    board: &BoardModel,
    cameras: &[CalibratedCamera],
    frame: u32,
    config: &TriangulationConfig,
) -> Triangulation {
    let mut by_corner: BTreeMap<u32, Vec<(&CalibratedCamera, Vector2<f64>)>> = BTreeMap::new();
    for camera in cameras {
        let Some(detection) = store.get(camera.index, frame) else {
            continue;
        };
        for corner in detection.corners() {
            if board.corner_position(corner.id).is_some() {
                by_corner
                    .entry(corner.id)
                    .or_default()
                    .push((camera, corner.pixel));
            }
        }
    }

    let mut result = Triangulation::default();
    for (corner_id, mut observations) in by_corner {
        if observations.len() < 2 {
            continue;
        }
        observations.sort_by_key(|(camera, _)| camera.index);
        match triangulate_point(frame, corner_id, &observations, config) {
            Ok(point) => result.points.push(point),
            Err(err) => {
                debug!("{err}");
                result.failures.push(err);
            }
        }
    }
    result
}

/// Triangulates all frames not excluded from the extrinsic stage.
///
/// Frames run in parallel; results are concatenated in frame order.
pub fn triangulate_all(
    store: &DetectionStore,
    board: &BoardModel,
    cameras: &[CalibratedCamera],
    exclusions: &ExclusionSet,
    config: &TriangulationConfig,
) -> Triangulation {
    let frames: Vec<u32> = store
        .frames()
        .into_iter()
        .filter(|frame| !exclusions.is_extrinsic_excluded(*frame))
        .collect();

    let per_frame: Vec<Triangulation> = frames
        .par_iter()
        .map(|frame| triangulate_frame(store, board, cameras, *frame, config))
        .collect();

    let mut result = Triangulation::default();
    for frame_result in per_frame {
        result.points.extend(frame_result.points);
        result.failures.extend(frame_result.failures);
    }

    if !result.failures.is_empty() {
        warn!("{} corner(s) could not be triangulated", result.failures.len());
    }
    info!(
        "Triangulated {} corner(s) over {} frame(s)",
        result.points.len(),
        frames.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::rad_tan::project_generic;
    use crate::test_utils::SyntheticRig;
    use approx::assert_relative_eq;

    fn calibrated(rig: &SyntheticRig) -> Vec<CalibratedCamera> {
        rig.cameras
            .iter()
            .enumerate()
            .map(|(index, camera)| CalibratedCamera {
                index,
                model: camera.model,
                extrinsic: camera.extrinsic,
            })
            .collect()
    }

    fn pixel(camera: &CalibratedCamera, point: &Vector3<f64>) -> Vector2<f64> {
        let i = camera.model.intrinsics;
        project_generic(
            &[i.fx, i.fy, i.cx, i.cy],
            &camera.model.distortions,
            &camera.extrinsic.transform_point(point),
        )
    }

    #[test]
    fn test_two_view_exact() {
        let rig = SyntheticRig::four_cameras();
        let cameras = calibrated(&rig);
        let truth = Vector3::new(0.12, -0.05, 1.8);
        let observations = [
            (&cameras[0], pixel(&cameras[0], &truth)),
            (&cameras[1], pixel(&cameras[1], &truth)),
        ];
        let point = triangulate_point(3, 7, &observations, &TriangulationConfig::default()).unwrap();
        assert_relative_eq!(point.position, truth, epsilon = 1e-9);
        assert_eq!(point.cameras, vec![0, 1]);
        assert!(point.reprojection_errors.iter().all(|e| *e < 1e-6));
    }

    #[test]
    fn test_zero_baseline_is_degenerate() {
        let rig = SyntheticRig::four_cameras();
        let cameras = calibrated(&rig);
        let mut twin = cameras[0];
        twin.index = 9;
        let truth = Vector3::new(0.0, 0.1, 2.0);
        let observations = [
            (&cameras[0], pixel(&cameras[0], &truth)),
            (&twin, pixel(&twin, &truth)),
        ];
        let err = triangulate_point(1, 4, &observations, &TriangulationConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::DegenerateGeometry { frame: 1, corner_id: 4, .. }
        ));
    }

    #[test]
    fn test_point_behind_cameras_is_degenerate() {
        let rig = SyntheticRig::four_cameras();
        let cameras = calibrated(&rig);
        let behind = Vector3::new(0.2, 0.1, -2.0);
        let observations = [
            (&cameras[0], pixel(&cameras[0], &behind)),
            (&cameras[1], pixel(&cameras[1], &behind)),
        ];
        let err = triangulate_point(0, 0, &observations, &TriangulationConfig::default()).unwrap_err();
        match err {
            CalibrationError::DegenerateGeometry { reason, .. } => {
                assert!(reason.contains("behind"), "{reason}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_single_view_is_rejected() {
        let rig = SyntheticRig::four_cameras();
        let cameras = calibrated(&rig);
        let observations = [(&cameras[0], Vector2::new(640.0, 360.0))];
        let err = triangulate_point(3, 7, &observations, &TriangulationConfig::default()).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::DegenerateGeometry {
                frame: 3,
                corner_id: 7,
                reason: "fewer than two views".to_string(),
            }
        );
    }

    #[test]
    fn test_all_frames_recover_board_corners() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let cameras = calibrated(&rig);
        let exclusions = ExclusionSet::new().toggle_extrinsic(rig.frames[2]).exclusions;

        let result = triangulate_all(
            &store,
            &rig.board,
            &cameras,
            &exclusions,
            &TriangulationConfig::default(),
        );
        assert!(result.failures.is_empty());
        let corners = rig.board.corner_count() as usize;
        assert_eq!(result.points.len(), (rig.frames.len() - 1) * corners);
        assert!(result.points.iter().all(|p| p.frame != rig.frames[2]));
        assert!(result
            .points
            .windows(2)
            .all(|w| (w[0].frame, w[0].corner_id) < (w[1].frame, w[1].corner_id)));

        for point in &result.points {
            let position = rig.frames.iter().position(|f| *f == point.frame).unwrap();
            let truth = rig.corner_in_reference(position, point.corner_id);
            assert_relative_eq!(point.position, truth, epsilon = 1e-7);
            assert_eq!(point.cameras, vec![0, 1, 2, 3]);
        }

        let again = triangulate_all(
            &store,
            &rig.board,
            &cameras,
            &exclusions,
            &TriangulationConfig::default(),
        );
        assert_eq!(result, again);
    }
}
