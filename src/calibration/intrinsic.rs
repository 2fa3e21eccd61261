//! Per-camera intrinsic calibration from planar target views.

use crate::board::BoardModel;
use crate::camera::{RadTanModel, Resolution};
use crate::config::IntrinsicConfig;
use crate::detection::DetectionStore;
use crate::error::CalibrationError;
use crate::exclusion::ExclusionSet;
use crate::geometry::RigidTransform;
use crate::optimization::{estimate_board_pose, Optimizer, PlanarCalibrationCost, PlanarView};
use crate::util::{reprojection_distances, rms, ProjectionError};

use log::{debug, info, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Board pose of one frame and its RMS reprojection error in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FramePose {
    pub frame: u32,
    /// Axis-angle board-to-camera rotation.
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
    pub error: f64,
}

impl FramePose {
    pub fn transform(&self) -> RigidTransform {
        RigidTransform::from_axis_angle(&self.rotation, self.translation)
    }
}

/// Diagnostic entry for a usable frame, whether or not it was part of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub frame: u32,
    pub excluded: bool,
    pub pose: Option<FramePose>,
    pub error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicParameters {
    /// Upper-triangular, `[2][2] = 1`.
    pub camera_matrix: Matrix3<f64>,
    /// `[k1, k2, p1, p2, k3]`
    pub distortion: [f64; 5],
    pub rms_error: f64,
    /// One entry per frame used in the fit, in frame order.
    pub frame_poses: Vec<FramePose>,
    /// One entry per usable frame, including excluded ones.
    pub all_frame_errors: Vec<FrameError>,
    pub resolution: Resolution,
}

impl IntrinsicParameters {
    pub fn model(&self) -> Result<RadTanModel, CalibrationError> {
        Ok(RadTanModel::from_camera_matrix(
            &self.camera_matrix,
            self.distortion,
            self.resolution,
        )?)
    }

    pub fn from_model(
        model: &RadTanModel,
        rms_error: f64,
        frame_poses: Vec<FramePose>,
        all_frame_errors: Vec<FrameError>,
    ) -> Self {
        IntrinsicParameters {
            camera_matrix: model.camera_matrix(),
            distortion: model.distortions,
            rms_error,
            frame_poses,
            all_frame_errors,
            resolution: model.resolution,
        }
    }
}

/// Frames of `camera` with at least `min_corners` on-board corners, ascending.
///
/// # Arguments
///
/// * `camera` - Camera index; an unknown index yields no frames.
/// * `min_corners` - Corners that must map to a board position.
pub fn usable_frames(
    store: &DetectionStore,
    board: &BoardModel,
    camera: usize,
    min_corners: usize,
) -> Vec<u32> {
    store
        .camera_detections(camera)
        .map(|detections| {
            detections
                .iter()
                .filter(|(_, detection)| board.count_on_board(detection) >= min_corners)
                .map(|(frame, _)| *frame)
                .collect()
        })
        .unwrap_or_default()
}

fn view_for(store: &DetectionStore, board: &BoardModel, camera: usize, frame: u32) -> PlanarView {
    let (points3d, points2d) = store
        .get(camera, frame)
        .map(|detection| board.object_points(detection))
        .unwrap_or_default();
    PlanarView { points3d, points2d }
}

/// Calibrates one camera.
///
/// The fit uses the usable frames not excluded for this camera; every usable
/// frame, excluded or not, then gets a single-frame pose and error against
/// the fitted model in `all_frame_errors`.
///
/// # Arguments
///
/// * `store` - Detections of the whole rig.
/// * `board` - Board geometry used to look up corner positions.
/// * `camera` - Index of the camera to calibrate.
/// * `exclusions` - Frames left out of this camera's fit.
/// * `config` - Frame and corner minimums, assumed field of view and
///   iteration limit.
///
/// # Errors
///
/// * [`CalibrationError::MalformedInput`]: If `camera` is out of range.
/// * [`CalibrationError::InsufficientFrames`]: If fewer than
///   `config.min_frames` usable frames remain after exclusions.
/// * [`CalibrationError::NumericalFailure`]: If the linear seed or the
///   refinement fails, or the reprojection error is not finite.
pub fn calibrate_camera(
    store: &DetectionStore,
    board: &BoardModel,
    camera: usize,
    exclusions: &ExclusionSet,
    config: &IntrinsicConfig,
) -> Result<IntrinsicParameters, CalibrationError> {
    let info = store.camera(camera).ok_or_else(|| {
        CalibrationError::MalformedInput(format!("camera index {camera} out of range"))
    })?;
    let name = info.name.clone();

    let usable = usable_frames(store, board, camera, config.min_corners);
    let fit_frames: Vec<u32> = usable
        .iter()
        .copied()
        .filter(|frame| !exclusions.is_intrinsic_excluded(camera, *frame))
        .collect();
    if fit_frames.len() < config.min_frames {
        warn!(
            "Camera '{name}': {} usable frame(s) after exclusions, {} required",
            fit_frames.len(),
            config.min_frames
        );
        return Err(CalibrationError::InsufficientFrames {
            camera: name,
            available: fit_frames.len(),
            required: config.min_frames,
        });
    }

    let seed = RadTanModel::from_field_of_view(info.resolution, config.assumed_fov_deg)?;
    let views: Vec<PlanarView> = fit_frames
        .iter()
        .map(|frame| view_for(store, board, camera, *frame))
        .collect();

    let numerical = |err: CalibrationError| match err {
        CalibrationError::NumericalFailure(reason) => {
            CalibrationError::NumericalFailure(format!("camera '{name}': {reason}"))
        }
        other => other,
    };

    let mut cost = PlanarCalibrationCost::new(seed, views, config.max_iterations);
    cost.linear_estimation().map_err(numerical)?;
    cost.optimize(false).map_err(numerical)?;
    let model = *cost.model();

    let mut all_distances = Vec::new();
    let mut frame_poses = Vec::with_capacity(fit_frames.len());
    for ((frame, view), pose) in fit_frames.iter().zip(cost.views()).zip(cost.poses()) {
        let distances = reprojection_distances(&model, pose, &view.points3d, &view.points2d)?;
        let error = rms(&distances);
        all_distances.extend(distances);
        debug!("Camera '{name}', frame {frame}: rms {error:.4} px");
        frame_poses.push(FramePose {
            frame: *frame,
            rotation: pose.axis_angle(),
            translation: pose.translation,
            error,
        });
    }
    let rms_error = rms(&all_distances);
    if let Some(stats) = ProjectionError::from_errors(&all_distances) {
        debug!("Camera '{name}': {stats:?}");
    }
    if !rms_error.is_finite() {
        return Err(CalibrationError::NumericalFailure(format!(
            "camera '{name}': reprojection error is not finite"
        )));
    }

    let all_frame_errors = usable
        .iter()
        .map(|frame| {
            let view = view_for(store, board, camera, *frame);
            let excluded = exclusions.is_intrinsic_excluded(camera, *frame);
            match estimate_board_pose(
                &model,
                &view.points3d,
                &view.points2d,
                config.min_corners,
                config.max_iterations,
            ) {
                Ok((pose, error)) => FrameError {
                    frame: *frame,
                    excluded,
                    pose: Some(FramePose {
                        frame: *frame,
                        rotation: pose.axis_angle(),
                        translation: pose.translation,
                        error,
                    }),
                    error: Some(error),
                },
                Err(err) => {
                    debug!("Camera '{name}', frame {frame}: no single-frame pose ({err})");
                    FrameError {
                        frame: *frame,
                        excluded,
                        pose: None,
                        error: None,
                    }
                }
            }
        })
        .collect();

    info!(
        "Camera '{name}' calibrated from {} frame(s): fx {:.3} fy {:.3} cx {:.3} cy {:.3}, rms {:.4} px",
        fit_frames.len(),
        model.intrinsics.fx,
        model.intrinsics.fy,
        model.intrinsics.cx,
        model.intrinsics.cy,
        rms_error
    );

    Ok(IntrinsicParameters::from_model(
        &model,
        rms_error,
        frame_poses,
        all_frame_errors,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SyntheticRig;
    use approx::assert_relative_eq;

    #[test]
    fn test_recovers_intrinsics_from_synthetic_views() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let config = IntrinsicConfig::default();

        for camera in 0..rig.cameras.len() {
            let params =
                calibrate_camera(&store, &rig.board, camera, &ExclusionSet::new(), &config).unwrap();
            let truth = &rig.cameras[camera].model;
            let k = params.camera_matrix;
            assert_relative_eq!(k[(0, 0)], truth.intrinsics.fx, max_relative = 5e-3);
            assert_relative_eq!(k[(1, 1)], truth.intrinsics.fy, max_relative = 5e-3);
            assert_relative_eq!(k[(0, 2)], truth.intrinsics.cx, max_relative = 5e-3);
            assert_relative_eq!(k[(1, 2)], truth.intrinsics.cy, max_relative = 5e-3);
            assert_eq!(k[(2, 2)], 1.0);
            assert_eq!(k[(1, 0)], 0.0);
            assert_eq!(k[(2, 0)], 0.0);
            assert_eq!(k[(2, 1)], 0.0);
            assert_eq!(params.distortion.len(), 5);
            assert!(params.rms_error < 0.05, "rms {}", params.rms_error);
        }
    }

    #[test]
    fn test_recomputation_is_bit_identical() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let exclusions = ExclusionSet::new().toggle_intrinsic(1, rig.frames[0]).exclusions;
        let config = IntrinsicConfig::default();

        let first = calibrate_camera(&store, &rig.board, 1, &exclusions, &config).unwrap();
        let second = calibrate_camera(&store, &rig.board, 1, &exclusions, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_two_frames_insufficient_three_succeed() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections_for_frames(&rig.frames[..2]);
        let err = calibrate_camera(&store, &rig.board, 0, &ExclusionSet::new(), &IntrinsicConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            CalibrationError::InsufficientFrames {
                camera: "cam0".to_string(),
                available: 2,
                required: 3,
            }
        );

        let store = rig.detections_for_frames(&rig.frames[..3]);
        let params =
            calibrate_camera(&store, &rig.board, 0, &ExclusionSet::new(), &IntrinsicConfig::default())
                .unwrap();
        assert_eq!(params.frame_poses.len(), 3);
    }

    #[test]
    fn test_unknown_camera_is_malformed_input() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let err = calibrate_camera(&store, &rig.board, 9, &ExclusionSet::new(), &IntrinsicConfig::default())
            .unwrap_err();
        assert!(matches!(err, CalibrationError::MalformedInput(_)), "{err:?}");
        assert!(usable_frames(&store, &rig.board, 9, 4).is_empty());
    }

    #[test]
    fn test_exclusion_shrinks_fit_but_not_diagnostics() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let config = IntrinsicConfig::default();
        let usable = usable_frames(&store, &rig.board, 2, config.min_corners);

        let before = calibrate_camera(&store, &rig.board, 2, &ExclusionSet::new(), &config).unwrap();
        let update = ExclusionSet::new()
            .toggle_intrinsic_position(2, &usable, 1)
            .unwrap();
        let after = calibrate_camera(&store, &rig.board, 2, &update.exclusions, &config).unwrap();

        assert_eq!(after.frame_poses.len(), before.frame_poses.len() - 1);
        assert!(after.frame_poses.iter().all(|p| p.frame != usable[1]));
        assert_eq!(after.all_frame_errors.len(), before.all_frame_errors.len());
        assert_eq!(after.all_frame_errors.len(), usable.len());

        let excluded = after
            .all_frame_errors
            .iter()
            .find(|e| e.frame == usable[1])
            .unwrap();
        assert!(excluded.excluded);
        assert!(excluded.error.is_some());
    }

    #[test]
    fn test_usable_frames_respects_threshold() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let all = usable_frames(&store, &rig.board, 0, 1);
        assert_eq!(all, rig.frames);
        let none = usable_frames(&store, &rig.board, 0, rig.board.corner_count() as usize + 1);
        assert!(none.is_empty());
    }
}
