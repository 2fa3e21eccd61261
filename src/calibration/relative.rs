//! Relative pose of two cameras from frames in which both see the board.

use crate::board::BoardModel;
use crate::calibration::covisibility::CovisibilityGraph;
use crate::camera::RadTanModel;
use crate::config::ExtrinsicConfig;
use crate::detection::DetectionStore;
use crate::error::CalibrationError;
use crate::exclusion::ExclusionSet;
use crate::geometry::RigidTransform;
use crate::optimization::estimate_board_pose;

use log::{debug, info};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Parent-to-child transform of one spanning-tree edge: `X_child = R · X_parent + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativePose {
    pub parent: usize,
    pub child: usize,
    pub transform: RigidTransform,
    /// RMS deviation of the per-frame translations from their mean.
    pub error: f64,
    /// Frames that contributed a valid pose pair.
    pub frames: usize,
}

fn board_pose(
    store: &DetectionStore,
    board: &BoardModel,
    model: &RadTanModel,
    camera: usize,
    frame: u32,
    config: &ExtrinsicConfig,
) -> Result<RigidTransform, CalibrationError> {
    let detection = store.get(camera, frame).ok_or_else(|| {
        CalibrationError::MalformedInput(format!(
            "camera '{}' has no detection in frame {frame}",
            store.camera_name(camera)
        ))
    })?;
    let (points3d, points2d) = board.object_points(detection);
    let (pose, _) = estimate_board_pose(
        model,
        &points3d,
        &points2d,
        config.min_pose_corners,
        config.max_iterations,
    )?;
    Ok(pose)
}

/// Estimates the `parent -> child` transform.
///
/// Per covisible, non-excluded frame the board pose is estimated in both
/// cameras and `T_child · T_parent⁻¹` taken. The rotations are averaged as
/// axis-angle vectors, which is adequate while the per-frame estimates agree
/// closely; the translations are averaged arithmetically.
///
/// # Arguments
///
/// * `graph` - Covisibility graph supplying the frames of the edge.
/// * `exclusions` - Extrinsic exclusions applied to those frames.
/// * `parent`, `parent_model` - Camera closer to the reference and its
///   intrinsic model.
/// * `child`, `child_model` - Camera being attached and its model.
/// * `config` - Minimum frame count and pose estimation settings.
///
/// # Errors
///
/// * [`CalibrationError::InsufficientEdgeFrames`]: If fewer than
///   `config.min_edge_frames` frames remain after exclusions, or no frame
///   yields a board pose in both cameras.
#[allow(clippy::too_many_arguments)]
pub fn estimate_relative_pose(
    store: &DetectionStore,
    board: &BoardModel,
    graph: &CovisibilityGraph,
    exclusions: &ExclusionSet,
    parent: usize,
    parent_model: &RadTanModel,
    child: usize,
    child_model: &RadTanModel,
    config: &ExtrinsicConfig,
) -> Result<RelativePose, CalibrationError> {
    let insufficient = |available: usize| CalibrationError::InsufficientEdgeFrames {
        parent: store.camera_name(parent),
        child: store.camera_name(child),
        available,
        required: config.min_edge_frames,
    };

    let frames: Vec<u32> = graph
        .edge(parent, child)
        .iter()
        .map(|covisible| covisible.frame)
        .filter(|frame| !exclusions.is_extrinsic_excluded(*frame))
        .collect();
    if frames.len() < config.min_edge_frames {
        return Err(insufficient(frames.len()));
    }

    let mut relatives = Vec::with_capacity(frames.len());
    for frame in &frames {
        let pair = board_pose(store, board, parent_model, parent, *frame, config).and_then(|a| {
            board_pose(store, board, child_model, child, *frame, config).map(|b| (a, b))
        });
        match pair {
            Ok((board_in_parent, board_in_child)) => {
                let relative = board_in_child.compose(&board_in_parent.inverse());
                if relative.is_finite() {
                    relatives.push(relative);
                }
            }
            Err(err) => debug!(
                "Edge '{}' -> '{}', frame {frame}: skipped ({err})",
                store.camera_name(parent),
                store.camera_name(child)
            ),
        }
    }
    if relatives.is_empty() {
        return Err(insufficient(0));
    }

    let count = relatives.len() as f64;
    let mean_rvec = relatives
        .iter()
        .fold(Vector3::zeros(), |acc, r| acc + r.axis_angle())
        / count;
    let mean_t = relatives
        .iter()
        .fold(Vector3::zeros(), |acc, r| acc + r.translation)
        / count;
    let error = (relatives
        .iter()
        .map(|r| (r.translation - mean_t).norm_squared())
        .sum::<f64>()
        / count)
        .sqrt();

    info!(
        "Edge '{}' -> '{}': {} frame(s), translation spread {:.6}",
        store.camera_name(parent),
        store.camera_name(child),
        relatives.len(),
        error
    );

    Ok(RelativePose {
        parent,
        child,
        transform: RigidTransform::from_axis_angle(&mean_rvec, mean_t),
        error,
        frames: relatives.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::covisibility::build_covisibility_graph;
    use crate::test_utils::SyntheticRig;
    use approx::assert_relative_eq;

    #[test]
    fn test_relative_pose_matches_ground_truth() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections();
        let config = ExtrinsicConfig::default();
        let exclusions = ExclusionSet::new();
        let graph = build_covisibility_graph(&store, &rig.board, &exclusions, 6);

        let relative = estimate_relative_pose(
            &store,
            &rig.board,
            &graph,
            &exclusions,
            0,
            &rig.cameras[0].model,
            2,
            &rig.cameras[2].model,
            &config,
        )
        .unwrap();

        let truth = rig.cameras[2]
            .extrinsic
            .compose(&rig.cameras[0].extrinsic.inverse());
        assert_eq!(relative.frames, rig.frames.len());
        assert_relative_eq!(relative.transform.rotation, truth.rotation, epsilon = 1e-6);
        assert_relative_eq!(relative.transform.translation, truth.translation, epsilon = 1e-6);
        assert!(relative.error < 1e-6);
    }

    #[test]
    fn test_too_few_edge_frames() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections_for_frames(&rig.frames[..1]);
        let exclusions = ExclusionSet::new();
        let graph = build_covisibility_graph(&store, &rig.board, &exclusions, 6);

        let err = estimate_relative_pose(
            &store,
            &rig.board,
            &graph,
            &exclusions,
            0,
            &rig.cameras[0].model,
            1,
            &rig.cameras[1].model,
            &ExtrinsicConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CalibrationError::InsufficientEdgeFrames {
                parent: "cam0".to_string(),
                child: "cam1".to_string(),
                available: 1,
                required: 2,
            }
        );
    }
}
