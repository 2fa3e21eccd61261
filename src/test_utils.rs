//! Noise-free synthetic rig: a ChArUco board seen by four cameras.

use crate::board::BoardModel;
use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::detection::{CornerObservation, Detection, DetectionStore};
use crate::geometry::RigidTransform;
use nalgebra::Vector3;

pub struct SyntheticCamera {
    pub name: String,
    pub model: RadTanModel,
    /// Reference-to-camera transform.
    pub extrinsic: RigidTransform,
}

pub struct SyntheticRig {
    pub board: BoardModel,
    pub cameras: Vec<SyntheticCamera>,
    pub frames: Vec<u32>,
    /// Board-to-reference transform per frame, aligned with `frames`.
    pub board_poses: Vec<RigidTransform>,
}

fn camera(
    name: &str,
    intrinsics: [f64; 4],
    distortions: [f64; 5],
    rvec: Vector3<f64>,
    center: Vector3<f64>,
) -> SyntheticCamera {
    let rotation = RigidTransform::from_axis_angle(&rvec, Vector3::zeros()).rotation;
    SyntheticCamera {
        name: name.to_string(),
        model: RadTanModel {
            intrinsics: Intrinsics {
                fx: intrinsics[0],
                fy: intrinsics[1],
                cx: intrinsics[2],
                cy: intrinsics[3],
            },
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            distortions,
        },
        extrinsic: RigidTransform::new(rotation, -(rotation * center)),
    }
}

impl SyntheticRig {
    pub fn four_cameras() -> Self {
        let board = BoardModel::new(9, 7, 0.05, 0.037, "DICT_5X5_100").unwrap();
        let cameras = vec![
            camera(
                "cam0",
                [1100.0, 1095.0, 645.0, 355.0],
                [-0.05, 0.01, 0.0005, -0.0003, 0.0],
                Vector3::zeros(),
                Vector3::zeros(),
            ),
            camera(
                "cam1",
                [1080.0, 1082.0, 638.0, 362.0],
                [-0.03, 0.005, 0.0, 0.0002, 0.0],
                Vector3::new(0.0, 0.2, 0.0),
                Vector3::new(0.4, 0.0, 0.0),
            ),
            camera(
                "cam2",
                [1120.0, 1118.0, 650.0, 358.0],
                [-0.04, 0.008, -0.0004, 0.0, 0.0],
                Vector3::new(0.0, -0.2, 0.02),
                Vector3::new(-0.4, 0.05, 0.0),
            ),
            camera(
                "cam3",
                [1105.0, 1100.0, 642.0, 352.0],
                [-0.02, 0.0, 0.0003, 0.0003, 0.0],
                Vector3::new(-0.15, 0.0, 0.0),
                Vector3::new(0.0, 0.3, 0.05),
            ),
        ];

        let frames = vec![0, 1, 2, 4, 5, 7];
        let centre = Vector3::new(
            board.columns as f64 * board.square_length / 2.0,
            board.rows as f64 * board.square_length / 2.0,
            0.0,
        );
        let tilts = [
            (Vector3::new(0.3, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.5)),
            (Vector3::new(-0.3, 0.1, 0.0), Vector3::new(0.05, 0.02, 1.4)),
            (Vector3::new(0.0, 0.35, 0.1), Vector3::new(-0.05, 0.0, 1.6)),
            (Vector3::new(0.1, -0.35, -0.1), Vector3::new(0.0, -0.03, 1.5)),
            (Vector3::new(0.25, 0.25, 0.2), Vector3::new(0.03, 0.03, 1.3)),
            (Vector3::new(-0.2, -0.2, 0.3), Vector3::new(-0.02, 0.02, 1.7)),
        ];
        let board_poses = tilts
            .iter()
            .map(|(rvec, target)| {
                let pose = RigidTransform::from_axis_angle(rvec, Vector3::zeros());
                RigidTransform::new(pose.rotation, target - pose.rotation * centre)
            })
            .collect();

        SyntheticRig {
            board,
            cameras,
            frames,
            board_poses,
        }
    }

    /// Exact detection of every corner in camera `camera` for the frame at `position`.
    pub fn detection(&self, camera: usize, position: usize) -> Detection {
        let cam = &self.cameras[camera];
        let board_to_camera = cam.extrinsic.compose(&self.board_poses[position]);
        let corners = (0..self.board.corner_count())
            .filter_map(|id| {
                let point = board_to_camera.transform_point(&self.board.corner_position(id)?);
                let pixel = cam.model.project(&point).ok()?;
                cam.model
                    .contains(&pixel)
                    .then(|| CornerObservation::new(id, pixel.x, pixel.y))
            })
            .collect();
        Detection::new(corners).unwrap()
    }

    pub fn detections(&self) -> DetectionStore {
        self.detections_for_frames(&self.frames)
    }

    pub fn detections_for_frames(&self, frames: &[u32]) -> DetectionStore {
        let mut store = DetectionStore::new();
        for cam in &self.cameras {
            store.add_camera(cam.name.clone(), cam.model.resolution).unwrap();
        }
        for (position, frame) in self.frames.iter().enumerate() {
            if !frames.contains(frame) {
                continue;
            }
            for camera in 0..self.cameras.len() {
                store
                    .insert(camera, *frame, self.detection(camera, position))
                    .unwrap();
            }
        }
        store
    }

    /// Board corner `id` of the frame at `position` in the reference frame.
    pub fn corner_in_reference(&self, position: usize, id: u32) -> Vector3<f64> {
        self.board_poses[position].transform_point(&self.board.corner_position(id).unwrap())
    }
}
