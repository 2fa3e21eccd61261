//! Output formats: the per-camera calibration record consumed by downstream
//! tools and the full diagnostic record consumed by bundle adjustment.

use crate::board::BoardModel;
use crate::calibration::chain::ExtrinsicPose;
use crate::calibration::intrinsic::IntrinsicParameters;
use crate::calibration::triangulation::TriangulatedPoint;
use crate::camera::Resolution;
use crate::detection::{CornerEntry, DetectionStore};
use crate::error::CalibrationError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Decimal places of the camera matrix and rotation.
pub const MATRIX_DECIMALS: i32 = 6;
pub const DISTORTION_DECIMALS: i32 = 10;
pub const TRANSLATION_DECIMALS: i32 = 6;

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// One camera of the exported calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub name: String,
    /// `[width, height]`
    pub size: [u32; 2],
    /// Row-major camera matrix.
    pub matrix: [[f64; 3]; 3],
    pub distortions: [f64; 5],
    /// Axis-angle, reference to camera.
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
}

impl CalibrationRecord {
    /// Builds a record with every value rounded to its exported precision.
    pub fn new(name: impl Into<String>, intrinsics: &IntrinsicParameters, extrinsics: &ExtrinsicPose) -> Self {
        let k = &intrinsics.camera_matrix;
        let matrix = [0, 1, 2].map(|r| [0, 1, 2].map(|c| round_to(k[(r, c)], MATRIX_DECIMALS)));
        CalibrationRecord {
            name: name.into(),
            size: [intrinsics.resolution.width, intrinsics.resolution.height],
            matrix,
            distortions: intrinsics
                .distortion
                .map(|d| round_to(d, DISTORTION_DECIMALS)),
            rotation: [0, 1, 2].map(|i| round_to(extrinsics.rvec[i], MATRIX_DECIMALS)),
            translation: [0, 1, 2].map(|i| round_to(extrinsics.translation[i], TRANSLATION_DECIMALS)),
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.size[0],
            height: self.size[1],
        }
    }
}

pub fn write_calibration_records(records: &[CalibrationRecord]) -> Result<String, CalibrationError> {
    Ok(serde_json::to_string_pretty(records)?)
}

pub fn parse_calibration_records(json: &str) -> Result<Vec<CalibrationRecord>, CalibrationError> {
    Ok(serde_json::from_str(json)?)
}

pub fn save_calibration_records(
    path: impl AsRef<Path>,
    records: &[CalibrationRecord],
) -> Result<(), CalibrationError> {
    std::fs::write(path, write_calibration_records(records)?)?;
    Ok(())
}

pub fn load_calibration_records(path: impl AsRef<Path>) -> Result<Vec<CalibrationRecord>, CalibrationError> {
    parse_calibration_records(&std::fs::read_to_string(path)?)
}

/// Calibration results of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDiagnostics {
    pub name: String,
    pub resolution: Resolution,
    pub intrinsics: Option<IntrinsicParameters>,
    pub extrinsics: Option<ExtrinsicPose>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraObservations {
    pub camera: usize,
    pub corners: Vec<CornerEntry>,
}

/// Every camera's observations in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameObservations {
    pub frame: u32,
    pub cameras: Vec<CameraObservations>,
}

/// Everything known after triangulation. This is the input of bundle
/// adjustment and round-trips through JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Version of the calibration state the record was taken from.
    pub version: u64,
    pub board: BoardModel,
    pub reference_camera: usize,
    pub cameras: Vec<CameraDiagnostics>,
    pub frames: Vec<FrameObservations>,
    pub points: Vec<TriangulatedPoint>,
    /// Human-readable failures of every stage.
    pub failures: Vec<String>,
}

impl DiagnosticRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u64,
        store: &DetectionStore,
        board: &BoardModel,
        reference_camera: usize,
        intrinsics: &[Option<IntrinsicParameters>],
        extrinsics: &BTreeMap<usize, ExtrinsicPose>,
        points: &[TriangulatedPoint],
        failures: &[CalibrationError],
    ) -> Self {
        let cameras = store
            .cameras()
            .iter()
            .enumerate()
            .map(|(index, info)| CameraDiagnostics {
                name: info.name.clone(),
                resolution: info.resolution,
                intrinsics: intrinsics.get(index).cloned().flatten(),
                extrinsics: extrinsics.get(&index).copied(),
            })
            .collect();

        let frames = store
            .frames()
            .into_iter()
            .map(|frame| FrameObservations {
                frame,
                cameras: (0..store.camera_count())
                    .filter_map(|camera| {
                        let detection = store.get(camera, frame)?;
                        Some(CameraObservations {
                            camera,
                            corners: detection
                                .corners()
                                .iter()
                                .map(|c| CornerEntry {
                                    id: c.id,
                                    x: c.pixel.x,
                                    y: c.pixel.y,
                                })
                                .collect(),
                        })
                    })
                    .collect(),
            })
            .collect();

        DiagnosticRecord {
            version,
            board: board.clone(),
            reference_camera,
            cameras,
            frames,
            points: points.to_vec(),
            failures: failures.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Observed pixel of `corner_id` by `camera` in `frame`.
    pub fn observation(&self, frame: u32, camera: usize, corner_id: u32) -> Option<[f64; 2]> {
        let frame = self
            .frames
            .binary_search_by_key(&frame, |f| f.frame)
            .ok()
            .map(|i| &self.frames[i])?;
        let corners = &frame.cameras.iter().find(|c| c.camera == camera)?.corners;
        corners
            .binary_search_by_key(&corner_id, |c| c.id)
            .ok()
            .map(|i| [corners[i].x, corners[i].y])
    }

    pub fn to_json_string(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, CalibrationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn intrinsics() -> IntrinsicParameters {
        IntrinsicParameters {
            camera_matrix: Matrix3::new(
                1100.123456789,
                0.0,
                645.987654321,
                0.0,
                1095.000000449,
                355.5,
                0.0,
                0.0,
                1.0,
            ),
            distortion: [-0.051234567891234, 0.0123456789012, 0.00051, -0.0003, 1e-12],
            rms_error: 0.12,
            frame_poses: Vec::new(),
            all_frame_errors: Vec::new(),
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
        }
    }

    #[test]
    fn test_record_round_trip_within_precision() {
        let params = intrinsics();
        let extrinsics = ExtrinsicPose::from_transform(
            &crate::geometry::RigidTransform::from_axis_angle(
                &Vector3::new(0.01234567, -0.2000004, 0.0),
                Vector3::new(0.4000001234, -0.00000049, 0.0123455),
            ),
            0.001,
        );
        let record = CalibrationRecord::new("cam0", &params, &extrinsics);
        let json = write_calibration_records(std::slice::from_ref(&record)).unwrap();
        let parsed = parse_calibration_records(&json).unwrap();
        assert_eq!(parsed, vec![record]);

        let parsed = &parsed[0];
        assert_eq!(parsed.name, "cam0");
        assert_eq!(parsed.size, [1280, 720]);
        for r in 0..3 {
            for c in 0..3 {
                assert!((parsed.matrix[r][c] - params.camera_matrix[(r, c)]).abs() <= 5e-7);
            }
        }
        for (parsed, original) in parsed.distortions.iter().zip(params.distortion.iter()) {
            assert!((parsed - original).abs() <= 5e-11);
        }
        for i in 0..3 {
            assert!((parsed.rotation[i] - extrinsics.rvec[i]).abs() <= 5e-7);
            assert!((parsed.translation[i] - extrinsics.translation[i]).abs() <= 5e-7);
        }
        assert_eq!(parsed.matrix[2], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_field_names_are_stable() {
        let record = CalibrationRecord::new("left", &intrinsics(), &ExtrinsicPose::identity());
        let value: serde_json::Value =
            serde_json::from_str(&write_calibration_records(&[record]).unwrap()).unwrap();
        let object = value[0].as_object().unwrap();
        for key in ["name", "size", "matrix", "distortions", "rotation", "translation"] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(value[0]["matrix"][0][0], serde_json::json!(1100.123457));
        assert_eq!(value[0]["distortions"][4], serde_json::json!(0.0));
    }

    #[test]
    fn test_diagnostic_record_round_trip() {
        let rig = crate::test_utils::SyntheticRig::four_cameras();
        let store = rig.detections();
        let mut extrinsics = BTreeMap::new();
        extrinsics.insert(0, ExtrinsicPose::identity());
        let record = DiagnosticRecord::new(
            3,
            &store,
            &rig.board,
            0,
            &[Some(intrinsics()), None, None, None],
            &extrinsics,
            &[],
            &[CalibrationError::MalformedInput("example".to_string())],
        );
        assert_eq!(record.cameras.len(), 4);
        assert_eq!(record.frames.len(), rig.frames.len());

        let pixel = store.get(1, rig.frames[1]).unwrap().pixel(5).unwrap();
        assert_eq!(record.observation(rig.frames[1], 1, 5), Some([pixel.x, pixel.y]));
        assert_eq!(record.observation(99, 1, 5), None);

        let parsed = DiagnosticRecord::from_json_str(&record.to_json_string().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
