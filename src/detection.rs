//! Detection store: per camera, per frame corner observations produced by an
//! external target detector.
//!
//! The store is pure data. Absence of an entry for `(camera, frame)` means
//! "no detection", which is different from a detection with zero corners.

use crate::camera::Resolution;
use crate::error::CalibrationError;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// One detected target corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerObservation {
    pub id: u32,
    pub pixel: Vector2<f64>,
}

impl CornerObservation {
    pub fn new(id: u32, x: f64, y: f64) -> Self {
        CornerObservation {
            id,
            pixel: Vector2::new(x, y),
        }
    }
}

/// Corners seen by one camera in one frame, sorted by id, without duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    corners: Vec<CornerObservation>,
}

impl Detection {
    pub fn new(mut corners: Vec<CornerObservation>) -> Result<Self, CalibrationError> {
        corners.sort_by_key(|c| c.id);
        if let Some(pair) = corners.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(CalibrationError::MalformedInput(format!(
                "duplicate corner id {} in detection",
                pair[0].id
            )));
        }
        if let Some(c) = corners
            .iter()
            .find(|c| !c.pixel.x.is_finite() || !c.pixel.y.is_finite())
        {
            return Err(CalibrationError::MalformedInput(format!(
                "corner id {} has non-finite coordinates",
                c.id
            )));
        }
        Ok(Detection { corners })
    }

    pub fn corners(&self) -> &[CornerObservation] {
        &self.corners
    }

    pub fn len(&self) -> usize {
        self.corners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<u32> {
        self.corners.iter().map(|c| c.id).collect()
    }

    pub fn pixel(&self, id: u32) -> Option<Vector2<f64>> {
        self.corners
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| self.corners[i].pixel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub name: String,
    pub resolution: Resolution,
}

/// All detections, indexed by camera position and frame index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionStore {
    cameras: Vec<CameraInfo>,
    detections: Vec<BTreeMap<u32, Detection>>,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a camera and returns its index.
    pub fn add_camera(
        &mut self,
        name: impl Into<String>,
        resolution: Resolution,
    ) -> Result<usize, CalibrationError> {
        let name = name.into();
        if self.camera_index(&name).is_some() {
            return Err(CalibrationError::MalformedInput(format!(
                "camera '{name}' registered twice"
            )));
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CalibrationError::MalformedInput(format!(
                "camera '{name}' has an empty resolution"
            )));
        }
        self.cameras.push(CameraInfo { name, resolution });
        self.detections.push(BTreeMap::new());
        Ok(self.cameras.len() - 1)
    }

    pub fn insert(
        &mut self,
        camera: usize,
        frame: u32,
        detection: Detection,
    ) -> Result<(), CalibrationError> {
        let per_camera = self.detections.get_mut(camera).ok_or_else(|| {
            CalibrationError::MalformedInput(format!("camera index {camera} out of range"))
        })?;
        if per_camera.insert(frame, detection).is_some() {
            return Err(CalibrationError::MalformedInput(format!(
                "camera '{}' has two detections for frame {frame}",
                self.cameras[camera].name
            )));
        }
        Ok(())
    }

    pub fn get(&self, camera: usize, frame: u32) -> Option<&Detection> {
        self.detections.get(camera)?.get(&frame)
    }

    pub fn camera_detections(&self, camera: usize) -> Option<&BTreeMap<u32, Detection>> {
        self.detections.get(camera)
    }

    pub fn cameras(&self) -> &[CameraInfo] {
        &self.cameras
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn camera(&self, index: usize) -> Option<&CameraInfo> {
        self.cameras.get(index)
    }

    pub fn camera_name(&self, index: usize) -> String {
        self.cameras
            .get(index)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("#{index}"))
    }

    pub fn camera_index(&self, name: &str) -> Option<usize> {
        self.cameras.iter().position(|c| c.name == name)
    }

    /// Sorted union of all frame indices with at least one detection.
    pub fn frames(&self) -> Vec<u32> {
        let frames: BTreeSet<u32> = self
            .detections
            .iter()
            .flat_map(|per_camera| per_camera.keys().copied())
            .collect();
        frames.into_iter().collect()
    }

    pub fn from_json_str(json: &str) -> Result<Self, CalibrationError> {
        let file: DetectionFile = serde_json::from_str(json)?;
        DetectionStore::try_from(file)
    }

    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(&DetectionFile::from(self))?)
    }
}

/// Detector interchange format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionFile {
    pub cameras: Vec<CameraEntry>,
    pub detections: Vec<DetectionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEntry {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEntry {
    pub camera: String,
    pub frame: u32,
    pub corners: Vec<CornerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerEntry {
    pub id: u32,
    pub x: f64,
    pub y: f64,
}

impl TryFrom<DetectionFile> for DetectionStore {
    type Error = CalibrationError;

    fn try_from(file: DetectionFile) -> Result<Self, Self::Error> {
        let mut store = DetectionStore::new();
        for camera in file.cameras {
            store.add_camera(
                camera.name,
                Resolution {
                    width: camera.width,
                    height: camera.height,
                },
            )?;
        }
        for entry in file.detections {
            let camera = store.camera_index(&entry.camera).ok_or_else(|| {
                CalibrationError::MalformedInput(format!(
                    "detection for frame {} names unknown camera '{}'",
                    entry.frame, entry.camera
                ))
            })?;
            let corners = entry
                .corners
                .iter()
                .map(|c| CornerObservation::new(c.id, c.x, c.y))
                .collect();
            let detection = Detection::new(corners).map_err(|e| {
                CalibrationError::MalformedInput(format!(
                    "camera '{}', frame {}: {e}",
                    entry.camera, entry.frame
                ))
            })?;
            store.insert(camera, entry.frame, detection)?;
        }
        Ok(store)
    }
}

impl From<&DetectionStore> for DetectionFile {
    fn from(store: &DetectionStore) -> Self {
        let cameras = store
            .cameras
            .iter()
            .map(|c| CameraEntry {
                name: c.name.clone(),
                width: c.resolution.width,
                height: c.resolution.height,
            })
            .collect();
        let detections = store
            .detections
            .iter()
            .enumerate()
            .flat_map(|(camera, per_camera)| {
                per_camera.iter().map(move |(frame, detection)| DetectionEntry {
                    camera: store.cameras[camera].name.clone(),
                    frame: *frame,
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
            .collect();
        DetectionFile {
            cameras,
            detections,
        }
    }
}
