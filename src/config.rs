//! Calibration configuration, loaded from YAML.
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub intrinsic: IntrinsicConfig,
    pub extrinsic: ExtrinsicConfig,
    pub triangulation: TriangulationConfig,
    pub bundle_adjustment: BundleAdjustmentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicConfig {
    /// Minimum in-board corners for a frame to be usable.
    pub min_corners: usize,
    /// Minimum frames left after exclusions.
    pub min_frames: usize,
    /// Horizontal field of view used to seed the focal length.
    pub assumed_fov_deg: f64,
    pub max_iterations: usize,
}

impl Default for IntrinsicConfig {
    fn default() -> Self {
        IntrinsicConfig {
            min_corners: 6,
            min_frames: 3,
            assumed_fov_deg: 60.0,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrinsicConfig {
    /// Minimum common corner ids for a frame to join a covisibility edge.
    pub min_common_corners: usize,
    /// Minimum corners for single-frame pose estimation.
    pub min_pose_corners: usize,
    /// Minimum covisible frames for a relative pose.
    pub min_edge_frames: usize,
    /// Reference camera name; the first camera when unset.
    pub reference_camera: Option<String>,
    pub max_iterations: usize,
}

impl Default for ExtrinsicConfig {
    fn default() -> Self {
        ExtrinsicConfig {
            min_common_corners: 6,
            min_pose_corners: 6,
            min_edge_frames: 2,
            reference_camera: None,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Largest angle between contributing rays must exceed this.
    pub min_parallax_deg: f64,
    /// Ratio of largest to smallest singular value of the DLT system.
    pub max_condition: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        TriangulationConfig {
            min_parallax_deg: 0.5,
            max_condition: 1e12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    #[default]
    None,
    Huber,
    Cauchy,
}

impl std::str::FromStr for LossKind {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "linear" => Ok(LossKind::None),
            "huber" => Ok(LossKind::Huber),
            "cauchy" => Ok(LossKind::Cauchy),
            other => Err(CalibrationError::MalformedInput(format!(
                "unknown loss '{other}', expected none, huber or cauchy"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    pub max_iterations: usize,
    pub cost_tolerance: f64,
    pub parameter_tolerance: f64,
    pub gradient_tolerance: f64,
    pub loss: LossKind,
    pub loss_scale: f64,
    pub optimize_extrinsics: bool,
    pub optimize_points: bool,
    pub optimize_intrinsics: bool,
    /// Observations with an initial residual norm above this (pixels) are
    /// dropped. `0` disables the filter.
    pub outlier_threshold: f64,
    /// Camera whose pose is held fixed.
    pub reference_camera: usize,
    pub exclude_frames: Vec<u32>,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        BundleAdjustmentConfig {
            max_iterations: 100,
            cost_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            loss: LossKind::None,
            loss_scale: 1.0,
            optimize_extrinsics: true,
            optimize_points: true,
            optimize_intrinsics: true,
            outlier_threshold: 0.0,
            reference_camera: 0,
            exclude_frames: Vec::new(),
        }
    }
}

impl BundleAdjustmentConfig {
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.max_iterations == 0 {
            return Err(CalibrationError::MalformedInput(
                "bundle adjustment needs at least one iteration".to_string(),
            ));
        }
        for (name, value) in [
            ("cost_tolerance", self.cost_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
            ("outlier_threshold", self.outlier_threshold),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(CalibrationError::MalformedInput(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.loss != LossKind::None && !(self.loss_scale.is_finite() && self.loss_scale > 0.0) {
            return Err(CalibrationError::MalformedInput(format!(
                "loss scale must be positive, got {}",
                self.loss_scale
            )));
        }
        Ok(())
    }
}

impl CalibrationConfig {
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path)?;
        let config: CalibrationConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        let intrinsic = &self.intrinsic;
        if intrinsic.min_corners < 4 {
            return Err(CalibrationError::MalformedInput(format!(
                "intrinsic.min_corners must be at least 4, got {}",
                intrinsic.min_corners
            )));
        }
        if intrinsic.min_frames == 0 || intrinsic.max_iterations == 0 {
            return Err(CalibrationError::MalformedInput(
                "intrinsic.min_frames and intrinsic.max_iterations must be positive".to_string(),
            ));
        }
        if !(intrinsic.assumed_fov_deg > 0.0 && intrinsic.assumed_fov_deg < 180.0) {
            return Err(CalibrationError::MalformedInput(format!(
                "intrinsic.assumed_fov_deg must be in (0, 180), got {}",
                intrinsic.assumed_fov_deg
            )));
        }
        let extrinsic = &self.extrinsic;
        if extrinsic.min_pose_corners < 4 || extrinsic.min_common_corners == 0 {
            return Err(CalibrationError::MalformedInput(
                "extrinsic.min_pose_corners must be at least 4 and min_common_corners positive"
                    .to_string(),
            ));
        }
        if extrinsic.min_edge_frames == 0 || extrinsic.max_iterations == 0 {
            return Err(CalibrationError::MalformedInput(
                "extrinsic.min_edge_frames and extrinsic.max_iterations must be positive"
                    .to_string(),
            ));
        }
        if !(self.triangulation.min_parallax_deg >= 0.0 && self.triangulation.max_condition > 1.0) {
            return Err(CalibrationError::MalformedInput(
                "triangulation thresholds out of range".to_string(),
            ));
        }
        self.bundle_adjustment.validate()
    }
}
