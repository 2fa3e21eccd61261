//! Multi-Camera Calibration Library
//!
//! Calibrates a rig of pinhole cameras with radial-tangential distortion from
//! ChArUco board detections. The pipeline runs in stages:
//! - Intrinsic calibration of every camera
//! - Extrinsic chaining over the covisibility graph from a reference camera
//! - Triangulation of the board corners
//! - Optional bundle adjustment of cameras and points
//!
//! Stages are driven through [`pipeline::CalibrationSession`], which keeps an
//! immutable, versioned [`pipeline::CalibrationState`]. The nonlinear problems
//! are solved with the tiny-solver optimization framework.

pub mod board;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod exclusion;
pub mod export;
pub mod geometry;
pub mod optimization;
pub mod pipeline;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use board::BoardModel;
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use config::CalibrationConfig;
pub use detection::{CornerObservation, Detection, DetectionStore};
pub use error::CalibrationError;
pub use exclusion::ExclusionSet;
pub use export::{CalibrationRecord, DiagnosticRecord};
pub use optimization::{BundleSolver, LevenbergMarquardtSolver, Optimizer};
pub use pipeline::{CalibrationEvent, CalibrationSession, CalibrationState, Stage};
