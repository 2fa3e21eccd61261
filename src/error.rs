//! Crate-level error type.

use crate::camera::CameraModelError;

/// Failures surfaced by the calibration stages.
///
/// Every variant names the camera, edge, frame or point it concerns so a
/// caller can display it without further context.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("camera '{camera}': {available} usable frame(s), at least {required} required")]
    InsufficientFrames {
        camera: String,
        available: usize,
        required: usize,
    },
    #[error("edge '{parent}' -> '{child}': {available} covisible frame(s) with valid poses, at least {required} required")]
    InsufficientEdgeFrames {
        parent: String,
        child: String,
        available: usize,
        required: usize,
    },
    #[error("camera '{camera}' is unreachable from the reference: {reason}")]
    UnreachableCamera { camera: String, reason: String },
    #[error("frame {frame}, corner {corner_id}: degenerate geometry ({reason})")]
    DegenerateGeometry {
        frame: u32,
        corner_id: u32,
        reason: String,
    },
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    #[error("Numerical failure: {0}")]
    NumericalFailure(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}
