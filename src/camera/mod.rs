//! Camera model types shared by every calibration stage.
//!
//! The calibration core supports a single lens model, the pinhole camera with
//! five-coefficient radial/tangential distortion ([`RadTanModel`]). The
//! [`CameraModel`] trait is kept as the seam between the numerical stages and
//! the concrete model.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod rad_tan;

pub use rad_tan::RadTanModel;

/// Pinhole intrinsic parameters in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Point is behind the camera (z = {0})")]
    PointBehindCamera(f64),
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Resolution must be non-zero")]
    InvalidResolution,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to pixel coordinates.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0)
            || !intrinsics.fx.is_finite()
            || !intrinsics.fy.is_finite()
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_resolution(resolution: &Resolution) -> Result<(), CameraModelError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CameraModelError::InvalidResolution);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_intrinsics_rejects_bad_focal() {
        let intrinsics = Intrinsics {
            fx: 0.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        };
        assert_eq!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::FocalLengthMustBePositive)
        );

        let nan_focal = Intrinsics {
            fx: f64::NAN,
            ..intrinsics
        };
        assert!(validation::validate_intrinsics(&nan_focal).is_err());
    }

    #[test]
    fn test_validate_intrinsics_rejects_non_finite_principal_point() {
        let intrinsics = Intrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: f64::INFINITY,
            cy: 240.0,
        };
        assert_eq!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        );
    }

    #[test]
    fn test_validate_resolution() {
        assert!(validation::validate_resolution(&Resolution {
            width: 640,
            height: 480
        })
        .is_ok());
        assert_eq!(
            validation::validate_resolution(&Resolution {
                width: 0,
                height: 480
            }),
            Err(CameraModelError::InvalidResolution)
        );
    }
}
