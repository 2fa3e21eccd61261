//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct, a pinhole camera with the
//! five-coefficient Brown-Conrady lens distortion `[k1, k2, p1, p2, k3]` used by
//! every calibration stage. The distortion polynomial itself lives in
//! [`distort_generic`] so that the tiny-solver residuals (which run on dual
//! numbers) and the plain `f64` projection share one implementation.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// The distortion coefficients are stored in OpenCV order:
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use nalgebra::{DVector, Vector3};
/// use multicam_calib::camera::rad_tan::RadTanModel;
/// use multicam_calib::camera::{CameraModel, Resolution};
///
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0, // Intrinsics
///     0.1, -0.05, 0.001, 0.001, 0.02 // Distortion (k1, k2, p1, p2, k3)
/// ]);
/// let mut model = RadTanModel::new(&params).unwrap();
/// model.resolution = Resolution { width: 640, height: 480 };
///
/// let pixel = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
/// assert!(pixel.x > 320.0 && pixel.y > 240.0);
/// ```
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

/// Number of scalar parameters in `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
pub const RAD_TAN_PARAM_COUNT: usize = 9;

/// Apply radial/tangential distortion to normalized image coordinates.
///
/// `dist` is `[k1, k2, p1, p2, k3]`. Generic over [`RealField`] so it can be
/// evaluated on the dual numbers tiny-solver uses for automatic differentiation.
pub fn distort_generic<T: RealField>(x: T, y: T, dist: &[T; 5]) -> (T, T) {
    let [k1, k2, p1, p2, k3] = dist.clone();
    let two = T::one() + T::one();

    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;
    let xy = x.clone() * y.clone();

    let x_distorted = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let y_distorted = y.clone() * radial
        + p1 * (r2 + two.clone() * y.clone() * y)
        + two * p2 * xy;

    (x_distorted, y_distorted)
}

/// Project a camera-frame point with `intr = [fx, fy, cx, cy]` and `dist`.
///
/// No cheirality check is done here; callers that need one test `z` first.
pub fn project_generic<T: RealField>(
    intr: &[T; 4],
    dist: &[T; 5],
    point_cam: &Vector3<T>,
) -> Vector2<T> {
    let x = point_cam.x.clone() / point_cam.z.clone();
    let y = point_cam.y.clone() / point_cam.z.clone();
    let (xd, yd) = distort_generic(x, y, dist);
    Vector2::new(
        intr[0].clone() * xd + intr[2].clone(),
        intr[1].clone() * yd + intr[3].clone(),
    )
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    ///
    /// The resolution is initialized to 0x0 and should be set by the caller.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if the vector does not hold 9 values.
    /// * [`CameraModelError::FocalLengthMustBePositive`] /
    ///   [`CameraModelError::PrincipalPointMustBeFinite`] from `validate_params`.
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() != RAD_TAN_PARAM_COUNT {
            return Err(CameraModelError::InvalidParams(format!(
                "RadTan model requires {} parameters, got {}",
                RAD_TAN_PARAM_COUNT,
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            distortions: [
                parameters[4], // k1
                parameters[5], // k2
                parameters[6], // p1
                parameters[7], // p2
                parameters[8], // k3
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Builds a model from a 3x3 camera matrix. Skew is not modelled and must be zero.
    pub fn from_camera_matrix(
        camera_matrix: &Matrix3<f64>,
        distortions: [f64; 5],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let k = camera_matrix;
        if k[(0, 1)].abs() > 1e-9
            || k[(1, 0)].abs() > 1e-9
            || k[(2, 0)].abs() > 1e-9
            || k[(2, 1)].abs() > 1e-9
            || (k[(2, 2)] - 1.0).abs() > 1e-9
        {
            return Err(CameraModelError::InvalidParams(
                "camera matrix must be upper-triangular without skew and K[2][2] = 1".to_string(),
            ));
        }
        if distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: k[(0, 0)],
                fy: k[(1, 1)],
                cx: k[(0, 2)],
                cy: k[(1, 2)],
            },
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Initial guess used before calibration: principal point at the image
    /// centre, square pixels, focal length from a horizontal field of view and
    /// zero distortion.
    pub fn from_field_of_view(
        resolution: Resolution,
        horizontal_fov_deg: f64,
    ) -> Result<Self, CameraModelError> {
        validation::validate_resolution(&resolution)?;
        if !(horizontal_fov_deg > 0.0 && horizontal_fov_deg < 180.0) {
            return Err(CameraModelError::InvalidParams(format!(
                "field of view must be in (0, 180) degrees, got {horizontal_fov_deg}"
            )));
        }
        let width = resolution.width as f64;
        let height = resolution.height as f64;
        let focal = (width / 2.0) / (horizontal_fov_deg.to_radians() / 2.0).tan();
        Ok(RadTanModel {
            intrinsics: Intrinsics {
                fx: focal,
                fy: focal,
                cx: width / 2.0,
                cy: height / 2.0,
            },
            resolution,
            distortions: [0.0; 5],
        })
    }

    /// The 3x3 camera matrix `K`.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.intrinsics.fx,
            0.0,
            self.intrinsics.cx,
            0.0,
            self.intrinsics.fy,
            self.intrinsics.cy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Parameters in `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` order.
    pub fn parameters(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions[0],
            self.distortions[1],
            self.distortions[2],
            self.distortions[3],
            self.distortions[4],
        ])
    }

    /// Returns `true` when the pixel lies inside the image.
    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.resolution.width as f64
            && pixel.y < self.resolution.height as f64
    }

    /// Removes lens distortion from a pixel, returning normalized coordinates
    /// `(x/z, y/z)`.
    ///
    /// Newton iterations on the distortion function starting at the distorted
    /// point.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the Jacobian becomes singular or
    /// the iteration does not converge.
    pub fn undistort(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        let target = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        if self.distortions.iter().all(|d| *d == 0.0) {
            return Ok(target);
        }

        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 100;

        let mut point = target;
        for _ in 0..MAX_ITERATIONS {
            let (x, y) = (point.x, point.y);
            let (xd, yd) = distort_generic(x, y, &self.distortions);
            let error = Vector2::new(xd, yd) - target;
            if error.norm() < EPS {
                return Ok(point);
            }

            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            // d(radial)/d(r2)
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);
            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("undistortion Jacobian is singular".to_string())
            })?;
            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "undistortion did not converge after {MAX_ITERATIONS} iterations"
        )))
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?} resolution: {}x{}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
            self.resolution.width,
            self.resolution.height,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates, applying distortion.
    ///
    /// Points outside the image are still projected; reprojection errors of
    /// corners near the border must stay measurable.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointBehindCamera`]: the point has negative depth.
    /// * [`CameraModelError::PointAtCameraCenter`]: the depth is too close to zero.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z <= -f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointBehindCamera(point_3d.z));
        }
        // If z is very small, the point is at the camera center
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let intr = [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
        ];
        Ok(project_generic(&intr, &self.distortions, point_3d))
    }

    /// Unprojects a distorted pixel to a unit-length ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let normalized = self.undistort(point_2d)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "RadTan distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    /// The coefficients are returned in the order: `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            resolution: Resolution {
                width: 752,
                height: 480,
            },
            distortions: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0],
        }
    }

    #[test]
    fn test_radtan_new_requires_nine_parameters() {
        let params = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0]);
        assert!(matches!(
            RadTanModel::new(&params),
            Err(CameraModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = sample_model();

        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        assert!(model.contains(&point_2d));

        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(norm_3d, ray, epsilon = 1e-9);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();
        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, 0.0, 1.0),
            Vector3::new(-0.5, 0.0, 1.0),
            Vector3::new(0.0, 0.4, 1.0),
            Vector3::new(0.3, 0.4, 1.0),
            Vector3::new(-0.3, -0.4, 1.0),
            Vector3::new(0.1, 0.1, 2.0),
        ];

        for (i, original_point) in test_points.iter().enumerate() {
            let pixel = model.project(original_point).unwrap();
            let ray = model.unproject(&pixel).unwrap();
            let dot_product = original_point.normalize().dot(&ray);
            assert!(
                dot_product > 1.0 - 1e-9,
                "Test point {i}: direction mismatch, dot product {dot_product}"
            );
        }
    }

    #[test]
    fn test_radtan_project_rejects_points_behind_camera() {
        let model = sample_model();
        assert!(matches!(
            model.project(&Vector3::new(0.1, 0.1, -1.0)),
            Err(CameraModelError::PointBehindCamera(_))
        ));
        assert_eq!(
            model.project(&Vector3::new(0.1, 0.1, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        );
    }

    #[test]
    fn test_radtan_r6_term_uses_sixth_power() {
        let model = RadTanModel {
            distortions: [0.0, 0.0, 0.0, 0.0, 0.5],
            ..sample_model()
        };
        let pixel = model.project(&Vector3::new(0.5, 0.0, 1.0)).unwrap();
        // r2 = 0.25, radial = 1 + 0.5 * 0.25^3
        let expected = model.intrinsics.fx * 0.5 * (1.0 + 0.5 * 0.25f64.powi(3)) + model.intrinsics.cx;
        assert_relative_eq!(pixel.x, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_field_of_view_seed() {
        let model = RadTanModel::from_field_of_view(
            Resolution {
                width: 1280,
                height: 720,
            },
            60.0,
        )
        .unwrap();
        assert_relative_eq!(model.intrinsics.fx, 640.0 / 30f64.to_radians().tan(), epsilon = 1e-9);
        assert_eq!(model.intrinsics.fx, model.intrinsics.fy);
        assert_eq!(model.intrinsics.cx, 640.0);
        assert_eq!(model.intrinsics.cy, 360.0);
        assert_eq!(model.distortions, [0.0; 5]);
    }

    #[test]
    fn test_camera_matrix_round_trip() {
        let model = sample_model();
        let k = model.camera_matrix();
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(k[(1, 0)], 0.0);
        assert_eq!(k[(2, 0)], 0.0);
        assert_eq!(k[(2, 1)], 0.0);

        let rebuilt = RadTanModel::from_camera_matrix(&k, model.distortions, model.resolution).unwrap();
        assert_eq!(rebuilt, model);
    }

    #[test]
    fn test_from_camera_matrix_rejects_skew() {
        let mut k = sample_model().camera_matrix();
        k[(0, 1)] = 0.5;
        assert!(RadTanModel::from_camera_matrix(&k, [0.0; 5], sample_model().resolution).is_err());
    }
}
