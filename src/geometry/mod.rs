//! Rigid-body and projective geometry helpers shared by the calibration stages.
//!
//! Everything here works on `nalgebra` types. The two rotation helpers at the
//! bottom are generic over [`RealField`] so the tiny-solver residuals can use
//! them on dual numbers.

use crate::error::CalibrationError;
use nalgebra::{DMatrix, Matrix3, RealField, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid transform `X_dst = R * X_src + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl RigidTransform {
    pub fn identity() -> Self {
        RigidTransform {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        RigidTransform {
            rotation,
            translation,
        }
    }

    pub fn from_axis_angle(rvec: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        RigidTransform {
            rotation: axis_angle_to_matrix(rvec),
            translation,
        }
    }

    /// Rotation as an axis-angle vector (axis scaled by angle in radians).
    pub fn axis_angle(&self) -> Vector3<f64> {
        matrix_to_axis_angle(&self.rotation)
    }

    pub fn inverse(&self) -> Self {
        let rotation_t = self.rotation.transpose();
        RigidTransform {
            rotation: rotation_t,
            translation: -(rotation_t * self.translation),
        }
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &RigidTransform) -> Self {
        RigidTransform {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Camera centre in the source frame, `-Rᵀ t`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    pub fn is_finite(&self) -> bool {
        self.rotation.iter().all(|v| v.is_finite()) && self.translation.iter().all(|v| v.is_finite())
    }
}

/// Rodrigues' formula, axis-angle vector to rotation matrix.
pub fn axis_angle_to_matrix(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*rvec).into_inner()
}

/// Rotation matrix to axis-angle vector. The input is re-orthonormalized first.
pub fn matrix_to_axis_angle(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix_unchecked(orthonormalize(rotation)).scaled_axis()
}

/// Nearest rotation matrix in the Frobenius sense (polar decomposition via SVD).
pub fn orthonormalize(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return *m;
    };
    let rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        u_flipped * v_t
    } else {
        rotation
    }
}

/// Angle in degrees between two rays.
pub fn ray_angle_deg(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let denom = a.norm() * b.norm();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (a.dot(b) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Hartley normalization: zero mean, mean distance `sqrt(2)`.
///
/// Returns the normalized points and the similarity `T` with `p_n = T p`.
fn normalize_points_2d(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let transform = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Some((normalized, transform))
}

/// Right singular vector of `a` with the smallest singular value.
///
/// Wide systems are zero-padded to square so the null-space vector is present.
pub fn smallest_singular_vector(a: DMatrix<f64>) -> Result<(nalgebra::DVector<f64>, f64, f64), CalibrationError> {
    let cols = a.ncols();
    let a = if a.nrows() < cols {
        let mut padded = DMatrix::<f64>::zeros(cols, cols);
        padded.view_mut((0, 0), (a.nrows(), cols)).copy_from(&a);
        padded
    } else {
        a
    };

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CalibrationError::NumericalFailure("SVD did not produce Vᵀ".to_string()))?;
    let values = &svd.singular_values;
    let (min_idx, min_value) = values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(bi, bv), (i, &v)| if v < bv { (i, v) } else { (bi, bv) });
    let max_value = values.iter().cloned().fold(0.0, f64::max);
    Ok((v_t.row(min_idx).transpose(), min_value, max_value))
}

/// Plane-to-image homography by normalized DLT, `image ~ H * [x, y, 1]`.
///
/// Needs at least four correspondences. The result is scaled so `H[2][2] = 1`
/// when that entry is not zero.
pub fn estimate_homography(
    plane: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CalibrationError> {
    let n = plane.len();
    if n < 4 || image.len() != n {
        return Err(CalibrationError::MalformedInput(format!(
            "homography needs at least 4 matched points, got {} and {}",
            n,
            image.len()
        )));
    }
    let degenerate =
        || CalibrationError::NumericalFailure("degenerate point configuration for homography".to_string());
    let (plane_n, t_plane) = normalize_points_2d(plane).ok_or_else(degenerate)?;
    let (image_n, t_image) = normalize_points_2d(image).ok_or_else(degenerate)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (p, q)) in plane_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let (h, _, _) = smallest_singular_vector(a)?;
    let h_normalized = Matrix3::from_row_slice(h.as_slice());
    let t_image_inv = t_image.try_inverse().ok_or_else(degenerate)?;
    let mut homography = t_image_inv * h_normalized * t_plane;

    let scale = homography[(2, 2)];
    if scale.abs() > f64::EPSILON {
        homography /= scale;
    }
    if homography.iter().any(|v| !v.is_finite()) {
        return Err(degenerate());
    }
    Ok(homography)
}

/// Pose of a `z = 0` plane in the camera frame from `H ~ K [r1 r2 t]`.
///
/// The sign is chosen so the plane origin lies in front of the camera.
pub fn planar_pose_from_homography(
    camera_matrix: &Matrix3<f64>,
    homography: &Matrix3<f64>,
) -> Result<RigidTransform, CalibrationError> {
    let k_inv = camera_matrix.try_inverse().ok_or_else(|| {
        CalibrationError::NumericalFailure("camera matrix is not invertible".to_string())
    })?;
    let h1 = k_inv * homography.column(0);
    let h2 = k_inv * homography.column(1);
    let h3 = k_inv * homography.column(2);

    let mean_norm = (h1.norm() + h2.norm()) * 0.5;
    if mean_norm <= f64::EPSILON {
        return Err(CalibrationError::NumericalFailure(
            "homography columns vanish".to_string(),
        ));
    }
    let mut lambda = 1.0 / mean_norm;
    if (lambda * h3).z < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]));
    let pose = RigidTransform::new(rotation, h3 * lambda);
    if !pose.is_finite() {
        return Err(CalibrationError::NumericalFailure(
            "planar pose is not finite".to_string(),
        ));
    }
    Ok(pose)
}

/// Rotate `point` by an axis-angle vector. Generic for automatic differentiation.
///
/// Falls back to the first-order form `p + ω × p` near zero angle, where the
/// square root in the exact formula has an unbounded derivative.
pub fn rotate_axis_angle<T: RealField>(rvec: &Vector3<T>, point: &Vector3<T>) -> Vector3<T> {
    let theta2 = rvec.dot(rvec);
    if theta2 > T::from_f64(1e-16).unwrap() {
        let theta = theta2.sqrt();
        let axis = rvec.unscale(theta.clone());
        let cos = theta.clone().cos();
        let sin = theta.sin();
        let k_dot_p = axis.dot(point);
        point.scale(cos.clone())
            + axis.cross(point).scale(sin)
            + axis.scale(k_dot_p * (T::one() - cos))
    } else {
        point + rvec.cross(point)
    }
}

/// Rotate `point` by a quaternion `[w, x, y, z]`, normalized on the fly.
pub fn rotate_quaternion<T: RealField>(quaternion: &[T; 4], point: &Vector3<T>) -> Vector3<T> {
    let [w, x, y, z] = quaternion.clone();
    let norm = (w.clone() * w.clone() + x.clone() * x.clone() + y.clone() * y.clone() + z.clone() * z.clone()).sqrt();
    let w = w / norm.clone();
    let u = Vector3::new(x / norm.clone(), y / norm.clone(), z / norm);
    let two = T::one() + T::one();
    // v' = v + 2w (u × v) + 2 u × (u × v)
    let uv = u.cross(point);
    let uuv = u.cross(&uv);
    point + uv.scale(two.clone() * w) + uuv.scale(two)
}
