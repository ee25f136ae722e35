//! Conversions between the three rotation representations used in the crate:
//! orthonormal 3x3 matrices, Rodrigues (axis-angle) vectors and unit
//! quaternions.
//!
//! All functions are pure. Matrix to quaternion conversion selects its branch
//! from the largest of `trace, R00, R11, R22` so that the divisor is never
//! close to zero.

use crate::camera::CameraModelError;
use nalgebra::{Matrix3, Quaternion, RealField, UnitQuaternion, Vector3};

/// Squared angle below which the series expansions are used; every
/// conversion compares the squared angle (or squared half-angle sine).
const SMALL_ANGLE_SQUARED: f64 = 1e-12;

/// A rotation in one of the supported representations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rotation {
    Matrix(Matrix3<f64>),
    /// Rodrigues vector: unit axis scaled by the angle in radians.
    AxisAngle(Vector3<f64>),
    /// Quaternion stored as `(w, i, j, k)`; normalized on conversion.
    Quaternion(Quaternion<f64>),
}

impl Rotation {
    pub fn to_matrix(&self) -> Matrix3<f64> {
        match self {
            Rotation::Matrix(m) => *m,
            Rotation::AxisAngle(v) => axis_angle_to_matrix(v),
            Rotation::Quaternion(q) => quaternion_to_matrix(&UnitQuaternion::from_quaternion(*q)),
        }
    }

    pub fn to_axis_angle(&self) -> Vector3<f64> {
        match self {
            Rotation::Matrix(m) => matrix_to_axis_angle(m),
            Rotation::AxisAngle(v) => *v,
            Rotation::Quaternion(q) => {
                quaternion_to_axis_angle(&UnitQuaternion::from_quaternion(*q))
            }
        }
    }

    pub fn to_quaternion(&self) -> UnitQuaternion<f64> {
        match self {
            Rotation::Matrix(m) => matrix_to_quaternion(m),
            Rotation::AxisAngle(v) => axis_angle_to_quaternion(v),
            Rotation::Quaternion(q) => UnitQuaternion::from_quaternion(*q),
        }
    }
}

/// Constructs the skew-symmetric matrix `[v]x` such that `[v]x u = v x u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Rodrigues formula `R = I + sin(t) K + (1 - cos(t)) K^2`.
pub fn axis_angle_to_matrix(rvec: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = rvec.norm_squared();
    if theta2 < SMALL_ANGLE_SQUARED {
        let k = skew(rvec);
        return Matrix3::identity() + k + 0.5 * k * k;
    }
    let theta = theta2.sqrt();
    let k = skew(&(rvec / theta));
    Matrix3::identity() + theta.sin() * k + (1.0 - theta.cos()) * k * k
}

/// Quaternion from a rotation matrix using explicit branch selection.
///
/// The branch is chosen from the largest of `trace`, `R00`, `R11`, `R22`, and
/// the result is returned with a non-negative scalar part.
pub fn matrix_to_quaternion(m: &Matrix3<f64>) -> UnitQuaternion<f64> {
    let trace = m[(0, 0)] + m[(1, 1)] + m[(2, 2)];
    let diagonal = [m[(0, 0)], m[(1, 1)], m[(2, 2)]];

    let mut branch = 3;
    let mut largest = trace;
    for (i, d) in diagonal.iter().enumerate() {
        if *d > largest {
            largest = *d;
            branch = i;
        }
    }

    let (w, x, y, z) = match branch {
        0 => {
            let s = (1.0 + m[(0, 0)] - m[(1, 1)] - m[(2, 2)]).sqrt() * 2.0;
            (
                (m[(2, 1)] - m[(1, 2)]) / s,
                0.25 * s,
                (m[(0, 1)] + m[(1, 0)]) / s,
                (m[(0, 2)] + m[(2, 0)]) / s,
            )
        }
        1 => {
            let s = (1.0 + m[(1, 1)] - m[(0, 0)] - m[(2, 2)]).sqrt() * 2.0;
            (
                (m[(0, 2)] - m[(2, 0)]) / s,
                (m[(0, 1)] + m[(1, 0)]) / s,
                0.25 * s,
                (m[(1, 2)] + m[(2, 1)]) / s,
            )
        }
        2 => {
            let s = (1.0 + m[(2, 2)] - m[(0, 0)] - m[(1, 1)]).sqrt() * 2.0;
            (
                (m[(1, 0)] - m[(0, 1)]) / s,
                (m[(0, 2)] + m[(2, 0)]) / s,
                (m[(1, 2)] + m[(2, 1)]) / s,
                0.25 * s,
            )
        }
        _ => {
            let s = (trace + 1.0).sqrt() * 2.0;
            (
                0.25 * s,
                (m[(2, 1)] - m[(1, 2)]) / s,
                (m[(0, 2)] - m[(2, 0)]) / s,
                (m[(1, 0)] - m[(0, 1)]) / s,
            )
        }
    };

    let q = if w < 0.0 {
        Quaternion::new(-w, -x, -y, -z)
    } else {
        Quaternion::new(w, x, y, z)
    };
    UnitQuaternion::from_quaternion(q)
}

pub fn quaternion_to_matrix(q: &UnitQuaternion<f64>) -> Matrix3<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

pub fn axis_angle_to_quaternion(rvec: &Vector3<f64>) -> UnitQuaternion<f64> {
    let theta2 = rvec.norm_squared();
    if theta2 < SMALL_ANGLE_SQUARED {
        let half = 0.5 * rvec;
        return UnitQuaternion::from_quaternion(Quaternion::new(1.0, half.x, half.y, half.z));
    }
    let theta = theta2.sqrt();
    let axis = rvec / theta;
    let (s, c) = (0.5 * theta).sin_cos();
    UnitQuaternion::from_quaternion(Quaternion::new(c, s * axis.x, s * axis.y, s * axis.z))
}

/// Axis-angle with the angle in `[0, pi]`.
pub fn quaternion_to_axis_angle(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (mut w, mut v) = (q.w, Vector3::new(q.i, q.j, q.k));
    if w < 0.0 {
        w = -w;
        v = -v;
    }
    if v.norm_squared() < SMALL_ANGLE_SQUARED {
        return 2.0 * v;
    }
    let sin_half = v.norm();
    let theta = 2.0 * sin_half.atan2(w);
    v * (theta / sin_half)
}

pub fn matrix_to_axis_angle(m: &Matrix3<f64>) -> Vector3<f64> {
    quaternion_to_axis_angle(&matrix_to_quaternion(m))
}

/// Projects a near-rotation onto SO(3) through its SVD.
pub fn orthonormalize(m: &Matrix3<f64>) -> Result<Matrix3<f64>, CameraModelError> {
    let svd = m.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| CameraModelError::NumericalError("SVD U missing".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| CameraModelError::NumericalError("SVD V^T missing".to_string()))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Ok(r)
}

/// Checks `R^T R = I` and `det(R) = 1` within `tolerance`.
pub fn is_rotation(m: &Matrix3<f64>, tolerance: f64) -> bool {
    let identity_error = (m.transpose() * m - Matrix3::identity()).abs().max();
    identity_error < tolerance && (m.determinant() - 1.0).abs() < tolerance
}

/// Angle of the relative rotation `a^T b` in radians.
pub fn rotation_angle_between(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
    matrix_to_axis_angle(&(a.transpose() * b)).norm()
}

/// Rotates `p` by the Rodrigues vector `rvec`, generic over the solver's
/// scalar type.
pub fn rotate_axis_angle<T: RealField>(rvec: &Vector3<T>, p: &Vector3<T>) -> Vector3<T> {
    let theta2 = rvec.norm_squared();
    let cross = rvec.cross(p);
    if theta2 > nalgebra::convert(SMALL_ANGLE_SQUARED) {
        let theta = theta2.sqrt();
        let (sin_t, cos_t) = (theta.clone().sin(), theta.clone().cos());
        let axis = rvec / theta;
        let axis_cross = axis.cross(p);
        let axis_dot = axis.dot(p);
        p * cos_t.clone() + axis_cross * sin_t + axis * (axis_dot * (T::one() - cos_t))
    } else {
        let second = rvec.cross(&cross) * nalgebra::convert::<f64, T>(0.5);
        p + cross + second
    }
}
