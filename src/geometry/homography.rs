//! Plane-induced homographies and their decomposition into a pose.
//!
//! The homography `H` maps target-plane coordinates `(X, Y)` to image
//! coordinates, `x ~ H [X Y 1]^T`. For a camera with matrix `K` looking at
//! the plane `Z = 0`, `H ~ K [r1 r2 t]`.

use crate::camera::CameraModelError;
use crate::geometry::rotation::orthonormalize;
use crate::geometry::{normalize_points_2d, Pose};
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

/// Normalized DLT estimate of `H` from at least four correspondences.
///
/// The result is scaled so that `H[2,2] = 1` whenever that entry is not
/// vanishingly small.
pub fn estimate_homography(
    plane: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, CameraModelError> {
    let n = plane.len();
    if image.len() != n {
        return Err(CameraModelError::InvalidParams(format!(
            "{} plane points but {} image points",
            n,
            image.len()
        )));
    }
    if n < 4 {
        return Err(CameraModelError::InsufficientData {
            required: 4,
            found: n,
        });
    }

    let degenerate =
        || CameraModelError::DegenerateConfiguration("coincident homography points".to_string());
    let (plane_n, t_plane) = normalize_points_2d(plane).ok_or_else(degenerate)?;
    let (image_n, t_image) = normalize_points_2d(image).ok_or_else(degenerate)?;

    // at least 9 rows so the SVD yields a full V
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (pw, pi)) in plane_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (pw.x, pw.y, pi.x, pi.y);
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

    let h = smallest_right_singular_vector(a)?;
    let h_norm = Matrix3::from_row_slice(h.as_slice());

    let t_image_inv = t_image.try_inverse().ok_or_else(|| {
        CameraModelError::NumericalError("normalization transform is singular".to_string())
    })?;
    let mut h = t_image_inv * h_norm * t_plane;

    let scale = h[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h /= scale;
    }
    if h.iter().any(|v| !v.is_finite()) {
        return Err(CameraModelError::NumericalError(
            "homography has non-finite entries".to_string(),
        ));
    }
    Ok(h)
}

/// Solves `A x = 0` in the least-squares sense for a unit vector `x`.
pub(crate) fn smallest_right_singular_vector(
    a: DMatrix<f64>,
) -> Result<nalgebra::DVector<f64>, CameraModelError> {
    let cols = a.ncols();
    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CameraModelError::NumericalError("SVD failed".to_string()))?;
    let (min_index, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(bi, bv), (i, &v)| {
            if v < bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });
    if v_t.nrows() < cols {
        return Err(CameraModelError::NumericalError(
            "SVD returned a truncated basis".to_string(),
        ));
    }
    Ok(v_t.row(min_index).transpose())
}

/// Applies `H` to a plane point.
pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < f64::EPSILON {
        return None;
    }
    Some(Point2::new(q.x / q.z, q.y / q.z))
}

/// Recovers the pose of the plane `Z = 0` from `H` and the camera matrix.
///
/// The scale is the average of `1 / |K^-1 h1|` and `1 / |K^-1 h2|`; the sign
/// is chosen so the plane lies in front of the camera. The rotation is
/// projected back onto SO(3).
pub fn pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Result<Pose, CameraModelError> {
    let k_inv = k.try_inverse().ok_or_else(|| {
        CameraModelError::InvalidParams("camera matrix is not invertible".to_string())
    })?;
    let b1 = k_inv * h.column(0);
    let b2 = k_inv * h.column(1);
    let b3 = k_inv * h.column(2);

    let norm1 = b1.norm();
    let norm2 = b2.norm();
    if norm1 <= f64::EPSILON || norm2 <= f64::EPSILON {
        return Err(CameraModelError::DegenerateConfiguration(
            "homography columns vanish".to_string(),
        ));
    }
    let mut lambda = 2.0 / (norm1 + norm2);
    if b3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = b1 * lambda;
    let r2 = b2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]))?;
    Pose::new(rotation, b3 * lambda)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation::{axis_angle_to_matrix, rotation_angle_between};
    use approx::assert_relative_eq;

    fn synthetic_view() -> (Matrix3<f64>, Pose, Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let k = Matrix3::new(800.0, 0.0, 640.0, 0.0, 780.0, 360.0, 0.0, 0.0, 1.0);
        let pose = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.1, -0.05, 0.2)),
            Vector3::new(0.1, -0.05, 1.0),
        )
        .unwrap();
        let plane: Vec<Point2<f64>> = (0..20)
            .map(|i| Point2::new((i % 5) as f64 * 0.05, (i / 5) as f64 * 0.05))
            .collect();
        let image = plane
            .iter()
            .map(|p| {
                let pc = pose.transform(&Vector3::new(p.x, p.y, 0.0));
                let q = k * (pc / pc.z);
                Point2::new(q.x, q.y)
            })
            .collect();
        (k, pose, plane, image)
    }

    #[test]
    fn test_homography_maps_plane_to_image() {
        let (_, _, plane, image) = synthetic_view();
        let h = estimate_homography(&plane, &image).unwrap();
        assert_relative_eq!(h[(2, 2)], 1.0);
        for (p, q) in plane.iter().zip(image.iter()) {
            let mapped = apply_homography(&h, p).unwrap();
            assert_relative_eq!(mapped, *q, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_homography_needs_four_points() {
        let pts = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(0.0, 1.0)];
        assert!(matches!(
            estimate_homography(&pts, &pts),
            Err(CameraModelError::InsufficientData { required: 4, found: 3 })
        ));
    }

    #[test]
    fn test_pose_from_homography_recovers_pose() {
        let (k, pose, plane, image) = synthetic_view();
        let h = estimate_homography(&plane, &image).unwrap();
        let recovered = pose_from_homography(&k, &h).unwrap();
        assert!(rotation_angle_between(recovered.rotation(), pose.rotation()) < 1e-9);
        assert_relative_eq!(*recovered.translation(), *pose.translation(), epsilon = 1e-9);
    }

    #[test]
    fn test_pose_from_negated_homography_keeps_plane_in_front() {
        let (k, pose, plane, image) = synthetic_view();
        let h = -estimate_homography(&plane, &image).unwrap();
        let recovered = pose_from_homography(&k, &h).unwrap();
        assert!(recovered.translation().z > 0.0);
        assert_relative_eq!(*recovered.translation(), *pose.translation(), epsilon = 1e-9);
    }
}
