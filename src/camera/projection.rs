//! The forward projection model used as a verification oracle.
//!
//! A world point is moved into the camera frame with `Pc = R * Pw + t`,
//! perspective-divided, distorted with the radial/tangential polynomial
//!
//! ```text
//! r2     = x^2 + y^2
//! radial = 1 + k1 r2 + k2 r2^2 + k3 r2^3 + k4 r2^4 + k5 r2^5 + k6 r2^6
//! x'     = x * radial + 2 p1 x y + p2 (r2 + 2 x^2)
//! y'     = y * radial + p1 (r2 + 2 y^2) + 2 p2 x y
//! ```
//!
//! and mapped to pixels with `u = fx x' + cx`, `v = fy y' + cy`.
//!
//! The distortion and pixel mapping are written once, generically over
//! [`RealField`], so that the calibration and pose residuals (evaluated with
//! dual numbers by the solver) run exactly the same arithmetic as
//! [`project_points`].

use crate::camera::{CameraModelError, Distortion, Intrinsics, MAX_DISTORTION_TERMS};
use crate::geometry::Pose;
use crate::util::ProjectionError;
use nalgebra::{Point2, Point3, RealField, Vector2, Vector3};

/// Pixel deviation above which two projections are considered different models.
pub const CROSS_CHECK_TOLERANCE_PX: f64 = 1e-3;

/// Applies the distortion polynomial to a normalized image point.
///
/// `terms` holds `k1, k2, p1, p2, k3, k4, k5, k6`; shorter slices leave the
/// missing terms at zero.
pub fn distort_normalized<T: RealField>(x: T, y: T, terms: &[T]) -> (T, T) {
    let term = |i: usize| terms.get(i).cloned().unwrap_or_else(T::zero);
    let (k1, k2, p1, p2, k3, k4, k5, k6) = (
        term(0),
        term(1),
        term(2),
        term(3),
        term(4),
        term(5),
        term(6),
        term(7),
    );
    let one = T::one();
    let two = one.clone() + one.clone();

    let xx = x.clone() * x.clone();
    let yy = y.clone() * y.clone();
    let xy = x.clone() * y.clone();
    let r2 = xx.clone() + yy.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let r8 = r6.clone() * r2.clone();
    let r10 = r8.clone() * r2.clone();
    let r12 = r10.clone() * r2.clone();

    let radial = one
        + k1 * r2.clone()
        + k2 * r4
        + k3 * r6
        + k4 * r8
        + k5 * r10
        + k6 * r12;

    let xd = x * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * xx);
    let yd = y * radial + p1 * (r2 + two.clone() * yy) + two * p2 * xy;
    (xd, yd)
}

/// Maps a camera-frame point to pixels. The caller guarantees `z > 0`.
pub fn pixel_from_camera<T: RealField>(
    point: &Vector3<T>,
    intrinsics: &[T; 4],
    terms: &[T],
) -> Vector2<T> {
    let x = point.x.clone() / point.z.clone();
    let y = point.y.clone() / point.z.clone();
    let (xd, yd) = distort_normalized(x, y, terms);
    Vector2::new(
        intrinsics[0].clone() * xd + intrinsics[2].clone(),
        intrinsics[1].clone() * yd + intrinsics[3].clone(),
    )
}

fn terms_of(distortion: Option<&Distortion>) -> [f64; MAX_DISTORTION_TERMS] {
    distortion.map(|d| d.terms()).unwrap_or([0.0; MAX_DISTORTION_TERMS])
}

/// Projects a single world point; `None` when it lands on or behind the camera plane.
pub fn project_point(
    point: &Point3<f64>,
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    pose: &Pose,
) -> Option<Point2<f64>> {
    let terms = terms_of(distortion);
    project_with_terms(point, intrinsics, &terms, pose)
}

fn project_with_terms(
    point: &Point3<f64>,
    intrinsics: &Intrinsics,
    terms: &[f64; MAX_DISTORTION_TERMS],
    pose: &Pose,
) -> Option<Point2<f64>> {
    let pc = pose.transform(&point.coords);
    if pc.z <= 0.0 || !pc.z.is_finite() {
        return None;
    }
    let k = [intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy];
    let uv = pixel_from_camera(&pc, &k, terms);
    Some(Point2::from(uv))
}

/// Projects world points into the image.
///
/// Points with `Zc <= 0` yield `None`; pass `distortion = None` to bypass the
/// lens model entirely.
pub fn project_points(
    points: &[Point3<f64>],
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    pose: &Pose,
) -> Vec<Option<Point2<f64>>> {
    let terms = terms_of(distortion);
    points
        .iter()
        .map(|p| project_with_terms(p, intrinsics, &terms, pose))
        .collect()
}

/// Cross-checks two projections of the same points.
///
/// Returns the deviation statistics when every point agrees within
/// `tolerance` pixels and both sides mark the same points invalid; otherwise
/// reports [`CameraModelError::ModelMismatch`].
pub fn verify_projection(
    reference: &[Option<Point2<f64>>],
    candidate: &[Option<Point2<f64>>],
    tolerance: f64,
) -> Result<ProjectionError, CameraModelError> {
    if reference.len() != candidate.len() {
        return Err(CameraModelError::InvalidParams(format!(
            "cannot compare {} projections with {}",
            reference.len(),
            candidate.len()
        )));
    }

    let mut deviations = Vec::with_capacity(reference.len());
    for (a, b) in reference.iter().zip(candidate.iter()) {
        match (a, b) {
            (Some(a), Some(b)) => deviations.push((a - b).norm()),
            (None, None) => {}
            _ => {
                return Err(CameraModelError::ModelMismatch {
                    max_deviation: f64::INFINITY,
                })
            }
        }
    }

    let stats = ProjectionError::from_residuals(&deviations)?;
    if stats.max > tolerance {
        return Err(CameraModelError::ModelMismatch {
            max_deviation: stats.max,
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation::axis_angle_to_matrix;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn reference_intrinsics() -> Intrinsics {
        Intrinsics::new(1200.0, 1200.0, 960.0, 540.0)
    }

    #[test]
    fn test_ten_centimetre_square() {
        let square = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.1, 0.1, 0.0),
            Point3::new(0.0, 0.1, 0.0),
        ];
        let pose = Pose::new(Matrix3::identity(), Vector3::new(0.0, 0.0, 0.5)).unwrap();
        let pixels = project_points(&square, &reference_intrinsics(), None, &pose);
        let expected = [(960.0, 540.0), (1080.0, 540.0), (1080.0, 660.0), (960.0, 660.0)];
        for (p, (u, v)) in pixels.iter().zip(expected.iter()) {
            let p = p.unwrap();
            assert_relative_eq!(p.x, *u, epsilon = 1e-9);
            assert_relative_eq!(p.y, *v, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_projection_is_deterministic() {
        let points: Vec<Point3<f64>> = (0..20)
            .map(|i| Point3::new(0.01 * i as f64, -0.02 * i as f64, 0.1))
            .collect();
        let pose = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.1, -0.2, 0.05)),
            Vector3::new(0.02, -0.01, 1.2),
        )
        .unwrap();
        let distortion = Distortion::new(vec![-0.2, 0.05, 0.001, -0.002, 0.01, 0.001]).unwrap();
        let a = project_points(&points, &reference_intrinsics(), Some(&distortion), &pose);
        let b = project_points(&points, &reference_intrinsics(), Some(&distortion), &pose);
        for (a, b) in a.iter().zip(b.iter()) {
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_eq!(a.x.to_bits(), b.x.to_bits());
            assert_eq!(a.y.to_bits(), b.y.to_bits());
        }
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let pose = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.3, 0.1, -0.2)),
            Vector3::new(-0.1, 0.05, 0.8),
        )
        .unwrap();
        let points: Vec<Point3<f64>> = (0..16)
            .map(|i| Point3::new(0.03 * (i % 4) as f64, 0.03 * (i / 4) as f64, 0.0))
            .collect();
        let zero = Distortion::zeros(8);
        let distorted = project_points(&points, &reference_intrinsics(), Some(&zero), &pose);
        let pinhole = project_points(&points, &reference_intrinsics(), None, &pose);
        assert_eq!(distorted, pinhole);

        for (x, y) in [(0.1, 0.2), (-0.4, 0.3), (0.0, 0.0)] {
            let (xd, yd) = distort_normalized(x, y, &[0.0; 8]);
            assert_eq!((xd, yd), (x, y));
        }
    }

    #[test]
    fn test_distortion_formula_terms() {
        let (x, y) = (0.3_f64, -0.2_f64);
        let terms = [0.1, 0.01, 0.002, 0.003, 0.001, 0.0005, 0.0002, 0.0001];
        let r2: f64 = x * x + y * y;
        let radial = 1.0
            + 0.1 * r2
            + 0.01 * r2.powi(2)
            + 0.001 * r2.powi(3)
            + 0.0005 * r2.powi(4)
            + 0.0002 * r2.powi(5)
            + 0.0001 * r2.powi(6);
        let xd = x * radial + 2.0 * 0.002 * x * y + 0.003 * (r2 + 2.0 * x * x);
        let yd = y * radial + 0.002 * (r2 + 2.0 * y * y) + 2.0 * 0.003 * x * y;
        let (u, v) = distort_normalized(x, y, &terms);
        assert_relative_eq!(u, xd, epsilon = 1e-15);
        assert_relative_eq!(v, yd, epsilon = 1e-15);
    }

    #[test]
    fn test_points_behind_camera_are_marked_invalid() {
        let pose = Pose::new(Matrix3::identity(), Vector3::new(0.0, 0.0, 0.5)).unwrap();
        let points = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, -0.5),
            Point3::new(0.0, 0.0, -1.0),
        ];
        let pixels = project_points(&points, &reference_intrinsics(), None, &pose);
        assert!(pixels[0].is_some());
        assert!(pixels[1].is_none());
        assert!(pixels[2].is_none());
    }

    #[test]
    fn test_verify_projection_detects_mismatch() {
        let a = vec![Some(Point2::new(1.0, 1.0)), None];
        let b = vec![Some(Point2::new(1.0, 1.0005)), None];
        let stats = verify_projection(&a, &b, CROSS_CHECK_TOLERANCE_PX).unwrap();
        assert_relative_eq!(stats.max, 0.0005, epsilon = 1e-12);

        let c = vec![Some(Point2::new(1.0, 1.01)), None];
        assert!(matches!(
            verify_projection(&a, &c, CROSS_CHECK_TOLERANCE_PX),
            Err(CameraModelError::ModelMismatch { .. })
        ));
        let d = vec![Some(Point2::new(1.0, 1.0)), Some(Point2::new(0.0, 0.0))];
        assert!(verify_projection(&a, &d, CROSS_CHECK_TOLERANCE_PX).is_err());
    }
}
