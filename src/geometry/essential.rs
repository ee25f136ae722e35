//! Essential matrix estimation and relative pose recovery.
//!
//! Points are given on the normalized image plane of each camera (pixels
//! undistorted and multiplied by `K^-1`). The essential matrix satisfies
//! `x2^T E x1 = 0` and the recovered pose maps first-camera coordinates into
//! the second camera, `X2 = R X1 + t`, with `|t| = 1`.

use crate::camera::CameraModelError;
use crate::geometry::homography::smallest_right_singular_vector;
use crate::geometry::ransac::{ransac, Estimator, RansacOptions, RansacResult};
use crate::geometry::triangulation::triangulate_point;
use crate::geometry::{normalize_points_2d, Pose};
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

/// Eight-point estimate with Hartley conditioning, projected onto the
/// essential manifold (two equal singular values, one zero).
pub fn estimate_essential(
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
) -> Result<Matrix3<f64>, CameraModelError> {
    let n = pts1.len();
    if pts2.len() != n {
        return Err(CameraModelError::InvalidParams(format!(
            "essential estimation needs paired points, got {} and {}",
            n,
            pts2.len()
        )));
    }
    if n < 8 {
        return Err(CameraModelError::InsufficientData {
            required: 8,
            found: n,
        });
    }

    let degenerate =
        || CameraModelError::DegenerateConfiguration("coincident points".to_string());
    let (n1, t1) = normalize_points_2d(pts1).ok_or_else(degenerate)?;
    let (n2, t2) = normalize_points_2d(pts2).ok_or_else(degenerate)?;

    let mut a = DMatrix::<f64>::zeros(n.max(9), 9);
    for (i, (p, q)) in n1.iter().zip(n2.iter()).enumerate() {
        a[(i, 0)] = q.x * p.x;
        a[(i, 1)] = q.x * p.y;
        a[(i, 2)] = q.x;
        a[(i, 3)] = q.y * p.x;
        a[(i, 4)] = q.y * p.y;
        a[(i, 5)] = q.y;
        a[(i, 6)] = p.x;
        a[(i, 7)] = p.y;
        a[(i, 8)] = 1.0;
    }
    let e = smallest_right_singular_vector(a)?;
    let e_norm = Matrix3::from_row_slice(e.as_slice());
    let e = t2.transpose() * e_norm * t1;
    enforce_essential_constraints(&e)
}

fn enforce_essential_constraints(e: &Matrix3<f64>) -> Result<Matrix3<f64>, CameraModelError> {
    let svd = e.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(CameraModelError::NumericalError(
                "SVD failed on essential matrix".to_string(),
            ))
        }
    };
    let mut s: Vec<f64> = svd.singular_values.iter().copied().collect();
    s.sort_by(|a, b| b.total_cmp(a));
    let sigma = 0.5 * (s[0] + s[1]);
    if sigma <= f64::EPSILON {
        return Err(CameraModelError::DegenerateConfiguration(
            "essential matrix vanished".to_string(),
        ));
    }
    // singular values are not guaranteed sorted; zero the smallest one
    let (min_index, _) = svd.singular_values.argmin();
    let mut diag = Vector3::repeat(1.0);
    diag[min_index] = 0.0;
    let e = u * Matrix3::from_diagonal(&diag) * v_t;
    Ok(e / e.norm())
}

/// Sampson distance of a correspondence, in normalized image units.
pub fn sampson_distance(e: &Matrix3<f64>, p1: &Point2<f64>, p2: &Point2<f64>) -> f64 {
    let x1 = Vector3::new(p1.x, p1.y, 1.0);
    let x2 = Vector3::new(p2.x, p2.y, 1.0);
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let numerator = x2.dot(&ex1);
    let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if denom <= 1e-18 {
        return f64::INFINITY;
    }
    numerator.abs() / denom.sqrt()
}

struct EssentialEstimator;

impl Estimator for EssentialEstimator {
    type Datum = (Point2<f64>, Point2<f64>);
    type Model = Matrix3<f64>;

    const MIN_SAMPLES: usize = 8;

    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
        let (a, b): (Vec<_>, Vec<_>) = sample.iter().map(|&i| data[i]).unzip();
        estimate_essential(&a, &b).ok()
    }

    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64 {
        sampson_distance(model, &datum.0, &datum.1)
    }

    fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        Self::fit(data, inliers)
    }
}

/// Robust essential matrix.
///
/// `options.threshold` is in normalized units; divide a pixel threshold by
/// the focal length before calling.
pub fn find_essential_ransac(
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
    options: &RansacOptions,
) -> Result<RansacResult<Matrix3<f64>>, CameraModelError> {
    if pts1.len() != pts2.len() {
        return Err(CameraModelError::InvalidParams(format!(
            "essential estimation needs paired points, got {} and {}",
            pts1.len(),
            pts2.len()
        )));
    }
    let data: Vec<(Point2<f64>, Point2<f64>)> =
        pts1.iter().copied().zip(pts2.iter().copied()).collect();
    ransac::<EssentialEstimator>(&data, options)
}

/// The four `(R, t)` factorizations of `E`.
pub fn decompose_essential(
    e: &Matrix3<f64>,
) -> Result<[(Matrix3<f64>, Vector3<f64>); 4], CameraModelError> {
    let svd = e.svd(true, true);
    let (mut u, mut v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(CameraModelError::NumericalError(
                "SVD failed on essential matrix".to_string(),
            ))
        }
    };
    // move the null direction to the third column
    let (min_index, _) = svd.singular_values.argmin();
    if min_index != 2 {
        u.swap_columns(min_index, 2);
        v_t.swap_rows(min_index, 2);
    }
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t: Vector3<f64> = u.column(2).into_owned();
    Ok([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Relative pose chosen by the cheirality test, and the number of points
/// that triangulate in front of both cameras.
#[derive(Debug, Clone)]
pub struct RelativePose {
    pub pose: Pose,
    pub points_in_front: usize,
}

/// Picks the decomposition of `E` that places the most of the given
/// correspondences in front of both cameras.
pub fn recover_relative_pose(
    e: &Matrix3<f64>,
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
) -> Result<RelativePose, CameraModelError> {
    if pts1.len() != pts2.len() {
        return Err(CameraModelError::InvalidParams(
            "pose recovery needs paired points".to_string(),
        ));
    }
    if pts1.len() < 5 {
        return Err(CameraModelError::InsufficientData {
            required: 5,
            found: pts1.len(),
        });
    }

    let first = Pose::identity().matrix3x4();
    let mut best: Option<RelativePose> = None;
    for (rotation, translation) in decompose_essential(e)? {
        let candidate = Pose::new(rotation, translation)?;
        let second = candidate.matrix3x4();
        let count = pts1
            .iter()
            .zip(pts2.iter())
            .filter_map(|(a, b)| triangulate_point(&first, &second, a, b))
            .filter(|x| x.z > 0.0 && candidate.transform_point(x).z > 0.0)
            .count();
        if best.as_ref().map_or(true, |b| count > b.points_in_front) {
            best = Some(RelativePose {
                pose: candidate,
                points_in_front: count,
            });
        }
    }

    match best {
        Some(b) if b.points_in_front > 0 => Ok(b),
        _ => Err(CameraModelError::DegenerateConfiguration(
            "no pose candidate places points in front of both cameras".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation::{axis_angle_to_matrix, rotation_angle_between, skew};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn scene() -> (Pose, Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let relative = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.02, -0.1, 0.03)),
            Vector3::new(-0.3, 0.02, 0.05).normalize(),
        )
        .unwrap();
        let mut a = Vec::new();
        let mut b = Vec::new();
        for i in 0..120 {
            let x = ((i * 37) % 101) as f64 / 50.0 - 1.0;
            let y = ((i * 53) % 89) as f64 / 60.0 - 0.7;
            let z = 3.0 + ((i * 29) % 71) as f64 / 20.0;
            let p = Point3::new(x * z * 0.5, y * z * 0.5, z);
            let q = relative.transform_point(&p);
            a.push(Point2::new(p.x / p.z, p.y / p.z));
            b.push(Point2::new(q.x / q.z, q.y / q.z));
        }
        (relative, a, b)
    }

    #[test]
    fn test_estimate_essential_satisfies_epipolar_constraint() {
        let (relative, a, b) = scene();
        let e = estimate_essential(&a, &b).unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            assert!(sampson_distance(&e, p, q) < 1e-9);
        }
        let truth = skew(relative.translation()) * relative.rotation();
        let truth = truth / truth.norm();
        let aligned = if (e - truth).norm() < (e + truth).norm() { e } else { -e };
        assert_relative_eq!(aligned, truth, epsilon = 1e-8);
    }

    #[test]
    fn test_recover_relative_pose() {
        let (relative, a, b) = scene();
        let e = estimate_essential(&a, &b).unwrap();
        let recovered = recover_relative_pose(&e, &a, &b).unwrap();
        assert_eq!(recovered.points_in_front, a.len());
        assert!(rotation_angle_between(recovered.pose.rotation(), relative.rotation()) < 1e-8);
        assert_relative_eq!(
            *recovered.pose.translation(),
            *relative.translation(),
            epsilon = 1e-8
        );
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let (relative, a, mut b) = scene();
        for (i, p) in b.iter_mut().enumerate().take(30) {
            *p = Point2::new(p.x + 0.05 * ((i % 3) as f64 + 1.0), p.y - 0.04);
        }
        let options = RansacOptions {
            threshold: 1e-4,
            min_inliers: 50,
            ..RansacOptions::default()
        };
        let result = find_essential_ransac(&a, &b, &options).unwrap();
        assert_eq!(result.inliers.len(), 90);
        assert!(result.inliers.iter().all(|&i| i >= 30));
        let recovered = recover_relative_pose(&result.model, &a, &b).unwrap();
        assert!(rotation_angle_between(recovered.pose.rotation(), relative.rotation()) < 1e-6);
    }

    #[test]
    fn test_too_few_inliers_is_an_error() {
        let (_, a, b) = scene();
        let options = RansacOptions {
            threshold: 1e-4,
            min_inliers: 200,
            ..RansacOptions::default()
        };
        assert!(matches!(
            find_essential_ransac(&a, &b, &options),
            Err(CameraModelError::InsufficientData { required: 200, .. })
        ));
    }
}
