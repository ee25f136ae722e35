use crate::camera::CameraModelError;
use nalgebra::{Matrix3x4, Matrix4, Point2, Point3};

/// Linear (DLT) triangulation of one correspondence seen by two cameras.
///
/// `p1` and `p2` are 3x4 projection matrices matching the coordinates of
/// `a` and `b` (pixels with `K [R|t]`, normalized points with `[R|t]`).
/// Returns `None` for points at infinity.
pub fn triangulate_point(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    a: &Point2<f64>,
    b: &Point2<f64>,
) -> Option<Point3<f64>> {
    let mut m = Matrix4::<f64>::zeros();
    for c in 0..4 {
        m[(0, c)] = a.x * p1[(2, c)] - p1[(0, c)];
        m[(1, c)] = a.y * p1[(2, c)] - p1[(1, c)];
        m[(2, c)] = b.x * p2[(2, c)] - p2[(0, c)];
        m[(3, c)] = b.y * p2[(2, c)] - p2[(1, c)];
    }
    let svd = m.svd(false, true);
    let v_t = svd.v_t?;
    let (min_index, _) = svd.singular_values.argmin();
    let xh = v_t.row(min_index);
    let w = xh[3];
    if w.abs() < 1e-12 || !w.is_finite() {
        return None;
    }
    Some(Point3::new(xh[0] / w, xh[1] / w, xh[2] / w))
}

/// Triangulates paired points; each entry is `None` where the point is at
/// infinity.
pub fn triangulate_points(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
) -> Result<Vec<Option<Point3<f64>>>, CameraModelError> {
    if pts1.len() != pts2.len() {
        return Err(CameraModelError::InvalidParams(format!(
            "triangulation needs paired points, got {} and {}",
            pts1.len(),
            pts2.len()
        )));
    }
    Ok(pts1
        .iter()
        .zip(pts2.iter())
        .map(|(a, b)| triangulate_point(p1, p2, a, b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation::axis_angle_to_matrix;
    use crate::geometry::Pose;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_triangulate_two_views() {
        let first = Pose::identity();
        let second = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.0, -0.05, 0.01)),
            Vector3::new(-0.2, 0.01, 0.0),
        )
        .unwrap();
        let points = vec![
            Point3::new(0.1, -0.2, 2.0),
            Point3::new(-0.5, 0.3, 3.5),
            Point3::new(0.0, 0.0, 1.2),
        ];
        let project = |pose: &Pose, p: &Point3<f64>| {
            let pc = pose.transform_point(p);
            Point2::new(pc.x / pc.z, pc.y / pc.z)
        };
        let a: Vec<_> = points.iter().map(|p| project(&first, p)).collect();
        let b: Vec<_> = points.iter().map(|p| project(&second, p)).collect();
        let result =
            triangulate_points(&first.matrix3x4(), &second.matrix3x4(), &a, &b).unwrap();
        for (estimate, truth) in result.iter().zip(points.iter()) {
            assert_relative_eq!(estimate.unwrap(), *truth, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_triangulate_rejects_unpaired_input() {
        let p = Pose::identity().matrix3x4();
        assert!(triangulate_points(&p, &p, &[Point2::new(0.0, 0.0)], &[]).is_err());
    }
}
