//! Closed-form pose estimates from object points and normalized image points.
//!
//! Image points must already be undistorted and mapped through `K^-1`; both
//! estimators here serve as the starting point of the iterative refinement
//! in [`crate::optimization::pose`].

use crate::camera::CameraModelError;
use crate::geometry::homography::{estimate_homography, pose_from_homography, smallest_right_singular_vector};
use crate::geometry::rotation::orthonormalize;
use crate::geometry::{principal_frame, Pose};
use nalgebra::{DMatrix, Matrix3, Point2, Point3, Vector3};

fn check_pairs(object: &[Point3<f64>], image: &[Point2<f64>], required: usize) -> Result<(), CameraModelError> {
    if object.len() != image.len() {
        return Err(CameraModelError::InvalidParams(format!(
            "{} object points but {} image points",
            object.len(),
            image.len()
        )));
    }
    if object.len() < required {
        return Err(CameraModelError::InsufficientData {
            required,
            found: object.len(),
        });
    }
    Ok(())
}

/// Pose of a planar target through its homography.
///
/// The target plane may be arbitrary; points are expressed in the plane's
/// principal frame first and the result is mapped back to object
/// coordinates. For non-planar input this is the pose of the best-fit plane,
/// which is only an approximation.
pub fn planar_pose(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Pose, CameraModelError> {
    check_pairs(object, normalized, 4)?;

    let frame = principal_frame(object)?;
    let to_plane = frame.axes.transpose();
    let plane: Vec<Point2<f64>> = object
        .iter()
        .map(|p| {
            let q = to_plane * (p.coords - frame.centroid);
            Point2::new(q.x, q.y)
        })
        .collect();

    let h = estimate_homography(&plane, normalized)?;
    let plane_pose = pose_from_homography(&Matrix3::identity(), &h)?;

    // Pc = Rp * A^T * (Pw - c) + tp
    let rotation = plane_pose.rotation() * to_plane;
    let translation = plane_pose.translation() - rotation * frame.centroid;
    Pose::new(orthonormalize(&rotation)?, translation)
}

/// Direct linear transform for general (non-coplanar) point sets.
///
/// Needs at least six correspondences.
pub fn dlt_pose(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Pose, CameraModelError> {
    check_pairs(object, normalized, 6)?;

    let n = object.len();
    let mut a = DMatrix::<f64>::zeros((2 * n).max(12), 12);
    for (i, (p, q)) in object.iter().zip(normalized.iter()).enumerate() {
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = p.x;
        a[(r0, 1)] = p.y;
        a[(r0, 2)] = p.z;
        a[(r0, 3)] = 1.0;
        a[(r0, 8)] = -q.x * p.x;
        a[(r0, 9)] = -q.x * p.y;
        a[(r0, 10)] = -q.x * p.z;
        a[(r0, 11)] = -q.x;

        a[(r1, 4)] = p.x;
        a[(r1, 5)] = p.y;
        a[(r1, 6)] = p.z;
        a[(r1, 7)] = 1.0;
        a[(r1, 8)] = -q.y * p.x;
        a[(r1, 9)] = -q.y * p.y;
        a[(r1, 10)] = -q.y * p.z;
        a[(r1, 11)] = -q.y;
    }

    let p = smallest_right_singular_vector(a)?;
    let mut m = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
    let mut t = Vector3::new(p[3], p[7], p[11]);
    if m.determinant() < 0.0 {
        m = -m;
        t = -t;
    }

    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(CameraModelError::NumericalError(
                "SVD failed in DLT pose".to_string(),
            ))
        }
    };
    let scale = svd.singular_values.sum() / 3.0;
    if scale.abs() < 1e-12 {
        return Err(CameraModelError::DegenerateConfiguration(
            "DLT projection matrix vanished".to_string(),
        ));
    }
    Pose::new(orthonormalize(&(u * v_t))?, t / scale)
}
