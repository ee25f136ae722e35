use crate::camera::CameraModelError;
use crate::geometry::rotation::{axis_angle_to_matrix, is_rotation, matrix_to_axis_angle};
use nalgebra::{Matrix3, Matrix3x4, Point3, Vector3};
use std::fmt;

/// Tolerance used when validating that a matrix is a proper rotation.
pub const ROTATION_TOLERANCE: f64 = 1e-6;

/// Rigid transform from the object (world) frame into the camera frame:
/// `Pc = R * Pw + t`.
///
/// A pose is immutable once built; refinements produce a new value.
#[derive(Clone, Copy, PartialEq)]
pub struct Pose {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl Pose {
    /// Builds a pose, rejecting matrices that are not orthonormal with `det = 1`.
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Result<Self, CameraModelError> {
        if !is_rotation(&rotation, ROTATION_TOLERANCE) {
            return Err(CameraModelError::InvalidParams(
                "rotation matrix is not orthonormal with det = 1".to_string(),
            ));
        }
        if translation.iter().any(|v| !v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "translation must be finite".to_string(),
            ));
        }
        Ok(Pose {
            rotation,
            translation,
        })
    }

    pub fn identity() -> Self {
        Pose {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// From a Rodrigues rotation vector and a translation.
    pub fn from_rvec_tvec(rvec: &Vector3<f64>, tvec: &Vector3<f64>) -> Result<Self, CameraModelError> {
        Pose::new(axis_angle_to_matrix(rvec), *tvec)
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn rvec(&self) -> Vector3<f64> {
        matrix_to_axis_angle(&self.rotation)
    }

    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.transform(&point.coords))
    }

    pub fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        Pose {
            rotation: rt,
            translation: -(rt * self.translation),
        }
    }

    /// `self` applied after `other`.
    pub fn compose(&self, other: &Pose) -> Self {
        Pose {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Camera centre expressed in the object frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    /// The 3x4 matrix `[R | t]`.
    pub fn matrix3x4(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

impl fmt::Debug for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.rvec();
        write!(
            f,
            "Pose [rvec: ({:.6}, {:.6}, {:.6}) tvec: ({:.6}, {:.6}, {:.6})]",
            r.x, r.y, r.z, self.translation.x, self.translation.y, self.translation.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_rejects_non_rotation() {
        let scaled = Matrix3::identity() * 2.0;
        assert!(Pose::new(scaled, Vector3::zeros()).is_err());
        let reflection = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(Pose::new(reflection, Vector3::zeros()).is_err());
    }

    #[test]
    fn test_pose_inverse_and_compose() {
        let pose =
            Pose::from_rvec_tvec(&Vector3::new(0.1, 0.2, -0.3), &Vector3::new(0.5, -0.2, 1.0))
                .unwrap();
        let identity = pose.compose(&pose.inverse());
        assert_relative_eq!(*identity.rotation(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(*identity.translation(), Vector3::zeros(), epsilon = 1e-12);

        let p = Point3::new(0.3, 0.4, 0.5);
        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
        assert_relative_eq!(
            pose.transform(&pose.camera_center()),
            Vector3::zeros(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_pose_rvec_round_trip() {
        let rvec = Vector3::new(-0.7, 0.1, 0.25);
        let pose = Pose::from_rvec_tvec(&rvec, &Vector3::new(0.0, 0.0, 1.0)).unwrap();
        assert_relative_eq!(pose.rvec(), rvec, epsilon = 1e-12);
        let m = pose.matrix3x4();
        assert_relative_eq!(m[(2, 3)], 1.0);
    }
}
