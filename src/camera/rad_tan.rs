//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct: a pinhole camera with the
//! radial/tangential lens polynomial of [`crate::camera::projection`] using up
//! to eight coefficients `k1, k2, p1, p2, k3, k4, k5, k6`. It is the model
//! produced by the intrinsic calibrator and consumed by the pose solver, the
//! stereo rectifier and the straightness sweep.

use crate::camera::projection::{distort_normalized, pixel_from_camera};
use crate::camera::{
    validation, CalibrationParams, CameraModel, CameraModelError, Distortion, Intrinsics,
    Resolution,
};
use nalgebra::{DVector, Matrix2, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use camera_geometry_tools::camera::rad_tan::RadTanModel;
/// use camera_geometry_tools::camera::Resolution;
///
/// // fx, fy, cx, cy, k1, k2, p1, p2, k3
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0,
///     0.1, -0.05, 0.001, 0.001, 0.02,
/// ]);
/// let mut model = RadTanModel::new(&params).unwrap();
/// model.resolution = Resolution { width: 640, height: 480 };
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.distortion.coefficients()[0], 0.1);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct RadTanModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// `k1, k2, p1, p2, k3[, k4, k5, k6]`
    pub distortion: Distortion,
}

impl RadTanModel {
    /// Creates a model from `[fx, fy, cx, cy, d0, d1, ...]`.
    ///
    /// Every value after the first four is taken as a distortion coefficient.
    /// The resolution is initialized to 0x0.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if fewer than four values are given
    ///   or more than eight distortion terms follow them.
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < 4 {
            return Err(CameraModelError::InvalidParams(format!(
                "expected at least 4 parameters, got {}",
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics::new(parameters[0], parameters[1], parameters[2], parameters[3]),
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            distortion: Distortion::new(parameters.iter().skip(4).copied().collect())?,
        };

        model.validate_params()?;
        Ok(model)
    }

    pub fn from_parts(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortion: Distortion,
    ) -> Result<Self, CameraModelError> {
        let model = RadTanModel {
            intrinsics,
            resolution,
            distortion,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Inverts the lens polynomial for a pixel, returning the undistorted
    /// point on the normalized image plane.
    ///
    /// Uses Newton iterations on the 2x2 Jacobian of the distortion map,
    /// starting from the distorted point itself.
    pub fn undistort_normalized(
        &self,
        pixel: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        undistort_normalized(&self.intrinsics.normalize(pixel), &self.distortion.terms())
    }

    /// Removes lens distortion from a pixel, keeping the same intrinsics.
    pub fn undistort_pixel(&self, pixel: &Point2<f64>) -> Result<Point2<f64>, CameraModelError> {
        let n = self.undistort_normalized(&pixel.coords)?;
        Ok(Point2::from(self.intrinsics.denormalize(&n)))
    }

    /// Undistorts every pixel, failing on the first that does not converge.
    pub fn undistort_points(
        &self,
        pixels: &[Point2<f64>],
    ) -> Result<Vec<Point2<f64>>, CameraModelError> {
        pixels.iter().map(|p| self.undistort_pixel(p)).collect()
    }

    /// Applies the lens model to an ideal (undistorted) pixel.
    pub fn distort_pixel(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let n = self.intrinsics.normalize(&pixel.coords);
        let terms = self.distortion.terms();
        let (xd, yd) = distort_normalized(n.x, n.y, &terms);
        Point2::from(self.intrinsics.denormalize(&Vector2::new(xd, yd)))
    }

    fn in_image(&self, p: &Vector2<f64>) -> bool {
        p.x >= 0.0
            && p.x < self.resolution.width as f64
            && p.y >= 0.0
            && p.y < self.resolution.height as f64
    }
}

/// Newton inversion of the distortion polynomial on the normalized plane.
pub fn undistort_normalized(
    distorted: &Vector2<f64>,
    terms: &[f64; 8],
) -> Result<Vector2<f64>, CameraModelError> {
    const EPS: f64 = 1e-12;
    const MAX_ITERATIONS: u32 = 100;

    let [k1, k2, p1, p2, k3, k4, k5, k6] = *terms;
    let mut point = *distorted;

    for _ in 0..MAX_ITERATIONS {
        let (x, y) = (point.x, point.y);
        let (xd, yd) = distort_normalized(x, y, terms);
        let error = Vector2::new(xd, yd) - distorted;
        if error.norm() < EPS {
            return Ok(point);
        }

        let r2 = x * x + y * y;
        let radial = 1.0
            + r2 * (k1 + r2 * (k2 + r2 * (k3 + r2 * (k4 + r2 * (k5 + r2 * k6)))));
        // d(radial)/d(r2)
        let d_radial = k1
            + r2 * (2.0 * k2 + r2 * (3.0 * k3 + r2 * (4.0 * k4 + r2 * (5.0 * k5 + 6.0 * k6 * r2))));

        let j00 = radial + x * d_radial * 2.0 * x + 2.0 * p1 * y + 6.0 * p2 * x;
        let j01 = x * d_radial * 2.0 * y + 2.0 * p1 * x + 2.0 * p2 * y;
        let j10 = y * d_radial * 2.0 * x + 2.0 * p1 * x + 2.0 * p2 * y;
        let j11 = radial + y * d_radial * 2.0 * y + 6.0 * p1 * y + 2.0 * p2 * x;

        let jacobian = Matrix2::new(j00, j01, j10, j11);
        let delta = jacobian
            .try_inverse()
            .ok_or_else(|| CameraModelError::NumericalError("Jacobian is singular".to_string()))?
            * error;
        point -= delta;

        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(CameraModelError::NumericalError(
                "undistortion diverged".to_string(),
            ));
        }
        if delta.norm() < EPS {
            return Ok(point);
        }
    }

    Err(CameraModelError::NonConvergence {
        residual: {
            let (xd, yd) = distort_normalized(point.x, point.y, terms);
            (Vector2::new(xd, yd) - distorted).norm()
        },
        reason: format!("undistortion after {} iterations", MAX_ITERATIONS),
    })
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortion: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortion.coefficients(),
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a camera-frame point to pixels, applying distortion.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`] if `z` is too close to zero.
    /// * [`CameraModelError::PointBehindCamera`] if `z` is negative.
    /// * [`CameraModelError::ProjectionOutSideImage`] if the pixel falls outside
    ///   the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < -f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointBehindCamera);
        }
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let k = [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
        ];
        let uv = pixel_from_camera(point_3d, &k, &self.distortion.terms());

        if !self.in_image(&uv) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(uv)
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.in_image(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let n = self.undistort_normalized(point_2d)?;
        Ok(Vector3::new(n.x, n.y, 1.0).normalize())
    }

    /// Loads the model from a calibration parameter file.
    ///
    /// See [`CalibrationParams`] for the expected keys.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        CalibrationParams::load_from_yaml(path)?.to_model()
    }

    /// Saves the model as a calibration parameter file without an RMS entry.
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        CalibrationParams::from_model(self, None).save_to_yaml(path)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortion)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    /// The coefficients in `k1, k2, p1, p2, k3, ...` order, unpadded.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortion.coefficients().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn get_sample_model() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics::new(461.629, 460.152, 362.680, 246.049),
            resolution: Resolution {
                width: 752,
                height: 480,
            },
            distortion: Distortion::new(vec![-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0])
                .unwrap(),
        }
    }

    #[test]
    fn test_radtan_new_from_vector() {
        let params = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0, 0.1, -0.05]);
        let model = RadTanModel::new(&params).unwrap();
        assert_eq!(model.distortion.len(), 2);
        assert_eq!(model.distortion.terms()[4], 0.0);

        let bad = DVector::from_vec(vec![-1.0, 500.0, 320.0, 240.0]);
        assert!(matches!(
            RadTanModel::new(&bad),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = get_sample_model();
        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        let ray = model.unproject(&point_2d).unwrap();

        assert_relative_eq!(norm_3d, ray, epsilon = 1e-9);
    }

    #[test]
    fn test_radtan_multiple_points_with_high_order_terms() {
        let mut model = get_sample_model();
        model.distortion =
            Distortion::new(vec![-0.2, 0.05, 0.0005, -0.0003, 0.01, 0.002, -0.001, 0.0005])
                .unwrap();

        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, 0.0, 1.0),
            Vector3::new(-0.5, 0.0, 1.0),
            Vector3::new(0.0, 0.4, 1.0),
            Vector3::new(0.3, 0.4, 1.0),
            Vector3::new(-0.3, -0.4, 1.0),
            Vector3::new(0.1, 0.1, 2.0),
        ];

        for original_point in &test_points {
            let pixel = model.project(original_point).unwrap();
            let ray = model.unproject(&pixel).unwrap();
            let dot = original_point.normalize().dot(&ray);
            assert!(dot > 1.0 - 1e-10, "direction mismatch: {}", dot);
        }
    }

    #[test]
    fn test_radtan_distort_undistort_pixel() {
        let model = get_sample_model();
        let ideal = Point2::new(100.0, 80.0);
        let distorted = model.distort_pixel(&ideal);
        let back = model.undistort_pixel(&distorted).unwrap();
        assert_relative_eq!(ideal, back, epsilon = 1e-6);
    }

    #[test]
    fn test_radtan_project_behind_camera() {
        let model = get_sample_model();
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, -1.0)),
            Err(CameraModelError::PointBehindCamera)
        ));
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_radtan_save_load_round_trip() {
        std::fs::create_dir_all("output").unwrap();
        let path = "output/rad_tan_model_round_trip.yaml";
        let model = get_sample_model();
        model.save_to_yaml(path).unwrap();
        let loaded = RadTanModel::load_from_yaml(path).unwrap();
        assert_eq!(model.intrinsics, loaded.intrinsics);
        assert_eq!(model.resolution, loaded.resolution);
        assert_eq!(model.distortion, loaded.distortion);
        std::fs::remove_file(path).unwrap();
    }
}
