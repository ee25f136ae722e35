//! Implements the Pinhole camera model.
//!
//! This module provides the [`PinholeModel`] struct, the distortion-free
//! camera used for rectified stereo views and for back-projecting depth
//! images. It adheres to the [`CameraModel`] trait defined in the parent
//! `camera` module ([`crate::camera`]).

use crate::camera::{
    validation, CalibrationParams, CameraModel, CameraModelError, Distortion, Intrinsics,
    RadTanModel, Resolution,
};
use nalgebra::{Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Represents a Pinhole camera model.
///
/// # Examples
///
/// ```rust
/// use camera_geometry_tools::camera::pinhole::PinholeModel;
/// use camera_geometry_tools::camera::{Intrinsics, Resolution};
///
/// let model = PinholeModel::new(
///     Intrinsics::new(500.0, 500.0, 320.0, 240.0),
///     Resolution { width: 640, height: 480 },
/// )
/// .unwrap();
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.resolution.width, 640);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinholeModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
}

impl PinholeModel {
    pub fn new(intrinsics: Intrinsics, resolution: Resolution) -> Result<Self, CameraModelError> {
        let model = PinholeModel {
            intrinsics,
            resolution,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Back-projects a pixel at metric depth `z` into camera coordinates.
    ///
    /// Returns `None` for non-positive or non-finite depths.
    pub fn back_project(&self, u: f64, v: f64, z: f64) -> Option<Point3<f64>> {
        if !(z > 0.0) || !z.is_finite() {
            return None;
        }
        Some(Point3::from(
            self.intrinsics.back_project(&Vector2::new(u, v), z),
        ))
    }

    /// The same camera with a zero-length distortion vector.
    pub fn to_rad_tan(&self) -> RadTanModel {
        RadTanModel {
            intrinsics: self.intrinsics,
            resolution: self.resolution,
            distortion: Distortion::default(),
        }
    }
}

impl CameraModel for PinholeModel {
    /// Projects a camera-frame point to pixel coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointBehindCamera`] for negative depth.
    /// * [`CameraModelError::PointAtCameraCenter`] for depth near zero.
    /// * [`CameraModelError::ProjectionOutSideImage`] when outside the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < -f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointBehindCamera);
        }
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let u = self.intrinsics.fx * point_3d.x / point_3d.z + self.intrinsics.cx;
        let v = self.intrinsics.fy * point_3d.y / point_3d.z + self.intrinsics.cy;

        if u < 0.0
            || u >= self.resolution.width as f64
            || v < 0.0
            || v >= self.resolution.height as f64
        {
            return Err(CameraModelError::ProjectionOutSideImage);
        }

        Ok(Vector2::new(u, v))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if point_2d.x < 0.0
            || point_2d.x >= self.resolution.width as f64
            || point_2d.y < 0.0
            || point_2d.y >= self.resolution.height as f64
        {
            return Err(CameraModelError::PointIsOutSideImage);
        }

        let n = self.intrinsics.normalize(point_2d);
        Ok(Vector3::new(n.x, n.y, 1.0).normalize())
    }

    /// Loads a calibration parameter file, refusing one with non-zero distortion.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let model = CalibrationParams::load_from_yaml(path)?.to_model()?;
        if !model.distortion.is_zero() {
            return Err(CameraModelError::InvalidParams(
                "pinhole model cannot carry distortion coefficients".to_string(),
            ));
        }
        PinholeModel::new(model.intrinsics, model.resolution)
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        CalibrationParams::from_model(&self.to_rad_tan(), None).save_to_yaml(path)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_distortion(&self) -> Vec<f64> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> PinholeModel {
        PinholeModel::new(
            Intrinsics::new(1200.0, 1200.0, 960.0, 540.0),
            Resolution {
                width: 1920,
                height: 1080,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_pinhole_project_unproject() {
        let model = sample_model();
        let point_3d = Vector3::new(0.2, -0.1, 1.5);
        let pixel = model.project(&point_3d).unwrap();
        let ray = model.unproject(&pixel).unwrap();
        assert_relative_eq!(ray, point_3d.normalize(), epsilon = 1e-12);
    }

    #[test]
    fn test_pinhole_back_project_depth() {
        let model = sample_model();
        let p = model.back_project(1080.0, 660.0, 0.5).unwrap();
        assert_relative_eq!(p, Point3::new(0.05, 0.05, 0.5), epsilon = 1e-12);
        assert!(model.back_project(10.0, 10.0, 0.0).is_none());
        assert!(model.back_project(10.0, 10.0, f64::NAN).is_none());
    }

    #[test]
    fn test_pinhole_save_and_load() {
        std::fs::create_dir_all("output").unwrap();
        let path = "output/pinhole_saved.yaml";
        let model = sample_model();
        model.save_to_yaml(path).unwrap();
        let loaded = PinholeModel::load_from_yaml(path).unwrap();
        assert_eq!(model.intrinsics, loaded.intrinsics);
        assert_eq!(model.resolution, loaded.resolution);
        std::fs::remove_file(path).unwrap();
    }
}
