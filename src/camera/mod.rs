//! Core camera types shared by every stage of the pipeline.
//!
//! This module defines the pinhole [`Intrinsics`], the image [`Resolution`],
//! the variable-length [`Distortion`] coefficients, the crate-wide
//! [`CameraModelError`] and the [`CameraModel`] trait implemented by the
//! concrete models in the submodules.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod params;
pub mod pinhole;
pub mod projection;
pub mod rad_tan;

pub use params::CalibrationParams;
pub use pinhole::PinholeModel;
pub use projection::{project_points, verify_projection};
pub use rad_tan::RadTanModel;

/// Focal lengths and principal point in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Intrinsics { fx, fy, cx, cy }
    }

    /// The 3x3 camera matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Reads `fx, fy, cx, cy` from a camera matrix, rejecting non-zero skew.
    pub fn from_matrix(k: &Matrix3<f64>) -> Result<Self, CameraModelError> {
        if k[(0, 1)].abs() > 1e-9 || k[(1, 0)].abs() > 1e-9 || k[(2, 0)] != 0.0 || k[(2, 1)] != 0.0
        {
            return Err(CameraModelError::InvalidParams(
                "camera matrix must be upper triangular without skew".to_string(),
            ));
        }
        if (k[(2, 2)] - 1.0).abs() > 1e-12 {
            return Err(CameraModelError::InvalidParams(format!(
                "camera matrix must have K[2][2] = 1, found {}",
                k[(2, 2)]
            )));
        }
        let intrinsics = Intrinsics::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
        validation::validate_intrinsics(&intrinsics)?;
        Ok(intrinsics)
    }

    /// Maps a pixel to the normalized image plane (no distortion handling).
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    /// Maps a normalized image point to pixels.
    pub fn denormalize(&self, point: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(self.fx * point.x + self.cx, self.fy * point.y + self.cy)
    }

    /// Back-projects a pixel with known depth into the camera frame.
    pub fn back_project(&self, pixel: &Vector2<f64>, depth: f64) -> Vector3<f64> {
        let n = self.normalize(pixel);
        Vector3::new(n.x * depth, n.y * depth, depth)
    }

    /// Rough guess used when an image has never been calibrated:
    /// `fx = fy = 0.9 * max(width, height)` and a centred principal point.
    pub fn guess_from_resolution(resolution: &Resolution) -> Self {
        let f = 0.9 * resolution.width.max(resolution.height) as f64;
        Intrinsics::new(
            f,
            f,
            resolution.width as f64 / 2.0,
            resolution.height as f64 / 2.0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Maximum number of coefficients understood by the projection model.
pub const MAX_DISTORTION_TERMS: usize = 8;

/// Lens distortion coefficients in the order `k1, k2, p1, p2, k3, k4, k5, k6`.
///
/// Any prefix of that sequence is accepted; the missing trailing terms are zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    coefficients: Vec<f64>,
}

impl Distortion {
    pub fn new(coefficients: Vec<f64>) -> Result<Self, CameraModelError> {
        let distortion = Distortion { coefficients };
        validation::validate_distortion(&distortion)?;
        Ok(distortion)
    }

    /// All-zero coefficients of the given length.
    pub fn zeros(len: usize) -> Self {
        Distortion {
            coefficients: vec![0.0; len.min(MAX_DISTORTION_TERMS)],
        }
    }

    /// Only `k1` active, used by the straightness sweep.
    pub fn radial_k1(k1: f64) -> Self {
        Distortion {
            coefficients: vec![k1, 0.0, 0.0, 0.0, 0.0],
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// The coefficients padded with zeros to the full eight terms.
    pub fn terms(&self) -> [f64; MAX_DISTORTION_TERMS] {
        let mut terms = [0.0; MAX_DISTORTION_TERMS];
        for (dst, src) in terms.iter_mut().zip(self.coefficients.iter()) {
            *dst = *src;
        }
        terms
    }

    pub fn is_zero(&self) -> bool {
        self.coefficients.iter().all(|c| *c == 0.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Point is behind the camera")]
    PointBehindCamera,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Insufficient data: need at least {required}, found {found}")]
    InsufficientData { required: usize, found: usize },
    #[error("Pattern with {columns}x{rows} inner corners not found")]
    PatternNotFound { columns: usize, rows: usize },
    #[error("Degenerate point configuration: {0}")]
    DegenerateConfiguration(String),
    #[error("Optimization did not converge ({reason}), last residual {residual}")]
    NonConvergence { residual: f64, reason: String },
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Baseline must be positive and finite, got {0}")]
    InvalidBaseline(f64),
    #[error("Projection models disagree by up to {max_deviation} px")]
    ModelMismatch { max_deviation: f64 },
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Whether a successful result should be trusted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Quality {
    Nominal,
    /// Usable, but a quality metric crossed its warning threshold.
    Degraded { reason: String },
}

impl Quality {
    pub fn is_nominal(&self) -> bool {
        matches!(self, Quality::Nominal)
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit ray in camera coordinates
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0)
            || !intrinsics.fx.is_finite()
            || !intrinsics.fy.is_finite()
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_distortion(distortion: &Distortion) -> Result<(), CameraModelError> {
        if distortion.len() > MAX_DISTORTION_TERMS {
            return Err(CameraModelError::InvalidParams(format!(
                "at most {} distortion coefficients are supported, got {}",
                MAX_DISTORTION_TERMS,
                distortion.len()
            )));
        }
        if let Some(i) = distortion.coefficients().iter().position(|c| !c.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "distortion coefficient {} is not finite",
                i
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_intrinsics_matrix_round_trip() {
        let intrinsics = Intrinsics::new(1200.0, 1180.0, 960.0, 540.0);
        let k = intrinsics.matrix();
        let back = Intrinsics::from_matrix(&k).unwrap();
        assert_eq!(intrinsics, back);
    }

    #[test]
    fn test_intrinsics_reject_non_positive_focal() {
        let k = Matrix3::new(0.0, 0.0, 10.0, 0.0, 5.0, 10.0, 0.0, 0.0, 1.0);
        assert!(matches!(
            Intrinsics::from_matrix(&k),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }

    #[test]
    fn test_normalize_back_project() {
        let intrinsics = Intrinsics::new(1200.0, 1200.0, 960.0, 540.0);
        let p = intrinsics.back_project(&Vector2::new(1080.0, 660.0), 0.5);
        assert_relative_eq!(p, Vector3::new(0.05, 0.05, 0.5), epsilon = 1e-12);
    }

    #[test]
    fn test_guess_from_resolution() {
        let guess = Intrinsics::guess_from_resolution(&Resolution {
            width: 1920,
            height: 1080,
        });
        assert_relative_eq!(guess.fx, 1728.0);
        assert_relative_eq!(guess.cx, 960.0);
        assert_relative_eq!(guess.cy, 540.0);
    }

    #[test]
    fn test_distortion_padding_and_validation() {
        let d = Distortion::new(vec![0.1, -0.2, 0.001, 0.002]).unwrap();
        assert_eq!(d.terms(), [0.1, -0.2, 0.001, 0.002, 0.0, 0.0, 0.0, 0.0]);
        assert!(Distortion::new(vec![0.0; 9]).is_err());
        assert!(Distortion::new(vec![f64::NAN]).is_err());
        assert!(Distortion::zeros(5).is_zero());
    }
}
