//! Error statistics, file helpers and the persistence formats used around
//! the core geometry: extrinsics tables, point files, PLY clouds and
//! disparity visualizations.

use crate::camera::projection::project_points;
use crate::camera::{CameraModelError, Distortion, Intrinsics};
use crate::geometry::{CorrespondenceSet, Pose};
use image::{GrayImage, RgbImage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

pub mod extrinsics;
pub mod ply;
pub mod points;
pub mod visualize;

/// Ensure the output directory exists
pub fn ensure_output_dir() -> Result<(), UtilError> {
    let output_dir = Path::new("output");
    if !output_dir.exists() {
        fs::create_dir_all(output_dir).map_err(|e| {
            UtilError::InvalidParams(format!("Failed to create output directory: {e}"))
        })?;
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },
    #[error("No record for {0}")]
    MissingRecord(String),
    #[error("IO error: {0}")]
    IOError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("Image error: {0}")]
    ImageError(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

impl From<std::io::Error> for UtilError {
    fn from(err: std::io::Error) -> Self {
        UtilError::IOError(err.to_string())
    }
}

impl From<csv::Error> for UtilError {
    fn from(err: csv::Error) -> Self {
        UtilError::CsvError(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for UtilError {
    fn from(err: bincode::error::EncodeError) -> Self {
        UtilError::IOError(err.to_string())
    }
}

impl From<image::ImageError> for UtilError {
    fn from(err: image::ImageError) -> Self {
        UtilError::ImageError(err.to_string())
    }
}

/// Summary statistics of per-point pixel errors.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Statistics over non-negative per-point errors.
    ///
    /// An empty slice has no statistics and is reported as insufficient data.
    pub fn from_residuals(errors: &[f64]) -> Result<Self, CameraModelError> {
        if errors.is_empty() {
            return Err(CameraModelError::InsufficientData {
                required: 1,
                found: 0,
            });
        }
        if errors.iter().any(|e| !e.is_finite()) {
            return Err(CameraModelError::NumericalError(
                "non-finite reprojection error".to_string(),
            ));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x * x).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Per-point pixel distance between the observations and the projection of
/// the object points; `None` where the point falls behind the camera.
pub fn reprojection_residuals(
    set: &CorrespondenceSet,
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    pose: &Pose,
) -> Vec<Option<f64>> {
    project_points(set.object_points(), intrinsics, distortion, pose)
        .into_iter()
        .zip(set.image_points().iter())
        .map(|(projected, observed)| projected.map(|p| (p - observed).norm()))
        .collect()
}

/// Reprojection statistics of one view.
///
/// Points behind the camera make the whole view invalid.
pub fn compute_reprojection_error(
    set: &CorrespondenceSet,
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    pose: &Pose,
) -> Result<ProjectionError, CameraModelError> {
    let residuals = reprojection_residuals(set, intrinsics, distortion, pose);
    let errors: Option<Vec<f64>> = residuals.into_iter().collect();
    match errors {
        Some(errors) => ProjectionError::from_residuals(&errors),
        None => Err(CameraModelError::PointBehindCamera),
    }
}

/// Load an image from file as RGB.
pub fn load_image(image_path: &str) -> Result<RgbImage, UtilError> {
    Ok(image::open(image_path)?.to_rgb8())
}

/// Load an image from file as 8-bit grayscale.
pub fn load_gray_image(image_path: &str) -> Result<GrayImage, UtilError> {
    Ok(image::open(image_path)?.to_luma8())
}

/// Reads an options struct from a `.json` file, or from YAML otherwise.
///
/// Missing fields are an error; start from a serialized `Default` to get a
/// complete file.
pub fn load_options<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, UtilError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&contents).map_err(|e| UtilError::InvalidParams(e.to_string()))
    } else {
        serde_yaml::from_str(&contents)
            .map_err(|e| UtilError::Camera(CameraModelError::YamlError(e.to_string())))
    }
}
