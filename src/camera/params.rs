//! Calibration parameter record.
//!
//! The record is a flat YAML mapping:
//!
//! ```yaml
//! image_width: 1920
//! image_height: 1080
//! camera_matrix: [1200.0, 0.0, 960.0, 0.0, 1200.0, 540.0, 0.0, 0.0, 1.0]
//! distortion_coefficients: [-0.1, 0.01, 0.0, 0.0, 0.0]
//! rms_reprojection_error: 0.21
//! ```
//!
//! Floats are written with their shortest exact representation, so a
//! save/load cycle reproduces every value bit for bit.

use crate::camera::{CameraModelError, Distortion, Intrinsics, RadTanModel, Resolution};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::{fs, io::Write};
use yaml_rust::{Yaml, YamlLoader};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub image_width: u32,
    pub image_height: u32,
    /// Row-major 3x3 camera matrix.
    pub camera_matrix: [f64; 9],
    pub distortion_coefficients: Vec<f64>,
    pub rms_reprojection_error: Option<f64>,
}

fn yaml_f64(node: &Yaml) -> Option<f64> {
    match node {
        Yaml::Real(_) => node.as_f64(),
        Yaml::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

fn yaml_f64_list(doc: &Yaml, key: &str) -> Result<Vec<f64>, CameraModelError> {
    let list = doc[key]
        .as_vec()
        .ok_or_else(|| CameraModelError::InvalidParams(format!("Missing {}", key)))?;
    list.iter()
        .enumerate()
        .map(|(i, v)| {
            yaml_f64(v).ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Invalid {} entry at index {}", key, i))
            })
        })
        .collect()
}

impl CalibrationParams {
    pub fn from_model(model: &RadTanModel, rms: Option<f64>) -> Self {
        let k = model.intrinsics.matrix();
        let mut camera_matrix = [0.0; 9];
        for r in 0..3 {
            for c in 0..3 {
                camera_matrix[r * 3 + c] = k[(r, c)];
            }
        }
        CalibrationParams {
            image_width: model.resolution.width,
            image_height: model.resolution.height,
            camera_matrix,
            distortion_coefficients: model.distortion.coefficients().to_vec(),
            rms_reprojection_error: rms,
        }
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::from_row_slice(&self.camera_matrix)
    }

    pub fn to_model(&self) -> Result<RadTanModel, CameraModelError> {
        RadTanModel::from_parts(
            Intrinsics::from_matrix(&self.camera_matrix())?,
            Resolution {
                width: self.image_width,
                height: self.image_height,
            },
            Distortion::new(self.distortion_coefficients.clone())?,
        )
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, CameraModelError> {
        let docs = YamlLoader::load_from_str(contents)?;
        let doc = docs.first().ok_or_else(|| {
            CameraModelError::InvalidParams("Empty YAML document".to_string())
        })?;

        let dimension = |key: &str| -> Result<u32, CameraModelError> {
            doc[key]
                .as_i64()
                .filter(|v| *v >= 0 && *v <= u32::MAX as i64)
                .map(|v| v as u32)
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {}", key)))
        };

        let matrix = yaml_f64_list(doc, "camera_matrix")?;
        let camera_matrix: [f64; 9] = matrix.as_slice().try_into().map_err(|_| {
            CameraModelError::InvalidParams(format!(
                "camera_matrix must have 9 values, found {}",
                matrix.len()
            ))
        })?;

        let rms_reprojection_error = match &doc["rms_reprojection_error"] {
            Yaml::BadValue | Yaml::Null => None,
            node => Some(yaml_f64(node).ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid rms_reprojection_error".to_string())
            })?),
        };

        Ok(CalibrationParams {
            image_width: dimension("image_width")?,
            image_height: dimension("image_height")?,
            camera_matrix,
            distortion_coefficients: yaml_f64_list(doc, "distortion_coefficients")?,
            rms_reprojection_error,
        })
    }

    pub fn to_yaml_string(&self) -> Result<String, CameraModelError> {
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(
            serde_yaml::Value::String("image_width".to_string()),
            serde_yaml::Value::from(self.image_width),
        );
        mapping.insert(
            serde_yaml::Value::String("image_height".to_string()),
            serde_yaml::Value::from(self.image_height),
        );
        mapping.insert(
            serde_yaml::Value::String("camera_matrix".to_string()),
            serde_yaml::to_value(self.camera_matrix.to_vec())
                .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        );
        mapping.insert(
            serde_yaml::Value::String("distortion_coefficients".to_string()),
            serde_yaml::to_value(&self.distortion_coefficients)
                .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        );
        if let Some(rms) = self.rms_reprojection_error {
            mapping.insert(
                serde_yaml::Value::String("rms_reprojection_error".to_string()),
                serde_yaml::Value::from(rms),
            );
        }
        serde_yaml::to_string(&mapping).map_err(|e| CameraModelError::YamlError(e.to_string()))
    }

    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml_string = self.to_yaml_string()?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }
}
