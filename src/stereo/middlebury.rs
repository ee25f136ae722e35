//! Middlebury `calib.txt` files.
//!
//! ```text
//! cam0=[3997.684 0 1176.728; 0 3997.684 1011.728; 0 0 1]
//! cam1=[3997.684 0 1307.839; 0 3997.684 1011.728; 0 0 1]
//! doffs=131.111
//! baseline=193.001
//! width=2964
//! height=1988
//! ```
//!
//! Only `cam0`, `cam1`, `doffs` and `baseline` are required; `width` and
//! `height` are used when present and every other key is ignored.

use crate::camera::pinhole::PinholeModel;
use crate::camera::{Intrinsics, Resolution};
use crate::stereo::StereoGeometry;
use crate::util::UtilError;
use nalgebra::Matrix3;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Middlebury baselines are given in millimetres.
pub const MILLIMETRES_PER_METRE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MiddleburyCalibration {
    pub cam0: Matrix3<f64>,
    pub cam1: Matrix3<f64>,
    /// `cx1 - cx0` in pixels.
    pub doffs: f64,
    /// Baseline in the file's units, usually millimetres.
    pub baseline: f64,
    pub resolution: Option<Resolution>,
}

fn parse_matrix(text: &str, line: usize) -> Result<Matrix3<f64>, UtilError> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| UtilError::ParseError {
            line,
            reason: format!("expected '[a b c; d e f; g h i]', got '{text}'"),
        })?;
    let values = inner
        .split(|c: char| c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|e| UtilError::ParseError {
                line,
                reason: format!("'{s}': {e}"),
            })
        })
        .collect::<Result<Vec<f64>, _>>()?;
    if values.len() != 9 {
        return Err(UtilError::ParseError {
            line,
            reason: format!("camera matrix needs 9 values, got {}", values.len()),
        });
    }
    Ok(Matrix3::from_row_slice(&values))
}

impl MiddleburyCalibration {
    pub fn parse(text: &str) -> Result<Self, UtilError> {
        let mut entries: HashMap<&str, (usize, &str)> = HashMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim(), (index + 1, value.trim()));
            }
        }

        let get = |key: &str| {
            entries
                .get(key)
                .copied()
                .ok_or_else(|| UtilError::MissingRecord(key.to_string()))
        };
        let scalar = |key: &str| -> Result<f64, UtilError> {
            let (line, value) = get(key)?;
            value.parse::<f64>().map_err(|e| UtilError::ParseError {
                line,
                reason: format!("{key}='{value}': {e}"),
            })
        };
        let optional_size = |key: &str| -> Result<Option<u32>, UtilError> {
            match entries.get(key) {
                None => Ok(None),
                Some(&(line, value)) => value
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|e| UtilError::ParseError {
                        line,
                        reason: format!("{key}='{value}': {e}"),
                    }),
            }
        };

        let (line0, cam0) = get("cam0")?;
        let (line1, cam1) = get("cam1")?;
        let resolution = match (optional_size("width")?, optional_size("height")?) {
            (Some(width), Some(height)) => Some(Resolution { width, height }),
            _ => None,
        };
        Ok(MiddleburyCalibration {
            cam0: parse_matrix(cam0, line0)?,
            cam1: parse_matrix(cam1, line1)?,
            doffs: scalar("doffs")?,
            baseline: scalar("baseline")?,
            resolution,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, UtilError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Left camera intrinsics.
    pub fn intrinsics(&self) -> Result<Intrinsics, UtilError> {
        Ok(Intrinsics::from_matrix(&self.cam0)?)
    }

    /// Geometry for pairs of the given size, with the baseline in metres.
    ///
    /// `resolution` overrides the size stored in the file, which is needed
    /// when the images were downsampled; the camera matrix is scaled to
    /// match.
    pub fn to_geometry(&self, resolution: Option<Resolution>) -> Result<StereoGeometry, UtilError> {
        let native = self.resolution;
        let target = resolution.or(native).ok_or_else(|| {
            UtilError::InvalidParams("calibration has no width/height and none was given".into())
        })?;
        let scale = match native {
            Some(n) if n.width > 0 => target.width as f64 / n.width as f64,
            _ => 1.0,
        };
        let k = self.intrinsics()?;
        let intrinsics = Intrinsics::new(k.fx * scale, k.fy * scale, k.cx * scale, k.cy * scale);
        let camera = PinholeModel::new(intrinsics, target)?;
        Ok(StereoGeometry::new(
            camera,
            self.baseline / MILLIMETRES_PER_METRE,
            self.doffs * scale,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const CALIB: &str = "cam0=[3997.684 0 1176.728; 0 3997.684 1011.728; 0 0 1]
cam1=[3997.684 0 1307.839; 0 3997.684 1011.728; 0 0 1]
doffs=131.111
baseline=193.001
width=2964
height=1988
ndisp=280
isint=0
vmin=31
vmax=257
";

    #[test]
    fn test_parse_calib() {
        let calib = MiddleburyCalibration::parse(CALIB).unwrap();
        assert_relative_eq!(calib.cam0[(0, 0)], 3997.684);
        assert_relative_eq!(calib.cam0[(0, 2)], 1176.728);
        assert_relative_eq!(calib.cam1[(0, 2)], 1307.839);
        assert_relative_eq!(calib.cam0[(2, 2)], 1.0);
        assert_relative_eq!(calib.doffs, 131.111);
        assert_relative_eq!(calib.baseline, 193.001);
        assert_eq!(
            calib.resolution,
            Some(Resolution {
                width: 2964,
                height: 1988
            })
        );
    }

    #[test]
    fn test_geometry_depth() {
        let calib = MiddleburyCalibration::parse(CALIB).unwrap();
        let geometry = calib.to_geometry(None).unwrap();
        assert_relative_eq!(geometry.baseline, 0.193001, epsilon = 1e-12);
        let z = geometry.depth(100.0).unwrap();
        assert_relative_eq!(z, 3997.684 * 0.193001 / 231.111, epsilon = 1e-9);

        // half-size images: focal length and doffs halve, depth is unchanged
        let half = calib
            .to_geometry(Some(Resolution {
                width: 1482,
                height: 994,
            }))
            .unwrap();
        assert_relative_eq!(half.depth(50.0).unwrap(), z, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let text = CALIB.replace("doffs=131.111\n", "");
        assert!(matches!(
            MiddleburyCalibration::parse(&text),
            Err(UtilError::MissingRecord(key)) if key == "doffs"
        ));
    }

    #[test]
    fn test_malformed_matrix_is_reported() {
        let text = CALIB.replace("0 0 1]\ncam1", "0 0]\ncam1");
        assert!(matches!(
            MiddleburyCalibration::parse(&text),
            Err(UtilError::ParseError { line: 1, .. })
        ));
    }
}
