//! Back-projection of registered depth and colour images.

use crate::camera::pinhole::PinholeModel;
use crate::camera::CameraModelError;
use crate::stereo::{ColoredPoint, PointCloud};
use image::{ImageBuffer, Luma, RgbImage};
use log::debug;
use serde::{Deserialize, Serialize};

/// 16-bit depth image, one raw depth unit per pixel.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthImageOptions {
    /// Raw units per metre; 5000 for the TUM RGB-D datasets.
    pub depth_scale: f64,
    /// Depths beyond this many metres are dropped.
    pub truncation: f64,
}

impl Default for DepthImageOptions {
    fn default() -> Self {
        DepthImageOptions {
            depth_scale: 5000.0,
            truncation: 3.0,
        }
    }
}

/// Colour point for every pixel with a depth in `(0, truncation]`.
///
/// Zero (missing) and truncated depths are counted in
/// [`PointCloud::excluded`].
pub fn back_project_depth(
    depth: &DepthImage,
    color: &RgbImage,
    camera: &PinholeModel,
    options: &DepthImageOptions,
) -> Result<PointCloud, CameraModelError> {
    if depth.dimensions() != color.dimensions() {
        return Err(CameraModelError::InvalidParams(format!(
            "depth image is {:?} but colour image is {:?}",
            depth.dimensions(),
            color.dimensions()
        )));
    }
    if !(options.depth_scale > 0.0) {
        return Err(CameraModelError::InvalidParams(format!(
            "depth scale must be positive, got {}",
            options.depth_scale
        )));
    }

    let mut cloud = PointCloud::default();
    for (x, y, raw) in depth.enumerate_pixels() {
        let z = raw[0] as f64 / options.depth_scale;
        let point = (z <= options.truncation)
            .then(|| camera.back_project(x as f64, y as f64, z))
            .flatten();
        match point {
            Some(position) => cloud.points.push(ColoredPoint {
                position,
                color: color.get_pixel(x, y).0,
            }),
            None => cloud.excluded += 1,
        }
    }
    debug!(
        "depth image: {} points, {} excluded",
        cloud.len(),
        cloud.excluded
    );
    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use approx::assert_relative_eq;
    use image::Rgb;

    fn camera() -> PinholeModel {
        PinholeModel::new(
            Intrinsics::new(525.0, 525.0, 1.0, 1.0),
            Resolution {
                width: 3,
                height: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_back_project_depth() {
        // 1 m, missing, 2.5 m, 4 m (truncated), 0.5 m, 3 m
        let depth = DepthImage::from_raw(3, 2, vec![5000, 0, 12500, 20000, 2500, 15000]).unwrap();
        let color = RgbImage::from_fn(3, 2, |x, y| Rgb([x as u8, y as u8, 7]));
        let cloud =
            back_project_depth(&depth, &color, &camera(), &DepthImageOptions::default()).unwrap();

        assert_eq!(cloud.len(), 4);
        assert_eq!(cloud.excluded, 2);
        assert!(cloud.points.iter().all(|p| p.position.z > 0.0));

        let first = cloud.points[0];
        assert_relative_eq!(first.position.z, 1.0, epsilon = 1e-12);
        assert_relative_eq!(first.position.x, -1.0 / 525.0, epsilon = 1e-12);
        assert_eq!(first.color, [0, 0, 7]);
        assert_relative_eq!(cloud.points[3].position.z, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mismatched_sizes_fail() {
        let depth = DepthImage::new(3, 2);
        let color = RgbImage::new(2, 2);
        assert!(back_project_depth(&depth, &color, &camera(), &DepthImageOptions::default()).is_err());
    }
}
