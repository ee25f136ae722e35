//! Dense stereo reconstruction.
//!
//! Both reconstruction modes meet at the same interface: a
//! [`RectifiedStereoPair`] is matched into a [`DisparityField`], which
//! [`triangulate`] turns into a [`PointCloud`] with
//! `Z = fx * B / (d + doffs)`.
//!
//! * [`reconstruct::reconstruct_uncalibrated`] estimates the relative pose
//!   from matched features, rectifies and then matches densely.
//! * [`reconstruct::reconstruct_rectified`] starts from a pair that is
//!   already rectified, such as a Middlebury scene with its `calib.txt`.

pub mod disparity;
pub mod features;
pub mod middlebury;
pub mod reconstruct;
pub mod rectify;
pub mod rgbd;

pub use disparity::{compute_disparity, DisparityOptions};
pub use reconstruct::{reconstruct_rectified, reconstruct_uncalibrated, StereoOptions};

use crate::camera::pinhole::PinholeModel;
use crate::camera::{CameraModelError, Resolution};
use image::RgbImage;
use log::debug;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Smallest `d + doffs` that still yields a finite depth.
pub const MIN_DISPARITY_DENOMINATOR: f64 = 1e-6;

/// Geometry of a rectified pair: the shared left camera, the baseline in
/// metres and the principal-point offset between the two cameras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoGeometry {
    pub camera: PinholeModel,
    pub baseline: f64,
    /// `cx_right - cx_left`; zero for pairs rectified here.
    pub doffs: f64,
}

impl StereoGeometry {
    /// # Errors
    ///
    /// [`CameraModelError::InvalidBaseline`] unless `baseline > 0`.
    pub fn new(camera: PinholeModel, baseline: f64, doffs: f64) -> Result<Self, CameraModelError> {
        if !(baseline > 0.0) || !baseline.is_finite() {
            return Err(CameraModelError::InvalidBaseline(baseline));
        }
        if !doffs.is_finite() {
            return Err(CameraModelError::InvalidParams(format!(
                "disparity offset must be finite, got {doffs}"
            )));
        }
        Ok(StereoGeometry {
            camera,
            baseline,
            doffs,
        })
    }

    /// Depth of disparity `d`, or `None` where `d + doffs` is not positive.
    pub fn depth(&self, disparity: f64) -> Option<f64> {
        let denominator = disparity + self.doffs;
        if !(disparity > 0.0) || denominator <= MIN_DISPARITY_DENOMINATOR {
            return None;
        }
        Some(self.camera.intrinsics.fx * self.baseline / denominator)
    }
}

/// Two row-aligned views of one scene.
#[derive(Debug, Clone)]
pub struct RectifiedStereoPair {
    left: RgbImage,
    right: RgbImage,
    geometry: StereoGeometry,
}

impl RectifiedStereoPair {
    pub fn new(
        left: RgbImage,
        right: RgbImage,
        geometry: StereoGeometry,
    ) -> Result<Self, CameraModelError> {
        if left.dimensions() != right.dimensions() {
            return Err(CameraModelError::InvalidParams(format!(
                "left image is {:?} but right image is {:?}",
                left.dimensions(),
                right.dimensions()
            )));
        }
        Ok(RectifiedStereoPair {
            left,
            right,
            geometry,
        })
    }

    pub fn left(&self) -> &RgbImage {
        &self.left
    }

    pub fn right(&self) -> &RgbImage {
        &self.right
    }

    pub fn geometry(&self) -> &StereoGeometry {
        &self.geometry
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.left.width(),
            height: self.left.height(),
        }
    }
}

/// Per-pixel disparity of the left image; `None` marks unmatched pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityField {
    width: usize,
    height: usize,
    values: Vec<Option<f32>>,
}

impl DisparityField {
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if the value count does not match
    /// the size or a valid entry is not finite.
    pub fn new(
        width: usize,
        height: usize,
        values: Vec<Option<f32>>,
    ) -> Result<Self, CameraModelError> {
        if values.len() != width * height {
            return Err(CameraModelError::InvalidParams(format!(
                "{} disparities for a {}x{} field",
                values.len(),
                width,
                height
            )));
        }
        if values.iter().flatten().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "valid disparities must be finite".to_string(),
            ));
        }
        Ok(DisparityField {
            width,
            height,
            values,
        })
    }

    /// A field with every pixel invalid.
    pub fn invalid(width: usize, height: usize) -> Self {
        DisparityField {
            width,
            height,
            values: vec![None; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn values(&self) -> &[Option<f32>] {
        &self.values
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.values[y * self.width + x]
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|d| d.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColoredPoint {
    pub position: Point3<f64>,
    pub color: [u8; 3],
}

/// Reconstructed points; `excluded` counts pixels that produced none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<ColoredPoint>,
    pub excluded: usize,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Back-projects every valid disparity of the left image.
///
/// Pixels without disparity, or whose `d + doffs` is not positive, are
/// counted in [`PointCloud::excluded`] and never emitted.
pub fn triangulate(
    pair: &RectifiedStereoPair,
    disparity: &DisparityField,
) -> Result<PointCloud, CameraModelError> {
    let (width, height) = pair.left.dimensions();
    if (disparity.width, disparity.height) != (width as usize, height as usize) {
        return Err(CameraModelError::InvalidParams(format!(
            "disparity field is {}x{} but images are {}x{}",
            disparity.width, disparity.height, width, height
        )));
    }

    let geometry = &pair.geometry;
    let mut cloud = PointCloud::default();
    for y in 0..height {
        for x in 0..width {
            let point = disparity
                .get(x as usize, y as usize)
                .and_then(|d| geometry.depth(d as f64))
                .and_then(|z| geometry.camera.back_project(x as f64, y as f64, z));
            match point {
                Some(position) => cloud.points.push(ColoredPoint {
                    position,
                    color: pair.left.get_pixel(x, y).0,
                }),
                None => cloud.excluded += 1,
            }
        }
    }
    debug!(
        "triangulated {} points, excluded {}",
        cloud.points.len(),
        cloud.excluded
    );
    Ok(cloud)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use approx::assert_relative_eq;
    use image::Rgb;

    pub(crate) fn geometry(width: u32, height: u32, baseline: f64, doffs: f64) -> StereoGeometry {
        let camera = PinholeModel::new(
            Intrinsics::new(500.0, 500.0, width as f64 / 2.0, height as f64 / 2.0),
            Resolution { width, height },
        )
        .unwrap();
        StereoGeometry::new(camera, baseline, doffs).unwrap()
    }

    #[test]
    fn test_baseline_must_be_positive() {
        let camera = geometry(8, 8, 0.1, 0.0).camera;
        assert!(matches!(
            StereoGeometry::new(camera.clone(), 0.0, 0.0),
            Err(CameraModelError::InvalidBaseline(b)) if b == 0.0
        ));
        assert!(StereoGeometry::new(camera, -0.04, 0.0).is_err());
    }

    #[test]
    fn test_triangulate_depth_and_exclusion() {
        let left = RgbImage::from_pixel(4, 2, Rgb([10, 20, 30]));
        let pair =
            RectifiedStereoPair::new(left.clone(), left, geometry(4, 2, 0.1, 0.0)).unwrap();
        let field = DisparityField::new(
            4,
            2,
            vec![Some(10.0), None, Some(0.0), Some(-3.0), Some(25.0), None, None, None],
        )
        .unwrap();
        let cloud = triangulate(&pair, &field).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.excluded, 6);
        assert!(cloud.points.iter().all(|p| p.position.z > 0.0));

        let first = cloud.points[0];
        assert_relative_eq!(first.position.z, 500.0 * 0.1 / 10.0, epsilon = 1e-12);
        assert_relative_eq!(first.position.x, (0.0 - 2.0) * 5.0 / 500.0, epsilon = 1e-12);
        assert_eq!(first.color, [10, 20, 30]);
    }

    #[test]
    fn test_disparity_offset_enters_depth() {
        let g = geometry(4, 4, 0.2, 30.0);
        assert_relative_eq!(g.depth(20.0).unwrap(), 500.0 * 0.2 / 50.0, epsilon = 1e-12);
        let g = geometry(4, 4, 0.2, -20.0);
        assert_eq!(g.depth(15.0), None);
    }

    #[test]
    fn test_field_rejects_bad_shapes() {
        assert!(DisparityField::new(2, 2, vec![None; 3]).is_err());
        assert!(DisparityField::new(1, 1, vec![Some(f32::NAN)]).is_err());
        let field = DisparityField::invalid(3, 2);
        assert_eq!(field.valid_count(), 0);
        assert_eq!(field.get(5, 0), None);
    }
}
