//! Stereo rectification for two views of one calibrated camera.
//!
//! The rectified frame has its `x` axis along the baseline, pointing from
//! the left to the right camera centre, so a scene point has the same row in
//! both rectified images and a positive disparity `u_left - u_right`.

use crate::camera::pinhole::PinholeModel;
use crate::camera::projection::distort_normalized;
use crate::camera::rad_tan::{undistort_normalized, RadTanModel};
use crate::camera::{CameraModelError, Intrinsics, Resolution};
use crate::geometry::Pose;
use crate::stereo::{RectifiedStereoPair, StereoGeometry};
use image::{ImageBuffer, Pixel, RgbImage};
use log::info;
use nalgebra::{Matrix3, Point2, Vector2, Vector3};

/// Rotations taking each camera into the common rectified frame.
#[derive(Debug, Clone)]
pub struct RectificationTransforms {
    /// Left camera coordinates to rectified coordinates.
    pub r1: Matrix3<f64>,
    /// Right camera coordinates to rectified coordinates.
    pub r2: Matrix3<f64>,
    /// Camera matrix shared by both rectified views.
    pub camera: PinholeModel,
    pub baseline: f64,
}

/// Rectifying rotations for the relative pose `X_right = R X_left + t`.
///
/// # Errors
///
/// [`CameraModelError::InvalidBaseline`] when `|t|` vanishes.
pub fn stereo_rectify(
    relative: &Pose,
    model: &RadTanModel,
) -> Result<RectificationTransforms, CameraModelError> {
    let baseline = relative.translation().norm();
    if !(baseline > 1e-12) {
        return Err(CameraModelError::InvalidBaseline(baseline));
    }
    // right camera centre in the left frame
    let ex = relative.camera_center() / baseline;
    let helper = if ex.z.abs() < 0.9 {
        Vector3::z()
    } else {
        Vector3::y()
    };
    let ey = helper.cross(&ex).normalize();
    let ez = ex.cross(&ey).normalize();
    let r1 = Matrix3::from_columns(&[ex, ey, ez]).transpose();
    let r2 = r1 * relative.rotation().transpose();

    Ok(RectificationTransforms {
        r1,
        r2,
        camera: PinholeModel::new(model.intrinsics, model.resolution)?,
        baseline,
    })
}

/// Maps an observed pixel of a camera into its rectified view.
pub fn rectify_point(
    pixel: &Point2<f64>,
    model: &RadTanModel,
    rotation: &Matrix3<f64>,
    rectified: &Intrinsics,
) -> Result<Point2<f64>, CameraModelError> {
    let n = undistort_normalized(
        &model.intrinsics.normalize(&pixel.coords),
        &model.distortion.terms(),
    )?;
    let ray = rotation * Vector3::new(n.x, n.y, 1.0);
    if ray.z <= f64::EPSILON {
        return Err(CameraModelError::PointBehindCamera);
    }
    Ok(Point2::from(
        rectified.denormalize(&Vector2::new(ray.x / ray.z, ray.y / ray.z)),
    ))
}

/// Source pixel for every destination pixel; `None` where the ray misses
/// the source camera.
#[derive(Debug, Clone)]
pub struct RemapTable {
    width: u32,
    height: u32,
    sources: Vec<Option<(f32, f32)>>,
}

impl RemapTable {
    /// Table warping a distorted image of `model` into a distortion-free view
    /// with camera `target`, rotated by `rotation` (source to target).
    pub fn new(
        model: &RadTanModel,
        rotation: &Matrix3<f64>,
        target: &Intrinsics,
        resolution: Resolution,
    ) -> Self {
        let back = rotation.transpose();
        let terms = model.distortion.terms();
        let mut sources = Vec::with_capacity((resolution.width * resolution.height) as usize);
        for v in 0..resolution.height {
            for u in 0..resolution.width {
                let n = target.normalize(&Vector2::new(u as f64, v as f64));
                let ray = back * Vector3::new(n.x, n.y, 1.0);
                let source = (ray.z > f64::EPSILON).then(|| {
                    let (xd, yd) = distort_normalized(ray.x / ray.z, ray.y / ray.z, &terms);
                    let p = model.intrinsics.denormalize(&Vector2::new(xd, yd));
                    (p.x as f32, p.y as f32)
                });
                sources.push(source);
            }
        }
        RemapTable {
            width: resolution.width,
            height: resolution.height,
            sources,
        }
    }

    pub fn source(&self, u: u32, v: u32) -> Option<(f32, f32)> {
        self.sources
            .get((v * self.width + u) as usize)
            .copied()
            .flatten()
    }

    /// Bilinear warp; destination pixels without a source inside the image
    /// stay black.
    pub fn apply<P>(&self, image: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let (w, h) = image.dimensions();
        let mut out = ImageBuffer::<P, Vec<u8>>::new(self.width, self.height);
        for (u, v, pixel) in out.enumerate_pixels_mut() {
            let Some((x, y)) = self.source(u, v) else {
                continue;
            };
            if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
                continue;
            }
            let x0 = x.floor() as u32;
            let y0 = y.floor() as u32;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let (fx, fy) = (x - x0 as f32, y - y0 as f32);
            let p00 = image.get_pixel(x0, y0).channels();
            let p10 = image.get_pixel(x1, y0).channels();
            let p01 = image.get_pixel(x0, y1).channels();
            let p11 = image.get_pixel(x1, y1).channels();
            for (c, dst) in pixel.channels_mut().iter_mut().enumerate() {
                let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
                let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
                *dst = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }
}

/// Removes lens distortion from an image, keeping the camera matrix.
pub fn undistort_image<P>(image: &ImageBuffer<P, Vec<u8>>, model: &RadTanModel) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let resolution = Resolution {
        width: image.width(),
        height: image.height(),
    };
    RemapTable::new(model, &Matrix3::identity(), &model.intrinsics, resolution).apply(image)
}

/// Rectifies two views of `model` related by `relative`, whose translation
/// must already be metric.
pub fn rectify_pair(
    left: &RgbImage,
    right: &RgbImage,
    model: &RadTanModel,
    relative: &Pose,
) -> Result<(RectifiedStereoPair, RectificationTransforms), CameraModelError> {
    let transforms = stereo_rectify(relative, model)?;
    let resolution = Resolution {
        width: left.width(),
        height: left.height(),
    };
    let target = transforms.camera.intrinsics;
    let left_rect = RemapTable::new(model, &transforms.r1, &target, resolution).apply(left);
    let right_rect = RemapTable::new(model, &transforms.r2, &target, resolution).apply(right);
    info!(
        "rectified {}x{} pair, baseline {:.4} m",
        resolution.width, resolution.height, transforms.baseline
    );
    let geometry = StereoGeometry::new(transforms.camera.clone(), transforms.baseline, 0.0)?;
    Ok((
        RectifiedStereoPair::new(left_rect, right_rect, geometry)?,
        transforms,
    ))
}
