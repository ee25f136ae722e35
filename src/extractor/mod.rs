//! Planar-target correspondence extraction.
//!
//! Finds the inner corners of a chessboard in a grayscale image and pairs
//! them with the target's object points. Corners are returned row-major in
//! the same order as [`object_points`]: the first row runs along increasing
//! image `u`, and rows advance so that the board's `x`/`y` axes keep a
//! right-handed orientation in the image.

pub mod chessboard;
pub mod subpix;

pub use chessboard::find_chessboard_corners;
pub use subpix::{refine_corners, SubPixOptions};

use crate::camera::CameraModelError;
use crate::geometry::CorrespondenceSet;
use image::{GrayImage, ImageBuffer, Luma};
use log::{info, warn};
use nalgebra::{Point2, Point3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Single-channel floating point image used by the detectors.
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Inner-corner count of a chessboard target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    pub columns: usize,
    pub rows: usize,
}

impl GridSize {
    pub fn new(columns: usize, rows: usize) -> Self {
        GridSize { columns, rows }
    }

    pub fn swapped(&self) -> Self {
        GridSize {
            columns: self.rows,
            rows: self.columns,
        }
    }

    pub fn count(&self) -> usize {
        self.columns * self.rows
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorOptions {
    /// Gaussian sigma applied before the saddle response.
    pub blur_sigma: f32,
    /// Saddle responses below this fraction of the strongest are dropped.
    pub relative_threshold: f32,
    /// Radius of the non-maximum suppression window, in pixels.
    pub nms_radius: u32,
    /// Radius of the ring sampled to confirm an X-junction.
    pub ring_radius: f32,
    /// Minimum grey-level spread on the ring.
    pub min_contrast: f32,
    /// Run sub-pixel refinement on the detected corners.
    pub refine: bool,
    pub subpix: SubPixOptions,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        ExtractorOptions {
            blur_sigma: 1.5,
            relative_threshold: 0.05,
            nms_radius: 3,
            ring_radius: 5.0,
            min_contrast: 20.0,
            refine: true,
            subpix: SubPixOptions::default(),
        }
    }
}

/// Object points of a planar grid with `square` pitch on `Z = 0`.
///
/// `x` varies fastest, so index `j * columns + i` is `(i * square, j * square, 0)`.
pub fn object_points(grid: GridSize, square: f64) -> Vec<Point3<f64>> {
    (0..grid.rows)
        .flat_map(|j| {
            (0..grid.columns).map(move |i| Point3::new(i as f64 * square, j as f64 * square, 0.0))
        })
        .collect()
}

pub(crate) fn to_f32(image: &GrayImage) -> GrayF32 {
    GrayF32::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[0] as f32])
    })
}

/// Separable Gaussian blur with a `3 sigma` kernel and clamped borders.
pub(crate) fn gaussian_blur(image: &GrayF32, sigma: f32) -> GrayF32 {
    if sigma <= 0.0 {
        return image.clone();
    }
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);

    let (w, h) = (image.width() as i64, image.height() as i64);
    let horizontal = GrayF32::from_fn(image.width(), image.height(), |x, y| {
        let value = kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| {
                let xx = (x as i64 + k as i64 - radius).clamp(0, w - 1);
                weight * image.get_pixel(xx as u32, y)[0]
            })
            .sum();
        Luma([value])
    });
    GrayF32::from_fn(image.width(), image.height(), |x, y| {
        let value = kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| {
                let yy = (y as i64 + k as i64 - radius).clamp(0, h - 1);
                weight * horizontal.get_pixel(x, yy as u32)[0]
            })
            .sum();
        Luma([value])
    })
}

/// Bilinear sample with coordinates clamped to the image.
pub(crate) fn sample_bilinear(image: &GrayF32, x: f32, y: f32) -> f32 {
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0)[0];
    let p10 = image.get_pixel(x1, y0)[0];
    let p01 = image.get_pixel(x0, y1)[0];
    let p11 = image.get_pixel(x1, y1)[0];
    (p00 * (1.0 - fx) + p10 * fx) * (1.0 - fy) + (p01 * (1.0 - fx) + p11 * fx) * fy
}

/// Tries `grid`, then the swapped grid, returning the size that matched.
///
/// # Errors
///
/// [`CameraModelError::PatternNotFound`] naming the original grid when
/// neither orientation is found.
pub fn find_with_swap(
    image: &GrayImage,
    grid: GridSize,
    options: &ExtractorOptions,
) -> Result<(GridSize, Vec<Point2<f64>>), CameraModelError> {
    match find_chessboard_corners(image, grid, options) {
        Ok(corners) => Ok((grid, corners)),
        Err(CameraModelError::PatternNotFound { .. }) if grid.columns != grid.rows => {
            let swapped = grid.swapped();
            let corners = find_chessboard_corners(image, swapped, options).map_err(|_| {
                CameraModelError::PatternNotFound {
                    columns: grid.columns,
                    rows: grid.rows,
                }
            })?;
            info!(
                "pattern found as {}x{} instead of {}x{}",
                swapped.columns, swapped.rows, grid.columns, grid.rows
            );
            Ok((swapped, corners))
        }
        Err(e) => Err(e),
    }
}

/// Detects the target and pairs its corners with the object points.
pub fn extract_correspondences(
    image: &GrayImage,
    grid: GridSize,
    square: f64,
    options: &ExtractorOptions,
) -> Result<CorrespondenceSet, CameraModelError> {
    let corners = find_chessboard_corners(image, grid, options)?;
    CorrespondenceSet::new(object_points(grid, square), corners)
}

/// Outcome of [`extract_batch`], keeping the input order within each list.
#[derive(Debug)]
pub struct BatchExtraction {
    pub accepted: Vec<(String, CorrespondenceSet)>,
    pub rejected: Vec<(String, CameraModelError)>,
}

/// Extracts correspondences from named images in parallel.
pub fn extract_batch(
    images: &[(String, GrayImage)],
    grid: GridSize,
    square: f64,
    options: &ExtractorOptions,
) -> BatchExtraction {
    let results: Vec<(String, Result<CorrespondenceSet, CameraModelError>)> = images
        .par_iter()
        .map(|(name, image)| {
            (
                name.clone(),
                extract_correspondences(image, grid, square, options),
            )
        })
        .collect();

    let mut batch = BatchExtraction {
        accepted: Vec::new(),
        rejected: Vec::new(),
    };
    for (name, result) in results {
        match result {
            Ok(set) => batch.accepted.push((name, set)),
            Err(e) => {
                warn!("{}: {}", name, e);
                batch.rejected.push((name, e));
            }
        }
    }
    info!(
        "extracted {} of {} images",
        batch.accepted.len(),
        images.len()
    );
    batch
}
