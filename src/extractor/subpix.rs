//! Sub-pixel corner refinement.
//!
//! At a saddle point every image gradient in the neighbourhood is orthogonal
//! to the vector from the corner to the gradient's location. Each iteration
//! solves the weighted normal equations
//! `sum(w g g^T) c = sum(w g g^T q)` over a square window and re-centres the
//! window on `c`, until the shift drops below `epsilon`.

use crate::extractor::{sample_bilinear, GrayF32};
use log::debug;
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPixOptions {
    /// Half-size of the search window; `5` gives an 11x11 window.
    pub half_window: u32,
    pub max_iterations: usize,
    /// Stop once the corner moves less than this many pixels.
    pub epsilon: f64,
}

impl Default for SubPixOptions {
    fn default() -> Self {
        SubPixOptions {
            half_window: 5,
            max_iterations: 100,
            epsilon: 1e-3,
        }
    }
}

/// Refines one corner, or `None` when the iteration is singular or leaves
/// the search window.
pub fn refine_corner(
    image: &GrayF32,
    corner: &Point2<f64>,
    options: &SubPixOptions,
) -> Option<Point2<f64>> {
    let half = options.half_window as i32;
    let sigma = (options.half_window as f64 / 2.0).max(0.5);
    let mut current = *corner;

    for _ in 0..options.max_iterations {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();
        for dy in -half..=half {
            for dx in -half..=half {
                let q = Vector2::new(current.x + dx as f64, current.y + dy as f64);
                let (x, y) = (q.x as f32, q.y as f32);
                let gx = (sample_bilinear(image, x + 1.0, y) - sample_bilinear(image, x - 1.0, y))
                    as f64
                    / 2.0;
                let gy = (sample_bilinear(image, x, y + 1.0) - sample_bilinear(image, x, y - 1.0))
                    as f64
                    / 2.0;
                let w = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma * sigma)).exp();
                let g = Vector2::new(gx, gy);
                let ggt = g * g.transpose() * w;
                a += ggt;
                b += ggt * q;
            }
        }
        if a.determinant().abs() < 1e-9 {
            return None;
        }
        let next = Point2::from(a.try_inverse()? * b);
        if (next - corner).norm() > options.half_window as f64 {
            return None;
        }
        let shift = (next - current).norm();
        current = next;
        if shift < options.epsilon {
            break;
        }
    }
    Some(current)
}

/// Refines every corner, keeping the coarse location where refinement fails.
pub fn refine_corners(
    image: &GrayF32,
    corners: &[Point2<f64>],
    options: &SubPixOptions,
) -> Vec<Point2<f64>> {
    corners
        .iter()
        .map(|c| {
            refine_corner(image, c, options).unwrap_or_else(|| {
                debug!("sub-pixel refinement diverged at ({:.1}, {:.1})", c.x, c.y);
                *c
            })
        })
        .collect()
}
