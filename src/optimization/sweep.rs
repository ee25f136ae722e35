//! One-dimensional grid search over a scalar parameter.
//!
//! [`ParameterSweep`] evaluates a quality functional at evenly spaced values
//! and keeps the best one. The k1 straightness search is the main user: it
//! undistorts detected grid corners with a single radial coefficient and
//! scores how straight the grid rows and columns become.

use crate::camera::rad_tan::undistort_normalized;
use crate::camera::{CameraModelError, Distortion, Intrinsics};
use crate::extractor::GridSize;
use log::{debug, info};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// `n` evenly spaced values from `start` to `end`, both included.
///
/// `n == 1` yields `[start]`.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOptions {
    pub start: f64,
    pub end: f64,
    /// Number of samples; values below two are raised to two.
    pub steps: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        SweepOptions {
            start: -0.6,
            end: 0.6,
            steps: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    /// Best `(value, score)`, or `None` when no sample could be scored.
    pub best: Option<(f64, f64)>,
    /// Every sample in sweep order; `None` where the functional failed.
    pub samples: Vec<(f64, Option<f64>)>,
}

/// Grid search minimizing a score.
#[derive(Debug, Clone)]
pub struct ParameterSweep {
    values: Vec<f64>,
}

impl ParameterSweep {
    pub fn new(options: &SweepOptions) -> Self {
        ParameterSweep {
            values: linspace(options.start, options.end, options.steps.max(2)),
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Evaluates `score` at every value; lower is better.
    ///
    /// Samples whose functional returns `None` or a non-finite score are
    /// skipped. Ties keep the earliest value.
    pub fn run<F>(&self, mut score: F) -> SweepResult
    where
        F: FnMut(f64) -> Option<f64>,
    {
        let mut best: Option<(f64, f64)> = None;
        let mut samples = Vec::with_capacity(self.values.len());
        for &value in &self.values {
            let s = score(value).filter(|s| s.is_finite());
            debug!("sweep value {:.4}: {:?}", value, s);
            if let Some(s) = s {
                if best.map_or(true, |(_, b)| s < b) {
                    best = Some((value, s));
                }
            }
            samples.push((value, s));
        }
        SweepResult { best, samples }
    }
}

fn line_residuals(points: &[Point2<f64>], transpose: bool, out: &mut Vec<f64>) {
    if points.len() < 2 {
        return;
    }
    // fit b = m * a + c where (a, b) is (x, y) for rows and (y, x) for columns
    let (a, b): (Vec<f64>, Vec<f64>) = points
        .iter()
        .map(|p| if transpose { (p.y, p.x) } else { (p.x, p.y) })
        .unzip();
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let saa: f64 = a.iter().map(|v| (v - mean_a).powi(2)).sum();
    if saa < 1e-12 {
        return;
    }
    let sab: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum();
    let m = sab / saa;
    let c = mean_b - m * mean_a;
    let norm = (m * m + 1.0).sqrt();
    out.extend(a.iter().zip(b.iter()).map(|(x, y)| (m * x - y + c).abs() / norm));
}

/// RMS point-to-line distance over the rows and columns of a detected grid.
///
/// `corners` are row-major with `grid.columns` points per row. Rows are fit
/// as `y = m x + b` and columns as `x = m y + b`.
///
/// # Errors
///
/// [`CameraModelError::InvalidParams`] when the corner count does not match
/// the grid.
pub fn straightness_rms(corners: &[Point2<f64>], grid: GridSize) -> Result<f64, CameraModelError> {
    if corners.len() != grid.columns * grid.rows {
        return Err(CameraModelError::InvalidParams(format!(
            "{} corners for a {}x{} grid",
            corners.len(),
            grid.columns,
            grid.rows
        )));
    }
    let mut distances = Vec::with_capacity(2 * corners.len());
    for row in corners.chunks(grid.columns) {
        line_residuals(row, false, &mut distances);
    }
    for c in 0..grid.columns {
        let column: Vec<Point2<f64>> = (0..grid.rows)
            .map(|r| corners[r * grid.columns + c])
            .collect();
        line_residuals(&column, true, &mut distances);
    }
    if distances.is_empty() {
        return Ok(f64::INFINITY);
    }
    Ok((distances.iter().map(|d| d * d).sum::<f64>() / distances.len() as f64).sqrt())
}

/// Undistorts corners with `k1` alone, keeping the same camera matrix.
pub fn undistort_with_k1(
    corners: &[Point2<f64>],
    intrinsics: &Intrinsics,
    k1: f64,
) -> Result<Vec<Point2<f64>>, CameraModelError> {
    let terms = Distortion::radial_k1(k1).terms();
    corners
        .iter()
        .map(|p| {
            let n = undistort_normalized(&intrinsics.normalize(&p.coords), &terms)?;
            Ok(Point2::from(intrinsics.denormalize(&Vector2::new(n.x, n.y))))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct K1SweepReport {
    /// Straightness of the corners as detected.
    pub original_rms: f64,
    pub sweep: SweepResult,
}

/// Searches the `k1` that makes the grid lines straightest.
pub fn k1_straightness_sweep(
    corners: &[Point2<f64>],
    grid: GridSize,
    intrinsics: &Intrinsics,
    options: &SweepOptions,
) -> Result<K1SweepReport, CameraModelError> {
    let original_rms = straightness_rms(corners, grid)?;
    let sweep = ParameterSweep::new(options).run(|k1| {
        undistort_with_k1(corners, intrinsics, k1)
            .ok()
            .and_then(|undistorted| straightness_rms(&undistorted, grid).ok())
    });
    match sweep.best {
        Some((k1, rms)) => info!(
            "Straightness RMS {:.4} px as detected, {:.4} px at best k1 {:.4}",
            original_rms, rms, k1
        ),
        None => info!("No k1 in [{}, {}] could be scored", options.start, options.end),
    }
    Ok(K1SweepReport { original_rms, sweep })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::rad_tan::RadTanModel;
    use crate::camera::Resolution;
    use approx::assert_relative_eq;

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(-0.6, 0.6, 25);
        assert_eq!(v.len(), 25);
        assert_eq!(v[0], -0.6);
        assert_eq!(v[24], 0.6);
        assert_relative_eq!(v[12], 0.0, epsilon = 1e-12);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
    }

    #[test]
    fn test_sweep_skips_failures_and_keeps_first_tie() {
        let sweep = ParameterSweep::new(&SweepOptions {
            start: 0.0,
            end: 4.0,
            steps: 5,
        });
        let result = sweep.run(|v| match v as i32 {
            0 => None,
            1 | 3 => Some(1.0),
            2 => Some(f64::NAN),
            _ => Some(5.0),
        });
        assert_eq!(result.best, Some((1.0, 1.0)));
        assert_eq!(result.samples[0].1, None);
        assert_eq!(result.samples[2].1, None);
    }

    #[test]
    fn test_straight_grid_scores_zero() {
        let grid = GridSize::new(5, 4);
        let corners: Vec<_> = (0..20)
            .map(|i| Point2::new(100.0 + (i % 5) as f64 * 30.0, 50.0 + (i / 5) as f64 * 30.0))
            .collect();
        assert_relative_eq!(straightness_rms(&corners, grid).unwrap(), 0.0, epsilon = 1e-9);
        assert!(straightness_rms(&corners[..19], grid).is_err());
    }

    #[test]
    fn test_sweep_finds_applied_k1() {
        let resolution = Resolution {
            width: 1280,
            height: 960,
        };
        let intrinsics = Intrinsics::guess_from_resolution(&resolution);
        let model =
            RadTanModel::from_parts(intrinsics, resolution, Distortion::radial_k1(-0.25)).unwrap();
        let grid = GridSize::new(9, 6);
        let corners: Vec<_> = (0..54)
            .map(|i| {
                let ideal =
                    Point2::new(240.0 + (i % 9) as f64 * 100.0, 230.0 + (i / 9) as f64 * 100.0);
                model.distort_pixel(&ideal)
            })
            .collect();

        let report = k1_straightness_sweep(&corners, grid, &intrinsics, &SweepOptions::default())
            .unwrap();
        let (k1, rms) = report.sweep.best.unwrap();
        assert_relative_eq!(k1, -0.25, epsilon = 1e-9);
        assert!(rms < 1e-6);
        assert!(report.original_rms > 1.0);
    }
}
