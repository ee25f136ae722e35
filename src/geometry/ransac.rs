//! Model-agnostic RANSAC.
//!
//! Implement [`Estimator`] for a model and call [`ransac`]. Sampling uses a
//! seeded [`StdRng`], so a run is reproducible for fixed options. The
//! iteration budget shrinks as better consensus sets are found.

use crate::camera::CameraModelError;
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RansacOptions {
    pub max_iterations: usize,
    /// Inlier threshold, in the units of [`Estimator::residual`].
    pub threshold: f64,
    /// Fewer inliers than this is reported as a failure.
    pub min_inliers: usize,
    /// Desired probability of drawing at least one all-inlier sample.
    pub confidence: f64,
    pub seed: u64,
    /// Refit on the consensus set before scoring.
    pub refit_on_inliers: bool,
}

impl Default for RansacOptions {
    fn default() -> Self {
        RansacOptions {
            max_iterations: 2000,
            threshold: 1.0,
            min_inliers: 50,
            confidence: 0.999,
            seed: 1_234_567,
            refit_on_inliers: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: M,
    /// Indices into the input data, ascending.
    pub inliers: Vec<usize>,
    pub inlier_rms: f64,
    pub iterations: usize,
}

pub trait Estimator {
    type Datum;
    type Model;

    /// Minimal sample size.
    const MIN_SAMPLES: usize;

    /// Fits a model to the sampled indices; `None` when the sample is unusable.
    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual of one datum.
    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64;

    fn is_degenerate(_data: &[Self::Datum], _sample: &[usize]) -> bool {
        false
    }

    /// Least-squares refit on a consensus set.
    fn refit(_data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Standard bound `log(1 - p) / log(1 - w^m)`, clamped to the budget.
fn required_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    done: usize,
    max_iterations: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iterations;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iterations;
    }
    let n = ((1.0 - confidence.min(1.0 - 1e-12)).ln() / denom).ceil();
    (n as usize).clamp(done, max_iterations)
}

fn consensus<E: Estimator>(
    model: &E::Model,
    data: &[E::Datum],
    threshold: f64,
) -> (Vec<usize>, Vec<f64>) {
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();
    for (i, datum) in data.iter().enumerate() {
        let r = E::residual(model, datum);
        if r <= threshold {
            inliers.push(i);
            residuals.push(r);
        }
    }
    (inliers, residuals)
}

/// Runs RANSAC over `data`.
///
/// # Errors
///
/// [`CameraModelError::InsufficientData`] when `data` is smaller than the
/// minimal sample or when the best consensus set has fewer than
/// `options.min_inliers` members; `found` then carries the best count.
pub fn ransac<E: Estimator>(
    data: &[E::Datum],
    options: &RansacOptions,
) -> Result<RansacResult<E::Model>, CameraModelError> {
    let required = E::MIN_SAMPLES.max(options.min_inliers);
    if data.len() < required {
        return Err(CameraModelError::InsufficientData {
            required,
            found: data.len(),
        });
    }

    let all_indices: Vec<usize> = (0..data.len()).collect();
    let mut sample = vec![0usize; E::MIN_SAMPLES];
    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut best: Option<RansacResult<E::Model>> = None;
    let mut best_count = 0usize;
    let mut budget = options.max_iterations;
    let mut iteration = 0;

    while iteration < budget {
        iteration += 1;
        for (slot, &idx) in sample
            .iter_mut()
            .zip(all_indices.choose_multiple(&mut rng, E::MIN_SAMPLES))
        {
            *slot = idx;
        }
        if E::is_degenerate(data, &sample) {
            continue;
        }
        let Some(mut model) = E::fit(data, &sample) else {
            continue;
        };

        let (mut inliers, mut residuals) = consensus::<E>(&model, data, options.threshold);
        if inliers.len() < E::MIN_SAMPLES {
            continue;
        }
        if options.refit_on_inliers {
            if let Some(refit) = E::refit(data, &inliers) {
                let (refit_inliers, refit_residuals) =
                    consensus::<E>(&refit, data, options.threshold);
                if refit_inliers.len() >= inliers.len() {
                    model = refit;
                    inliers = refit_inliers;
                    residuals = refit_residuals;
                }
            }
        }

        let inlier_rms = rms(&residuals);
        let better = match &best {
            None => true,
            Some(b) => {
                inliers.len() > b.inliers.len()
                    || (inliers.len() == b.inliers.len() && inlier_rms < b.inlier_rms)
            }
        };
        if better {
            best_count = inliers.len();
            budget = required_iterations(
                options.confidence,
                best_count as f64 / data.len() as f64,
                E::MIN_SAMPLES,
                iteration,
                options.max_iterations,
            );
            best = Some(RansacResult {
                model,
                inliers,
                inlier_rms,
                iterations: iteration,
            });
        }
    }

    match best {
        Some(mut result) if best_count >= options.min_inliers => {
            result.iterations = iteration;
            log::debug!(
                "RANSAC: {} / {} inliers after {} iterations (rms {:.4})",
                result.inliers.len(),
                data.len(),
                iteration,
                result.inlier_rms
            );
            Ok(result)
        }
        _ => Err(CameraModelError::InsufficientData {
            required: options.min_inliers,
            found: best_count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct LineEstimator;

    impl Estimator for LineEstimator {
        type Datum = (f64, f64);
        type Model = (f64, f64);

        const MIN_SAMPLES: usize = 2;

        fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
            let (x0, y0) = data[sample[0]];
            let (x1, y1) = data[sample[1]];
            if (x1 - x0).abs() < 1e-9 {
                return None;
            }
            let slope = (y1 - y0) / (x1 - x0);
            Some((slope, y0 - slope * x0))
        }

        fn residual(model: &Self::Model, datum: &Self::Datum) -> f64 {
            let (m, b) = *model;
            (m * datum.0 - datum.1 + b).abs() / (m * m + 1.0).sqrt()
        }

        fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
            let n = inliers.len() as f64;
            let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
            for &i in inliers {
                let (x, y) = data[i];
                sx += x;
                sy += y;
                sxx += x * x;
                sxy += x * y;
            }
            let denom = n * sxx - sx * sx;
            if denom.abs() < 1e-12 {
                return None;
            }
            let m = (n * sxy - sx * sy) / denom;
            Some((m, (sy - m * sx) / n))
        }
    }

    fn line_with_outliers() -> Vec<(f64, f64)> {
        let mut data: Vec<(f64, f64)> = (0..80).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        for i in 0..20 {
            data.push((i as f64 * 3.7, 500.0 - i as f64 * 11.0));
        }
        data
    }

    #[test]
    fn test_ransac_recovers_line() {
        let options = RansacOptions {
            threshold: 0.5,
            min_inliers: 60,
            ..RansacOptions::default()
        };
        let result = ransac::<LineEstimator>(&line_with_outliers(), &options).unwrap();
        assert_relative_eq!(result.model.0, 2.0, epsilon = 1e-9);
        assert_relative_eq!(result.model.1, 1.0, epsilon = 1e-9);
        assert!(result.inliers.len() >= 80);
    }

    #[test]
    fn test_ransac_is_reproducible() {
        let options = RansacOptions {
            threshold: 0.5,
            min_inliers: 10,
            refit_on_inliers: false,
            ..RansacOptions::default()
        };
        let data = line_with_outliers();
        let a = ransac::<LineEstimator>(&data, &options).unwrap();
        let b = ransac::<LineEstimator>(&data, &options).unwrap();
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.model.0.to_bits(), b.model.0.to_bits());
    }

    #[test]
    fn test_ransac_reports_too_few_inliers() {
        let options = RansacOptions {
            threshold: 0.5,
            min_inliers: 95,
            ..RansacOptions::default()
        };
        match ransac::<LineEstimator>(&line_with_outliers(), &options) {
            Err(CameraModelError::InsufficientData { required, found }) => {
                assert_eq!(required, 95);
                assert!(found >= 80 && found < 95);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.inliers.len())),
        }
    }

    #[test]
    fn test_required_iterations_shrinks_with_inlier_ratio() {
        let many = required_iterations(0.999, 0.3, 8, 1, 10_000);
        let few = required_iterations(0.999, 0.9, 8, 1, 10_000);
        assert!(few < many);
        assert_eq!(required_iterations(0.999, 0.0, 8, 1, 500), 500);
    }
}
