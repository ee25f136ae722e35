//! Intrinsic calibration from several views of a planar target.
//!
//! The camera matrix is initialized in closed form from the plane-to-image
//! homographies (Zhang's method), each view's pose is decomposed from its
//! homography, and all parameters are then refined jointly with the
//! `tiny_solver` Levenberg-Marquardt optimizer: one shared block
//! `[fx, fy, cx, cy, k1, k2, p1, p2, k3, ...]` and one `[rvec, tvec]` block per
//! view.

use crate::camera::{
    CameraModel, CameraModelError, Distortion, Intrinsics, Quality, RadTanModel, Resolution,
    MAX_DISTORTION_TERMS,
};
use crate::geometry::homography::{
    estimate_homography, pose_from_homography, smallest_right_singular_vector,
};
use crate::geometry::{CorrespondenceSet, Pose};
use crate::optimization::{
    cross_check_projection, pose_block, pose_from_block, reprojection_residual, Optimizer,
};
use crate::util::{compute_reprojection_error, ProjectionError};
use log::{info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Fewest views the calibrator accepts.
pub const MIN_CALIBRATION_VIEWS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOptions {
    /// Number of distortion coefficients to estimate, `0..=8`.
    pub distortion_terms: usize,
    /// Overall RMS above which the result is flagged as degraded.
    pub degraded_rms_px: f64,
    /// Overall RMS above which the solve is reported as not converged.
    pub max_rms_px: f64,
    pub verbose: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        CalibrationOptions {
            distortion_terms: 5,
            degraded_rms_px: 1.0,
            max_rms_px: 10.0,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub model: RadTanModel,
    /// One pose per input set, in input order.
    pub poses: Vec<Pose>,
    /// Per-view reprojection statistics, in input order.
    pub per_view: Vec<ProjectionError>,
    /// RMS over every point of every view.
    pub rms: f64,
    /// Largest disagreement between the solver's projection and the
    /// independent projection model.
    pub max_model_deviation: f64,
    pub quality: Quality,
}

/// Residuals of one view against the shared camera block and its pose block.
#[derive(Debug, Clone)]
struct ViewCost {
    objects: Vec<Vector3<f64>>,
    observed: Vec<Vector2<f64>>,
}

impl ViewCost {
    fn new(set: &CorrespondenceSet) -> Self {
        ViewCost {
            objects: set.object_points().iter().map(|p| p.coords).collect(),
            observed: set.image_points().iter().map(|p| p.coords).collect(),
        }
    }
}

impl<T: RealField> Factor<T> for ViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        reprojection_residual(&self.objects, &self.observed, &params[0], &params[1])
    }
}

/// Joint refinement state for [`calibrate_camera`].
#[derive(Clone)]
pub struct CalibrationCost {
    model: RadTanModel,
    sets: Vec<CorrespondenceSet>,
    poses: Vec<Pose>,
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    let hi = h.column(i);
    let hj = h.column(j);
    [
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ]
}

/// Zhang's closed-form camera matrix from at least three homographies,
/// assuming zero skew.
///
/// Homographies should be pre-conditioned so that pixel coordinates are of
/// order one.
pub fn intrinsics_from_homographies(
    homographies: &[Matrix3<f64>],
) -> Result<Intrinsics, CameraModelError> {
    if homographies.len() < MIN_CALIBRATION_VIEWS {
        return Err(CameraModelError::InsufficientData {
            required: MIN_CALIBRATION_VIEWS,
            found: homographies.len(),
        });
    }
    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (k, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        for c in 0..6 {
            v[(2 * k, c)] = v12[c];
            v[(2 * k + 1, c)] = v11[c] - v22[c];
        }
    }
    let b = smallest_right_singular_vector(v)?;
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= 1e-12 * (b11 * b11 + b22 * b22) {
        return Err(CameraModelError::DegenerateConfiguration(
            "target views do not constrain the camera matrix".to_string(),
        ));
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 || lambda * b11 / denom <= 0.0 {
        return Err(CameraModelError::DegenerateConfiguration(
            "closed-form camera matrix is not positive definite".to_string(),
        ));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let intrinsics = Intrinsics::new(alpha, beta, u0, v0);
    crate::camera::validation::validate_intrinsics(&intrinsics)?;
    Ok(intrinsics)
}

fn plane_coordinates(set: &CorrespondenceSet) -> Result<Vec<Point2<f64>>, CameraModelError> {
    if !set.lies_on_target_plane() {
        return Err(CameraModelError::InvalidParams(
            "calibration target points must lie on Z = 0".to_string(),
        ));
    }
    Ok(set
        .object_points()
        .iter()
        .map(|p| Point2::new(p.x, p.y))
        .collect())
}

impl CalibrationCost {
    pub fn new(
        sets: Vec<CorrespondenceSet>,
        resolution: Resolution,
        distortion_terms: usize,
    ) -> Result<Self, CameraModelError> {
        if distortion_terms > MAX_DISTORTION_TERMS {
            return Err(CameraModelError::InvalidParams(format!(
                "at most {} distortion terms are supported, got {}",
                MAX_DISTORTION_TERMS, distortion_terms
            )));
        }
        let model = RadTanModel::from_parts(
            Intrinsics::guess_from_resolution(&resolution),
            resolution,
            Distortion::zeros(distortion_terms),
        )?;
        let poses = vec![Pose::identity(); sets.len()];
        Ok(CalibrationCost { model, sets, poses })
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    fn camera_block(&self) -> DVector<f64> {
        let i = &self.model.intrinsics;
        let mut values = vec![i.fx, i.fy, i.cx, i.cy];
        values.extend_from_slice(self.model.distortion.coefficients());
        DVector::from_vec(values)
    }

    /// RMS over all points with the current parameters.
    pub fn total_rms(&self) -> Result<f64, CameraModelError> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for (set, pose) in self.sets.iter().zip(self.poses.iter()) {
            let e = compute_reprojection_error(
                set,
                &self.model.intrinsics,
                Some(&self.model.distortion),
                pose,
            )?;
            sum += e.rmse * e.rmse * set.len() as f64;
            count += set.len();
        }
        if count == 0 {
            return Err(CameraModelError::InsufficientData {
                required: 1,
                found: 0,
            });
        }
        Ok((sum / count as f64).sqrt())
    }
}

impl Optimizer for CalibrationCost {
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        let initial_rms = self.total_rms().unwrap_or(f64::INFINITY);
        if verbose {
            info!("Starting calibration refinement with tiny-solver Levenberg-Marquardt...");
            info!("Initial parameters: {:?}", self.model);
            info!("Initial RMS: {:.6} px", initial_rms);
        }

        let pose_keys: Vec<String> = (0..self.sets.len()).map(|i| format!("pose_{i}")).collect();
        let mut problem = tiny_solver::Problem::new();
        for (set, key) in self.sets.iter().zip(pose_keys.iter()) {
            problem.add_residual_block(
                set.len() * 2,
                &["camera", key.as_str()],
                Box::new(ViewCost::new(set)),
                None,
            );
        }

        let mut initial_values = HashMap::new();
        initial_values.insert("camera".to_string(), self.camera_block());
        for (pose, key) in self.poses.iter().zip(pose_keys.iter()) {
            initial_values.insert(key.clone(), pose_block(pose));
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CameraModelError::NonConvergence {
                residual: initial_rms,
                reason: "Levenberg-Marquardt returned no solution".to_string(),
            })?;

        let camera = result.get("camera").ok_or_else(|| CameraModelError::NonConvergence {
            residual: initial_rms,
            reason: "solver dropped the camera block".to_string(),
        })?;
        let mut poses = Vec::with_capacity(pose_keys.len());
        for key in &pose_keys {
            let block = result.get(key).ok_or_else(|| CameraModelError::NonConvergence {
                residual: initial_rms,
                reason: format!("solver dropped {key}"),
            })?;
            poses.push(pose_from_block(block)?);
        }

        let mut model = RadTanModel::new(camera).map_err(|e| CameraModelError::NonConvergence {
            residual: initial_rms,
            reason: format!("refined parameters are invalid: {e}"),
        })?;
        model.resolution = self.model.resolution;
        self.model = model;
        self.poses = poses;

        if verbose {
            info!("Optimization finished");
            info!("Final parameters: {:?}", self.model);
        }
        Ok(())
    }

    /// Zhang initialization of the camera matrix and per-view poses.
    ///
    /// Distortion starts at zero. When the closed form is degenerate the
    /// camera matrix falls back to the resolution-based guess.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError> {
        let resolution = self.model.resolution;
        let scale = 2.0 / (resolution.width as f64 + resolution.height as f64);
        let condition = Matrix3::new(
            scale, 0.0, -scale * resolution.width as f64 / 2.0, //
            0.0, scale, -scale * resolution.height as f64 / 2.0, //
            0.0, 0.0, 1.0,
        );

        let mut homographies = Vec::with_capacity(self.sets.len());
        for set in &self.sets {
            let plane = plane_coordinates(set)?;
            homographies.push(estimate_homography(&plane, set.image_points())?);
        }
        let conditioned: Vec<Matrix3<f64>> = homographies
            .iter()
            .map(|h| {
                let c = condition * h;
                c / c.norm()
            })
            .collect();

        let intrinsics = match intrinsics_from_homographies(&conditioned) {
            Ok(k) => Intrinsics::new(
                k.fx / scale,
                k.fy / scale,
                k.cx / scale + resolution.width as f64 / 2.0,
                k.cy / scale + resolution.height as f64 / 2.0,
            ),
            Err(e) => {
                warn!("closed-form camera matrix failed ({e}); using resolution guess");
                Intrinsics::guess_from_resolution(&resolution)
            }
        };
        crate::camera::validation::validate_intrinsics(&intrinsics)?;

        let k = intrinsics.matrix();
        self.poses = homographies
            .iter()
            .map(|h| pose_from_homography(&k, h))
            .collect::<Result<Vec<_>, _>>()?;
        self.model.intrinsics = intrinsics;
        self.model.distortion = Distortion::zeros(self.model.distortion.len());
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.model.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model.get_distortion()
    }
}

/// Calibrates one camera from correspondence sets of a planar target.
///
/// # Errors
///
/// * [`CameraModelError::InsufficientData`] for fewer than three views or a
///   view with fewer than four points.
/// * [`CameraModelError::NonConvergence`] when the solver fails or the
///   final RMS exceeds `options.max_rms_px`.
/// * [`CameraModelError::ModelMismatch`] when the solver's projection and
///   the projection model disagree.
pub fn calibrate_camera(
    sets: &[CorrespondenceSet],
    resolution: Resolution,
    options: &CalibrationOptions,
) -> Result<CalibrationResult, CameraModelError> {
    if sets.len() < MIN_CALIBRATION_VIEWS {
        return Err(CameraModelError::InsufficientData {
            required: MIN_CALIBRATION_VIEWS,
            found: sets.len(),
        });
    }
    if let Some(small) = sets.iter().find(|s| s.len() < 4) {
        return Err(CameraModelError::InsufficientData {
            required: 4,
            found: small.len(),
        });
    }

    let mut cost = CalibrationCost::new(sets.to_vec(), resolution, options.distortion_terms)?;
    cost.linear_estimation()?;
    if options.verbose {
        info!("Linear estimate: {:?}", cost.model);
    }
    cost.optimize(options.verbose)?;

    let per_view = sets
        .iter()
        .zip(cost.poses.iter())
        .map(|(set, pose)| {
            compute_reprojection_error(
                set,
                &cost.model.intrinsics,
                Some(&cost.model.distortion),
                pose,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    let rms = cost.total_rms()?;

    let camera = cost.camera_block();
    let mut max_model_deviation = 0.0f64;
    for (set, pose) in sets.iter().zip(cost.poses.iter()) {
        let check = cross_check_projection(set.object_points(), &camera, &pose_block(pose))?;
        max_model_deviation = max_model_deviation.max(check.max);
    }

    if !(rms <= options.max_rms_px) {
        return Err(CameraModelError::NonConvergence {
            residual: rms,
            reason: format!("reprojection RMS above {} px", options.max_rms_px),
        });
    }
    let quality = if rms > options.degraded_rms_px {
        Quality::Degraded {
            reason: format!("reprojection RMS {:.3} px above {} px", rms, options.degraded_rms_px),
        }
    } else {
        Quality::Nominal
    };
    info!(
        "Calibrated {} views: RMS {:.4} px, fx {:.3}, fy {:.3}, cx {:.3}, cy {:.3}",
        sets.len(),
        rms,
        cost.model.intrinsics.fx,
        cost.model.intrinsics.fy,
        cost.model.intrinsics.cx,
        cost.model.intrinsics.cy
    );

    Ok(CalibrationResult {
        model: cost.model,
        poses: cost.poses,
        per_view,
        rms,
        max_model_deviation,
        quality,
    })
}
