//! The `optimization` module refines camera parameters and poses by
//! minimizing reprojection error.
//!
//! This module defines the [`Optimizer`] trait, which outlines the common
//! interface of the refinement tasks, and the reprojection residual shared by
//! every cost function. The residual is written generically over
//! [`nalgebra::RealField`] so `tiny_solver` can differentiate it
//! automatically, and it is evaluated in `f64` for the projection
//! cross-check.
//!
//! The optimization process typically involves:
//! 1. A linear estimation step to get an initial guess.
//! 2. A non-linear optimization step (Levenberg-Marquardt) to refine all parameters.

use crate::camera::projection::{pixel_from_camera, project_points, CROSS_CHECK_TOLERANCE_PX};
use crate::camera::{verify_projection, CameraModelError, Distortion, Intrinsics, Resolution};
use crate::geometry::rotation::rotate_axis_angle;
use crate::geometry::Pose;
use crate::util::ProjectionError;
use nalgebra::{DVector, Point2, Point3, RealField, Vector2, Vector3};

pub mod calibration;
pub mod pose;
pub mod sweep;

pub use calibration::{calibrate_camera, CalibrationCost, CalibrationOptions, CalibrationResult};
pub use pose::{solve_pose, PoseMethod, PoseSolution, PoseSolverOptions};
pub use sweep::{linspace, ParameterSweep, SweepOptions, SweepResult};

/// A trait for camera model optimization tasks.
///
/// Types implementing `Optimizer` are responsible for refining the parameters
/// of a camera model. This typically involves minimizing the reprojection
/// error given a set of 3D-2D point correspondences.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress and results are logged at `info` level.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the optimization was successful and the parameters
    ///   have been updated.
    /// * `Err(CameraModelError)` - If the solver failed; non-convergence
    ///   carries the last residual reached.
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError>;

    /// Closed-form estimate used to initialize [`Optimizer::optimize`].
    fn linear_estimation(&mut self) -> Result<(), CameraModelError>
    where
        Self: Sized;

    /// Retrieves the current intrinsic parameters.
    fn get_intrinsics(&self) -> Intrinsics;

    /// Retrieves the image resolution the parameters belong to.
    fn get_resolution(&self) -> Resolution;

    /// Retrieves the current distortion coefficients.
    fn get_distortion(&self) -> Vec<f64>;
}

/// Parameter block of one pose: Rodrigues vector followed by translation.
pub(crate) fn pose_block(pose: &Pose) -> DVector<f64> {
    let r = pose.rvec();
    let t = pose.translation();
    DVector::from_vec(vec![r.x, r.y, r.z, t.x, t.y, t.z])
}

pub(crate) fn pose_from_block(block: &DVector<f64>) -> Result<Pose, CameraModelError> {
    if block.len() != 6 {
        return Err(CameraModelError::InvalidParams(format!(
            "pose block must have 6 values, found {}",
            block.len()
        )));
    }
    Pose::from_rvec_tvec(
        &Vector3::new(block[0], block[1], block[2]),
        &Vector3::new(block[3], block[4], block[5]),
    )
}

/// Solver-side projection of one object point.
///
/// `camera` holds `fx, fy, cx, cy` followed by any distortion terms and
/// `pose` holds the Rodrigues vector and translation.
pub(crate) fn solver_project<T: RealField>(
    object: &Vector3<T>,
    camera: &DVector<T>,
    pose: &DVector<T>,
) -> (Vector2<T>, T) {
    let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
    let tvec = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());
    let pc = rotate_axis_angle(&rvec, object) + tvec;
    let intrinsics = [
        camera[0].clone(),
        camera[1].clone(),
        camera[2].clone(),
        camera[3].clone(),
    ];
    let terms: Vec<T> = camera.iter().skip(4).cloned().collect();
    let depth = pc.z.clone();
    (pixel_from_camera(&pc, &intrinsics, &terms), depth)
}

/// Stacked `[du, dv]` residuals of observed against projected pixels.
pub(crate) fn reprojection_residual<T: RealField>(
    objects: &[Vector3<f64>],
    observed: &[Vector2<f64>],
    camera: &DVector<T>,
    pose: &DVector<T>,
) -> DVector<T> {
    let mut residuals = DVector::zeros(observed.len() * 2);
    for (i, (p3d, p2d)) in objects.iter().zip(observed.iter()).enumerate() {
        let object = Vector3::new(
            nalgebra::convert(p3d.x),
            nalgebra::convert(p3d.y),
            nalgebra::convert(p3d.z),
        );
        let (projected, _) = solver_project(&object, camera, pose);
        residuals[i * 2] = projected.x.clone() - nalgebra::convert::<f64, T>(p2d.x);
        residuals[i * 2 + 1] = projected.y.clone() - nalgebra::convert::<f64, T>(p2d.y);
    }
    residuals
}

fn internal_projections(
    objects: &[Point3<f64>],
    camera: &DVector<f64>,
    pose: &DVector<f64>,
) -> Vec<Option<Point2<f64>>> {
    objects
        .iter()
        .map(|p| {
            let (uv, depth) = solver_project(&p.coords, camera, pose);
            (depth > 0.0).then(|| Point2::from(uv))
        })
        .collect()
}

/// Projects points the way the refinement does, through the Rodrigues
/// parameterization of the pose; `None` for points behind the camera.
pub fn solver_projections(
    objects: &[Point3<f64>],
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    pose: &Pose,
) -> Vec<Option<Point2<f64>>> {
    let mut camera = vec![intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy];
    if let Some(d) = distortion {
        camera.extend_from_slice(d.coefficients());
    }
    internal_projections(objects, &DVector::from_vec(camera), &pose_block(pose))
}

/// Compares the solver's internal projection with the independent
/// projection model for the given parameter blocks.
///
/// # Errors
///
/// [`CameraModelError::ModelMismatch`] when any point differs by more than
/// [`CROSS_CHECK_TOLERANCE_PX`].
pub fn cross_check_projection(
    objects: &[Point3<f64>],
    camera: &DVector<f64>,
    pose: &DVector<f64>,
) -> Result<ProjectionError, CameraModelError> {
    if camera.len() < 4 {
        return Err(CameraModelError::InvalidParams(
            "camera block needs fx, fy, cx, cy".to_string(),
        ));
    }
    let internal = internal_projections(objects, camera, pose);
    let intrinsics = Intrinsics::new(camera[0], camera[1], camera[2], camera[3]);
    let distortion = Distortion::new(camera.iter().skip(4).copied().collect())?;
    let oracle = project_points(
        objects,
        &intrinsics,
        Some(&distortion),
        &pose_from_block(pose)?,
    );
    verify_projection(&oracle, &internal, CROSS_CHECK_TOLERANCE_PX)
}
