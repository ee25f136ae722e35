//! Camera pose from known intrinsics and 3D-2D correspondences.
//!
//! Planar targets get a closed-form pose from the plane homography; general
//! point sets start from the DLT. In both cases the pose is then refined by
//! Levenberg-Marquardt with the camera fixed. When the closed form fails the
//! solver falls back to iterating from the best-fit-plane estimate.

use crate::camera::projection::project_points;
use crate::camera::rad_tan::undistort_normalized;
use crate::camera::{CameraModelError, Distortion, Intrinsics, Quality};
use crate::geometry::pnp::{dlt_pose, planar_pose};
use crate::geometry::{classify_layout, CorrespondenceSet, PointLayout, Pose};
use crate::optimization::{
    cross_check_projection, pose_block, pose_from_block, reprojection_residual,
};
use crate::util::{compute_reprojection_error, ProjectionError};
use log::{info, warn};
use nalgebra::{DVector, Point2, Point3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Fewest correspondences the pose solver accepts.
pub const MIN_POSE_POINTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSolverOptions {
    /// Relative spread below which points count as collinear or coplanar.
    pub layout_tolerance: f64,
    /// RMS above which the result is flagged as degraded.
    pub degraded_rms_px: f64,
    pub verbose: bool,
}

impl Default for PoseSolverOptions {
    fn default() -> Self {
        PoseSolverOptions {
            layout_tolerance: 1e-6,
            degraded_rms_px: 2.0,
            verbose: false,
        }
    }
}

/// Which path produced the initial estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoseMethod {
    /// Homography decomposition of a planar target.
    Planar,
    /// Iterative refinement from a generic or fallback start.
    Iterative,
}

#[derive(Debug, Clone)]
pub struct PoseSolution {
    pub pose: Pose,
    pub error: ProjectionError,
    pub method: PoseMethod,
    pub quality: Quality,
    /// Agreement between the refinement's internal projection and the
    /// projection model.
    pub cross_check: ProjectionError,
}

/// Residuals of one view against a single pose block; the camera is data.
#[derive(Debug, Clone)]
struct PoseCost {
    objects: Vec<Vector3<f64>>,
    observed: Vec<Vector2<f64>>,
    camera: Vec<f64>,
}

impl<T: RealField> Factor<T> for PoseCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera = DVector::from_iterator(
            self.camera.len(),
            self.camera.iter().map(|&v| nalgebra::convert::<f64, T>(v)),
        );
        reprojection_residual(&self.objects, &self.observed, &camera, &params[0])
    }
}

fn camera_vector(intrinsics: &Intrinsics, distortion: Option<&Distortion>) -> Vec<f64> {
    let mut camera = vec![intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy];
    if let Some(d) = distortion {
        camera.extend_from_slice(d.coefficients());
    }
    camera
}

/// RMS of `pose` over the points it places in front of the camera, and
/// whether that was every point.
///
/// With no point in front, the solver's own residual is used instead, so the
/// value stays meaningful as the residual of a failed refinement.
fn visible_rms(
    set: &CorrespondenceSet,
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    pose: &Pose,
) -> (f64, bool) {
    let squared: Vec<f64> = project_points(set.object_points(), intrinsics, distortion, pose)
        .iter()
        .zip(set.image_points())
        .filter_map(|(projected, observed)| projected.map(|p| (p - *observed).norm_squared()))
        .collect();
    if !squared.is_empty() {
        let rms = (squared.iter().sum::<f64>() / squared.len() as f64).sqrt();
        return (rms, squared.len() == set.len());
    }
    let objects: Vec<_> = set.object_points().iter().map(|p| p.coords).collect();
    let observed: Vec<_> = set.image_points().iter().map(|p| p.coords).collect();
    let camera = DVector::from_vec(camera_vector(intrinsics, distortion));
    let residuals = reprojection_residual(&objects, &observed, &camera, &pose_block(pose));
    ((residuals.norm_squared() / set.len() as f64).sqrt(), false)
}

fn refine_pose(
    set: &CorrespondenceSet,
    camera: &[f64],
    initial: &Pose,
    initial_rms: f64,
    verbose: bool,
) -> Result<Pose, CameraModelError> {
    let cost = PoseCost {
        objects: set.object_points().iter().map(|p| p.coords).collect(),
        observed: set.image_points().iter().map(|p| p.coords).collect(),
        camera: camera.to_vec(),
    };
    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(set.len() * 2, &["pose"], Box::new(cost), None);

    let mut initial_values = HashMap::new();
    initial_values.insert("pose".to_string(), pose_block(initial));

    if verbose {
        info!("Refining pose from {:?} (RMS {:.6} px)", initial, initial_rms);
    }
    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, None)
        .and_then(|mut values| values.remove("pose"))
        .ok_or_else(|| CameraModelError::NonConvergence {
            residual: initial_rms,
            reason: "pose refinement returned no solution".to_string(),
        })?;
    pose_from_block(&result)
}

/// Closed-form starting pose and the path that produced it.
///
/// Planar targets use the homography; general sets use the DLT when there
/// are enough points. Otherwise, or when the closed form fails, the pose of
/// the best-fit plane is the start for the iteration.
fn initial_pose(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
    layout: PointLayout,
) -> Result<(Pose, PoseMethod), CameraModelError> {
    let closed_form = match layout {
        PointLayout::Planar => planar_pose(object, normalized),
        _ if object.len() >= 6 => dlt_pose(object, normalized),
        _ => Err(CameraModelError::InsufficientData {
            required: 6,
            found: object.len(),
        }),
    };
    match (layout, closed_form) {
        (PointLayout::Planar, Ok(pose)) => Ok((pose, PoseMethod::Planar)),
        (_, Ok(pose)) => Ok((pose, PoseMethod::Iterative)),
        (_, Err(e)) => {
            warn!("closed-form pose failed ({e}); iterating from the best-fit plane");
            Ok((planar_pose(object, normalized)?, PoseMethod::Iterative))
        }
    }
}

/// Solves the camera pose of one view.
///
/// Pass `None` for `distortion` when the image points are already
/// undistorted.
///
/// # Errors
///
/// * [`CameraModelError::InsufficientData`] for fewer than four points.
/// * [`CameraModelError::DegenerateConfiguration`] for collinear points.
/// * [`CameraModelError::NonConvergence`] when the refinement fails, ends
///   with points behind the camera, or raises the RMS of the starting pose.
///   The residual is the RMS reached before the failure.
/// * [`CameraModelError::ModelMismatch`] when the refinement's projection
///   disagrees with the projection model.
pub fn solve_pose(
    set: &CorrespondenceSet,
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    options: &PoseSolverOptions,
) -> Result<PoseSolution, CameraModelError> {
    if set.len() < MIN_POSE_POINTS {
        return Err(CameraModelError::InsufficientData {
            required: MIN_POSE_POINTS,
            found: set.len(),
        });
    }
    let layout = classify_layout(set.object_points(), options.layout_tolerance)?;
    if layout == PointLayout::Collinear {
        return Err(CameraModelError::DegenerateConfiguration(
            "object points are collinear".to_string(),
        ));
    }

    let terms = distortion.map(|d| d.terms()).unwrap_or([0.0; 8]);
    let normalized: Vec<Point2<f64>> = set
        .image_points()
        .iter()
        .map(|p| undistort_normalized(&intrinsics.normalize(&p.coords), &terms).map(Point2::from))
        .collect::<Result<_, _>>()?;

    let (initial, method) = initial_pose(set.object_points(), &normalized, layout)?;
    let (initial_rms, initial_complete) = visible_rms(set, intrinsics, distortion, &initial);

    let camera = camera_vector(intrinsics, distortion);
    let pose = refine_pose(set, &camera, &initial, initial_rms, options.verbose)?;

    let error = compute_reprojection_error(set, intrinsics, distortion, &pose).map_err(|e| {
        CameraModelError::NonConvergence {
            residual: initial_rms,
            reason: format!("refined pose is invalid: {e}"),
        }
    })?;
    // Only comparable when the start saw the same points.
    if initial_complete && error.rmse > initial_rms * (1.0 + 1e-6) + 1e-9 {
        return Err(CameraModelError::NonConvergence {
            residual: error.rmse,
            reason: format!(
                "refinement raised the RMS from {:.6} px to {:.6} px",
                initial_rms, error.rmse
            ),
        });
    }
    let cross_check = cross_check_projection(
        set.object_points(),
        &DVector::from_vec(camera),
        &pose_block(&pose),
    )?;

    let quality = if error.rmse > options.degraded_rms_px {
        Quality::Degraded {
            reason: format!(
                "reprojection RMS {:.3} px above {} px",
                error.rmse, options.degraded_rms_px
            ),
        }
    } else {
        Quality::Nominal
    };
    if options.verbose {
        info!("Solved pose {:?} via {:?}: {:?}", pose, method, error);
    }

    Ok(PoseSolution {
        pose,
        error,
        method,
        quality,
        cross_check,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::projection::CROSS_CHECK_TOLERANCE_PX;
    use crate::extractor::GridSize;
    use crate::geometry::rotation::{axis_angle_to_matrix, rotation_angle_between};
    use crate::synthetic::{hd_intrinsics, planar_views};
    use approx::assert_relative_eq;

    fn assert_pose_close(estimate: &Pose, truth: &Pose) {
        assert!(rotation_angle_between(estimate.rotation(), truth.rotation()) < 1e-3);
        let rel = (estimate.translation() - truth.translation()).norm() / truth.translation().norm();
        assert!(rel < 1e-3, "relative translation error {rel}");
    }

    #[test]
    fn test_planar_round_trip() {
        let views = planar_views(GridSize::new(8, 6), 0.024, &hd_intrinsics(), None, 5);
        for (truth, set) in &views {
            let solution =
                solve_pose(set, &hd_intrinsics(), None, &PoseSolverOptions::default()).unwrap();
            assert_eq!(solution.method, PoseMethod::Planar);
            assert_pose_close(&solution.pose, truth);
            assert!(solution.error.rmse < 1e-6);
            assert!(solution.quality.is_nominal());
        }
    }

    #[test]
    fn test_round_trip_with_distortion() {
        let distortion = Distortion::new(vec![-0.2, 0.05, 0.001, -0.001, 0.0]).unwrap();
        let views = planar_views(
            GridSize::new(9, 6),
            0.03,
            &hd_intrinsics(),
            Some(&distortion),
            3,
        );
        for (truth, set) in &views {
            let solution = solve_pose(
                set,
                &hd_intrinsics(),
                Some(&distortion),
                &PoseSolverOptions::default(),
            )
            .unwrap();
            assert_pose_close(&solution.pose, truth);
            assert!(solution.cross_check.max < CROSS_CHECK_TOLERANCE_PX);
        }
    }

    #[test]
    fn test_general_points_use_iterative_path() {
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.02),
            Point3::new(0.0, 0.1, 0.05),
            Point3::new(0.1, 0.1, -0.03),
            Point3::new(0.05, 0.02, 0.08),
            Point3::new(-0.04, 0.07, 0.01),
            Point3::new(0.08, -0.05, 0.06),
        ];
        let truth = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.1, 0.25, -0.05)),
            Vector3::new(0.02, -0.03, 0.6),
        )
        .unwrap();
        let pixels: Vec<_> = project_points(&object, &hd_intrinsics(), None, &truth)
            .into_iter()
            .flatten()
            .collect();
        let set = CorrespondenceSet::new(object, pixels).unwrap();
        let solution =
            solve_pose(&set, &hd_intrinsics(), None, &PoseSolverOptions::default()).unwrap();
        assert_eq!(solution.method, PoseMethod::Iterative);
        assert_pose_close(&solution.pose, &truth);
    }

    #[test]
    fn test_four_coplanar_points_suffice() {
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.1, 0.1, 0.0),
            Point3::new(0.0, 0.1, 0.0),
        ];
        let truth = Pose::new(
            axis_angle_to_matrix(&Vector3::new(-0.15, 0.2, 0.1)),
            Vector3::new(-0.05, -0.05, 0.5),
        )
        .unwrap();
        let pixels: Vec<_> = project_points(&object, &hd_intrinsics(), None, &truth)
            .into_iter()
            .flatten()
            .collect();
        let set = CorrespondenceSet::new(object, pixels).unwrap();
        let solution =
            solve_pose(&set, &hd_intrinsics(), None, &PoseSolverOptions::default()).unwrap();
        assert_pose_close(&solution.pose, &truth);
    }

    #[test]
    fn test_rejects_too_few_points() {
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.0, 0.1, 0.0),
        ];
        let image = vec![Point2::new(960.0, 540.0); 3];
        let set = CorrespondenceSet::new(object, image).unwrap();
        assert!(matches!(
            solve_pose(&set, &hd_intrinsics(), None, &PoseSolverOptions::default()),
            Err(CameraModelError::InsufficientData { required: 4, found: 3 })
        ));
    }

    #[test]
    fn test_rejects_collinear_points() {
        let object: Vec<_> = (0..6).map(|i| Point3::new(i as f64 * 0.02, 0.0, 0.0)).collect();
        let image: Vec<_> = (0..6)
            .map(|i| Point2::new(900.0 + i as f64 * 40.0, 540.0))
            .collect();
        let set = CorrespondenceSet::new(object, image).unwrap();
        assert!(matches!(
            solve_pose(&set, &hd_intrinsics(), None, &PoseSolverOptions::default()),
            Err(CameraModelError::DegenerateConfiguration(_))
        ));
    }

    fn observe(object: &[Point3<f64>], truth: &Pose) -> CorrespondenceSet {
        let pixels: Vec<_> = project_points(object, &hd_intrinsics(), None, truth)
            .into_iter()
            .flatten()
            .collect();
        CorrespondenceSet::new(object.to_vec(), pixels).unwrap()
    }

    #[test]
    fn test_five_non_coplanar_points_iterate_from_plane() {
        let object = vec![
            Point3::new(0.0, 0.0, 0.004),
            Point3::new(0.12, 0.0, -0.006),
            Point3::new(0.12, 0.09, 0.005),
            Point3::new(0.0, 0.09, -0.003),
            Point3::new(0.05, 0.04, 0.008),
        ];
        let truth = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.12, -0.2, 0.05)),
            Vector3::new(-0.06, -0.04, 0.55),
        )
        .unwrap();
        let set = observe(&object, &truth);
        assert_eq!(
            classify_layout(set.object_points(), 1e-6).unwrap(),
            PointLayout::General
        );
        let solution =
            solve_pose(&set, &hd_intrinsics(), None, &PoseSolverOptions::default()).unwrap();
        assert_eq!(solution.method, PoseMethod::Iterative);
        assert_pose_close(&solution.pose, &truth);
        assert!(solution.error.rmse < 1e-6);
    }

    #[test]
    fn test_initial_pose_uses_plane_when_closed_form_fails() {
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.005),
            Point3::new(0.1, 0.1, -0.004),
            Point3::new(0.0, 0.1, 0.006),
        ];
        let truth = Pose::new(
            axis_angle_to_matrix(&Vector3::new(-0.1, 0.15, 0.0)),
            Vector3::new(-0.05, -0.05, 0.5),
        )
        .unwrap();
        let normalized: Vec<_> = object
            .iter()
            .map(|p| {
                let c = truth.transform_point(p);
                Point2::new(c.x / c.z, c.y / c.z)
            })
            .collect();

        // Four points are too few for the DLT.
        assert!(dlt_pose(&object, &normalized).is_err());
        let (start, method) = initial_pose(&object, &normalized, PointLayout::General).unwrap();
        assert_eq!(method, PoseMethod::Iterative);
        assert!(start.translation().z > 0.0);
        assert!(rotation_angle_between(start.rotation(), truth.rotation()) < 0.2);

        let solution = solve_pose(
            &observe(&object, &truth),
            &hd_intrinsics(),
            None,
            &PoseSolverOptions::default(),
        )
        .unwrap();
        assert_eq!(solution.method, PoseMethod::Iterative);
        assert_pose_close(&solution.pose, &truth);
    }

    #[test]
    fn test_visible_rms_skips_points_behind_camera() {
        let pose = Pose::new(nalgebra::Matrix3::identity(), Vector3::new(0.0, 0.0, 0.5)).unwrap();
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.0, 0.1, 0.0),
            Point3::new(0.05, 0.05, -1.0),
        ];
        let mut pixels = vec![
            Point2::new(960.0, 540.0),
            Point2::new(1200.0, 540.0),
            Point2::new(960.0, 780.0),
            Point2::new(0.0, 0.0),
        ];
        let set = CorrespondenceSet::new(object.clone(), pixels.clone()).unwrap();
        let (rms, complete) = visible_rms(&set, &hd_intrinsics(), None, &pose);
        assert!(!complete);
        assert!(rms < 1e-9, "rms {rms}");

        pixels[0].x += 3.0;
        let set = CorrespondenceSet::new(object, pixels).unwrap();
        let (rms, _) = visible_rms(&set, &hd_intrinsics(), None, &pose);
        assert_relative_eq!(rms, 3.0f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_failed_refinement_reports_finite_residual() {
        let object: Vec<_> = (0..6)
            .map(|i| Point3::new((i % 3) as f64 * 0.05, (i / 3) as f64 * 0.05, 0.0))
            .collect();
        let scattered = vec![
            Point2::new(120.0, 940.0),
            Point2::new(1810.0, 60.0),
            Point2::new(960.0, 540.0),
            Point2::new(310.0, 180.0),
            Point2::new(1540.0, 1010.0),
            Point2::new(700.0, 820.0),
        ];
        let set = CorrespondenceSet::new(object, scattered).unwrap();
        match solve_pose(&set, &hd_intrinsics(), None, &PoseSolverOptions::default()) {
            Ok(solution) => assert!(!solution.quality.is_nominal()),
            Err(CameraModelError::NonConvergence { residual, .. }) => {
                assert!(residual.is_finite(), "residual {residual}")
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
}
