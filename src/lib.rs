//! Camera Geometry Tools Library
//!
//! Offline camera geometry from planar targets and stereo pairs:
//! - Chessboard corner extraction with sub-pixel refinement
//! - Intrinsic calibration (closed-form initialization, Levenberg-Marquardt refinement)
//! - Single-image pose solving with a planar closed form and an iterative fallback
//! - An explicit radial-tangential projection model used to verify every solver
//! - Stereo reconstruction, from an uncalibrated pair or a rectified dataset pair
//!
//! The nonlinear refinements use the tiny-solver optimization framework.

pub mod camera;
pub mod extractor;
pub mod geometry;
pub mod optimization;
pub mod stereo;
pub mod util;

#[cfg(test)]
pub(crate) mod synthetic;

// Re-export commonly used types
pub use camera::{
    CalibrationParams, CameraModel, CameraModelError, Distortion, Intrinsics, PinholeModel,
    Quality, RadTanModel, Resolution,
};
pub use extractor::{extract_correspondences, ExtractorOptions, GridSize};
pub use geometry::{CorrespondenceSet, Pose};
pub use optimization::{
    calibrate_camera, solve_pose, CalibrationOptions, CalibrationResult, Optimizer,
    PoseSolution, PoseSolverOptions,
};
pub use stereo::{
    DisparityField, PointCloud, RectifiedStereoPair, StereoGeometry, StereoOptions,
};
pub use util::UtilError;
