//! The two reconstruction modes.

use crate::camera::rad_tan::{undistort_normalized, RadTanModel};
use crate::camera::CameraModelError;
use crate::geometry::essential::{find_essential_ransac, recover_relative_pose};
use crate::geometry::ransac::RansacOptions;
use crate::geometry::Pose;
use crate::stereo::disparity::{compute_disparity, DisparityOptions};
use crate::stereo::features::{detect_and_describe, match_descriptors, FeatureOptions};
use crate::stereo::rectify::{rectify_pair, RectificationTransforms};
use crate::stereo::{triangulate, DisparityField, PointCloud, RectifiedStereoPair};
use image::imageops::grayscale;
use image::RgbImage;
use log::info;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoOptions {
    pub features: FeatureOptions,
    /// RANSAC settings; `threshold` is in pixels.
    pub ransac: RansacOptions,
    /// Known distance between the two camera centres, in metres.
    pub baseline: f64,
    pub disparity: DisparityOptions,
}

impl Default for StereoOptions {
    fn default() -> Self {
        StereoOptions {
            features: FeatureOptions::default(),
            ransac: RansacOptions {
                threshold: 1.0,
                min_inliers: 50,
                confidence: 0.999,
                ..RansacOptions::default()
            },
            baseline: 0.04,
            disparity: DisparityOptions::default(),
        }
    }
}

/// Result of [`reconstruct_uncalibrated`].
#[derive(Debug, Clone)]
pub struct StereoReconstruction {
    /// `X_right = R X_left + t` with `|t|` equal to the baseline.
    pub relative_pose: Pose,
    /// Number of feature matches consistent with the essential matrix.
    pub inliers: usize,
    pub transforms: RectificationTransforms,
    pub pair: RectifiedStereoPair,
    pub disparity: DisparityField,
    pub cloud: PointCloud,
}

/// Metric relative pose from matched pixels of two views of `model`.
///
/// Returns the pose and the indices of the RANSAC inliers.
///
/// # Errors
///
/// [`CameraModelError::InsufficientData`] when fewer than
/// `options.ransac.min_inliers` matches agree on one essential matrix, and
/// [`CameraModelError::InvalidBaseline`] for a baseline that is not positive.
pub fn metric_relative_pose(
    left: &[Point2<f64>],
    right: &[Point2<f64>],
    model: &RadTanModel,
    options: &StereoOptions,
) -> Result<(Pose, Vec<usize>), CameraModelError> {
    if !(options.baseline > 0.0) || !options.baseline.is_finite() {
        return Err(CameraModelError::InvalidBaseline(options.baseline));
    }
    let terms = model.distortion.terms();
    let normalize = |points: &[Point2<f64>]| -> Result<Vec<Point2<f64>>, CameraModelError> {
        points
            .iter()
            .map(|p| {
                undistort_normalized(&model.intrinsics.normalize(&p.coords), &terms)
                    .map(Point2::from)
            })
            .collect()
    };
    let n1 = normalize(left)?;
    let n2 = normalize(right)?;

    let focal = 0.5 * (model.intrinsics.fx + model.intrinsics.fy);
    let ransac = RansacOptions {
        threshold: options.ransac.threshold / focal,
        ..options.ransac.clone()
    };
    let essential = find_essential_ransac(&n1, &n2, &ransac)?;
    let (in1, in2): (Vec<_>, Vec<_>) = essential.inliers.iter().map(|&i| (n1[i], n2[i])).unzip();
    let recovered = recover_relative_pose(&essential.model, &in1, &in2)?;
    info!(
        "essential matrix: {} of {} matches, {} in front of both cameras",
        essential.inliers.len(),
        left.len(),
        recovered.points_in_front
    );

    // the essential matrix fixes t only up to scale
    let t = recovered.pose.translation();
    let norm = t.norm();
    if !(norm > f64::EPSILON) {
        return Err(CameraModelError::DegenerateConfiguration(
            "recovered translation vanishes".to_string(),
        ));
    }
    let pose = Pose::new(*recovered.pose.rotation(), t * (options.baseline / norm))?;
    Ok((pose, essential.inliers))
}

/// Mode (a): two views of one calibrated camera with unknown relative pose.
///
/// Features are matched, the essential matrix and pose are estimated and
/// scaled to `options.baseline`, then the pair is rectified and matched
/// densely.
pub fn reconstruct_uncalibrated(
    left: &RgbImage,
    right: &RgbImage,
    model: &RadTanModel,
    options: &StereoOptions,
) -> Result<StereoReconstruction, CameraModelError> {
    if left.dimensions() != right.dimensions() {
        return Err(CameraModelError::InvalidParams(format!(
            "left image is {:?} but right image is {:?}",
            left.dimensions(),
            right.dimensions()
        )));
    }
    if !(options.baseline > 0.0) || !options.baseline.is_finite() {
        return Err(CameraModelError::InvalidBaseline(options.baseline));
    }

    let (k1, d1) = detect_and_describe(&grayscale(left), &options.features);
    let (k2, d2) = detect_and_describe(&grayscale(right), &options.features);
    let matches = match_descriptors(&d1, &d2, &options.features);
    info!(
        "{} and {} keypoints, {} matches",
        k1.len(),
        k2.len(),
        matches.len()
    );
    let pts1: Vec<Point2<f64>> = matches.iter().map(|m| k1[m.query].position).collect();
    let pts2: Vec<Point2<f64>> = matches.iter().map(|m| k2[m.train].position).collect();

    let (relative_pose, inliers) = metric_relative_pose(&pts1, &pts2, model, options)?;
    let (pair, transforms) = rectify_pair(left, right, model, &relative_pose)?;
    let (disparity, cloud) = reconstruct_rectified(&pair, &options.disparity)?;

    Ok(StereoReconstruction {
        relative_pose,
        inliers: inliers.len(),
        transforms,
        pair,
        disparity,
        cloud,
    })
}

/// Mode (b) and the shared tail of mode (a): dense matching and
/// triangulation of an already rectified pair.
pub fn reconstruct_rectified(
    pair: &RectifiedStereoPair,
    options: &DisparityOptions,
) -> Result<(DisparityField, PointCloud), CameraModelError> {
    let disparity = compute_disparity(pair, options)?;
    let cloud = triangulate(pair, &disparity)?;
    info!(
        "{} points from {} valid disparities",
        cloud.len(),
        disparity.valid_count()
    );
    Ok((disparity, cloud))
}
