//! Stereo Reconstruction Example
//!
//! Three ways to a coloured point cloud:
//! - `features`: two views of one calibrated camera; the relative pose is
//!   estimated from ORB-like matches and scaled to the given baseline
//! - `middlebury`: a rectified pair with its `calib.txt`
//! - `rgbd`: a 16-bit depth image registered to a colour image
//!
//! Writes a PLY cloud and, for the stereo modes, the normalized disparity.
//!
//! Usage:
//! ```bash
//! cargo run --release --example stereo_reproject -- middlebury \
//!   --left im0.png --right im1.png --calib calib.txt
//! ```

use camera_geometry_tools::camera::{CalibrationParams, PinholeModel, Resolution};
use camera_geometry_tools::stereo::middlebury::MiddleburyCalibration;
use camera_geometry_tools::stereo::rgbd::{back_project_depth, DepthImageOptions};
use camera_geometry_tools::stereo::{
    reconstruct_rectified, reconstruct_uncalibrated, DisparityOptions, RectifiedStereoPair,
    StereoOptions,
};
use camera_geometry_tools::util::ply::{write_ply, PlyFormat};
use camera_geometry_tools::util::visualize::normalize_disparity;
use camera_geometry_tools::util::{ensure_output_dir, load_image, load_options};
use clap::{Parser, Subcommand};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::info;
use std::path::PathBuf;

/// Dense reconstruction from stereo pairs or depth images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Write binary instead of ASCII PLY
    #[arg(long, global = true)]
    binary: bool,

    /// Number of disparities searched
    #[arg(long, global = true, default_value_t = 128)]
    num_disparities: usize,

    /// Disparity options file (YAML or JSON); overrides --num-disparities
    #[arg(long, global = true)]
    disparity_options: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Unknown relative pose, estimated from feature matches
    Features {
        #[arg(long)]
        left: PathBuf,
        #[arg(long)]
        right: PathBuf,
        /// Calibration parameter file shared by both views
        #[arg(long)]
        params: PathBuf,
        /// Distance between the camera centres in metres
        #[arg(long, default_value_t = 0.04)]
        baseline: f64,
    },
    /// Rectified pair with a Middlebury calibration file
    Middlebury {
        #[arg(long)]
        left: PathBuf,
        #[arg(long)]
        right: PathBuf,
        #[arg(long)]
        calib: PathBuf,
    },
    /// Depth and colour images
    Rgbd {
        #[arg(long)]
        depth: PathBuf,
        #[arg(long)]
        color: PathBuf,
        #[arg(long)]
        params: PathBuf,
        /// Raw depth units per metre
        #[arg(long, default_value_t = 5000.0)]
        depth_scale: f64,
        /// Far clipping distance in metres
        #[arg(long, default_value_t = 3.0)]
        truncation: f64,
    },
}

fn path_str(path: &PathBuf) -> Result<&str, Box<dyn std::error::Error>> {
    Ok(path.to_str().ok_or("Invalid path string")?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    let disparity_options: DisparityOptions = match &cli.disparity_options {
        Some(path) => load_options(path)?,
        None => DisparityOptions {
            num_disparities: cli.num_disparities,
            ..DisparityOptions::default()
        },
    };
    ensure_output_dir()?;

    let (cloud, disparity) = match &cli.mode {
        Mode::Features {
            left,
            right,
            params,
            baseline,
        } => {
            let model = CalibrationParams::load_from_yaml(path_str(params)?)?.to_model()?;
            let options = StereoOptions {
                baseline: *baseline,
                disparity: disparity_options,
                ..StereoOptions::default()
            };
            let result = reconstruct_uncalibrated(
                &load_image(path_str(left)?)?,
                &load_image(path_str(right)?)?,
                &model,
                &options,
            )?;
            info!(
                "Relative pose from {} inliers: rvec {:?}, t {:?}",
                result.inliers,
                result.relative_pose.rvec().as_slice(),
                result.relative_pose.translation().as_slice()
            );
            result.pair.left().save("output/rectified_left.png")?;
            result.pair.right().save("output/rectified_right.png")?;
            (result.cloud, Some(result.disparity))
        }
        Mode::Middlebury { left, right, calib } => {
            let left = load_image(path_str(left)?)?;
            let right = load_image(path_str(right)?)?;
            let resolution = Resolution {
                width: left.width(),
                height: left.height(),
            };
            let geometry = MiddleburyCalibration::load(calib)?.to_geometry(Some(resolution))?;
            let pair = RectifiedStereoPair::new(left, right, geometry)?;
            let (disparity, cloud) = reconstruct_rectified(&pair, &disparity_options)?;
            (cloud, Some(disparity))
        }
        Mode::Rgbd {
            depth,
            color,
            params,
            depth_scale,
            truncation,
        } => {
            let model = CalibrationParams::load_from_yaml(path_str(params)?)?.to_model()?;
            let camera = PinholeModel::new(model.intrinsics, model.resolution)?;
            let depth = image::open(depth)?.to_luma16();
            let options = DepthImageOptions {
                depth_scale: *depth_scale,
                truncation: *truncation,
            };
            let cloud = back_project_depth(&depth, &load_image(path_str(color)?)?, &camera, &options)?;
            (cloud, None)
        }
    };

    let format = if cli.binary {
        PlyFormat::BinaryLittleEndian
    } else {
        PlyFormat::Ascii
    };
    write_ply("output/cloud.ply", &cloud, format)?;
    println!(
        "Wrote {} points to output/cloud.ply ({} pixels excluded)",
        cloud.len(),
        cloud.excluded
    );
    if let Some(disparity) = disparity {
        normalize_disparity(&disparity).save("output/disparity.png")?;
        println!(
            "Wrote output/disparity.png ({} valid pixels)",
            disparity.valid_count()
        );
    }
    Ok(())
}
