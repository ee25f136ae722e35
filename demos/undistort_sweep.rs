//! Radial Distortion Sweep Example
//!
//! Finds the chessboard in one image, searches the `k1` that makes the grid
//! rows and columns straightest, and writes the original next to the image
//! undistorted with that `k1`.
//!
//! Usage:
//! ```bash
//! cargo run --example undistort_sweep -- --image board.jpg --columns 8 --rows 6
//! ```

use camera_geometry_tools::camera::{
    CalibrationParams, Distortion, Intrinsics, RadTanModel, Resolution,
};
use camera_geometry_tools::extractor::{find_with_swap, ExtractorOptions, GridSize};
use camera_geometry_tools::optimization::sweep::k1_straightness_sweep;
use camera_geometry_tools::optimization::SweepOptions;
use camera_geometry_tools::stereo::rectify::undistort_image;
use camera_geometry_tools::util::{ensure_output_dir, load_image};
use clap::Parser;
use image::imageops::{grayscale, replace};
use image::RgbImage;
use log::info;
use std::path::PathBuf;

/// k1 straightness sweep
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short = 'i', long)]
    image: PathBuf,

    #[arg(short = 'c', long, default_value_t = 8)]
    columns: usize,

    #[arg(short = 'r', long, default_value_t = 6)]
    rows: usize,

    /// Calibration file for the camera matrix; guessed from the image size
    /// when absent
    #[arg(short = 'p', long)]
    params: Option<PathBuf>,

    #[arg(long, default_value_t = -0.6)]
    start: f64,

    #[arg(long, default_value_t = 0.6)]
    end: f64,

    #[arg(long, default_value_t = 25)]
    steps: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let color = load_image(cli.image.to_str().ok_or("Invalid image path")?)?;
    let resolution = Resolution {
        width: color.width(),
        height: color.height(),
    };
    let intrinsics = match &cli.params {
        Some(path) => {
            CalibrationParams::load_from_yaml(path.to_str().ok_or("Invalid params path")?)?
                .to_model()?
                .intrinsics
        }
        None => Intrinsics::guess_from_resolution(&resolution),
    };
    info!("Camera matrix {:?}", intrinsics);

    let (grid, corners) = find_with_swap(
        &grayscale(&color),
        GridSize::new(cli.columns, cli.rows),
        &ExtractorOptions::default(),
    )?;
    let options = SweepOptions {
        start: cli.start,
        end: cli.end,
        steps: cli.steps,
    };
    let report = k1_straightness_sweep(&corners, grid, &intrinsics, &options)?;

    println!("k1        straightness_rms_px");
    for (k1, score) in &report.sweep.samples {
        match score {
            Some(rms) => println!("{:+.4}   {:.4}", k1, rms),
            None => println!("{:+.4}   -", k1),
        }
    }
    println!("as detected: {:.4}", report.original_rms);
    let (best_k1, best_rms) = report.sweep.best.ok_or("No k1 could be scored")?;
    println!("best k1 {:+.4} with {:.4} px", best_k1, best_rms);

    let model = RadTanModel::from_parts(intrinsics, resolution, Distortion::radial_k1(best_k1))?;
    let undistorted = undistort_image(&color, &model);
    let mut side_by_side = RgbImage::new(resolution.width * 2, resolution.height);
    replace(&mut side_by_side, &color, 0, 0);
    replace(&mut side_by_side, &undistorted, resolution.width as i64, 0);

    ensure_output_dir()?;
    side_by_side.save("output/undistort_side_by_side.png")?;
    println!("Wrote output/undistort_side_by_side.png");
    Ok(())
}
