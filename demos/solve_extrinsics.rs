//! Per-Image Extrinsics Example
//!
//! Solves the pose of a chessboard in every image of a directory with a
//! known calibration and writes the extrinsics table.
//!
//! Usage:
//! ```bash
//! cargo run --example solve_extrinsics -- \
//!   --params output/camera_params.yaml \
//!   --images data/scenes --columns 8 --rows 6 --square 0.024 [--no-dist]
//! ```

use camera_geometry_tools::camera::CalibrationParams;
use camera_geometry_tools::extractor::{find_with_swap, object_points, ExtractorOptions, GridSize};
use camera_geometry_tools::geometry::CorrespondenceSet;
use camera_geometry_tools::optimization::{solve_pose, PoseSolverOptions};
use camera_geometry_tools::util::extrinsics::{ExtrinsicsRecord, ExtrinsicsTable};
use camera_geometry_tools::util::load_gray_image;
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::path::PathBuf;

/// Chessboard pose solver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Calibration parameter file
    #[arg(short = 'p', long)]
    params: PathBuf,

    /// Directory with the images
    #[arg(short = 'i', long)]
    images: PathBuf,

    #[arg(short = 'c', long, default_value_t = 8)]
    columns: usize,

    #[arg(short = 'r', long, default_value_t = 6)]
    rows: usize,

    /// Square size in metres
    #[arg(short = 's', long, default_value_t = 0.024)]
    square: f64,

    /// Ignore the distortion coefficients
    #[arg(long)]
    no_dist: bool,

    /// Output CSV
    #[arg(short = 'o', long, default_value = "output/extrinsics.csv")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let params = CalibrationParams::load_from_yaml(cli.params.to_str().ok_or("Invalid params path")?)?;
    let model = params.to_model()?;
    let distortion = (!cli.no_dist).then_some(&model.distortion);
    info!(
        "Loaded camera {:?}, distortion {}",
        model.intrinsics,
        if distortion.is_some() { "on" } else { "off" }
    );

    let mut paths: Vec<PathBuf> = fs::read_dir(&cli.images)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let grid = GridSize::new(cli.columns, cli.rows);
    let options = ExtractorOptions::default();
    let mut table = ExtrinsicsTable::default();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or("Invalid image file name")?
            .to_string();
        let Ok(image) = load_gray_image(path.to_str().ok_or("Invalid image path")?) else {
            continue;
        };
        let (matched, corners) = match find_with_swap(&image, grid, &options) {
            Ok(found) => found,
            Err(err) => {
                warn!("{}: {}", name, err);
                continue;
            }
        };
        let set = CorrespondenceSet::new(object_points(matched, cli.square), corners)?;
        match solve_pose(&set, &model.intrinsics, distortion, &PoseSolverOptions::default()) {
            Ok(solution) => {
                println!(
                    "{}: rvec {:?}, tvec {:?}, rms {:.4} px ({:?})",
                    name,
                    solution.pose.rvec().as_slice(),
                    solution.pose.translation().as_slice(),
                    solution.error.rmse,
                    solution.method
                );
                table.push(ExtrinsicsRecord::new(&name, &solution.pose, solution.error.rmse));
            }
            Err(err) => warn!("{}: {}", name, err),
        }
    }

    if let Some(parent) = cli.output.parent() {
        fs::create_dir_all(parent)?;
    }
    table.save_csv(&cli.output)?;
    info!("{} poses written to {:?}", table.records.len(), cli.output);
    Ok(())
}
