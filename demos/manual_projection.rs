//! Manual Projection Example
//!
//! Projects 3D points into one image with the explicit projection model and
//! with the solver's parameterization, and tabulates the two side by side.
//! Without `--points`, the standard verification set of the chessboard is
//! used (plane corners, cell centres and points raised above the plane).
//!
//! Usage:
//! ```bash
//! cargo run --example manual_projection -- \
//!   --params output/camera_params.yaml \
//!   --extrinsics output/extrinsics.csv --image left01.png
//! ```

use camera_geometry_tools::camera::projection::{project_points, CROSS_CHECK_TOLERANCE_PX};
use camera_geometry_tools::camera::{verify_projection, CalibrationParams};
use camera_geometry_tools::extractor::GridSize;
use camera_geometry_tools::optimization::solver_projections;
use camera_geometry_tools::util::extrinsics::ExtrinsicsTable;
use camera_geometry_tools::util::points::{read_points_file, verification_points};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

/// Projection verification tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short = 'p', long)]
    params: PathBuf,

    #[arg(short = 'e', long)]
    extrinsics: PathBuf,

    /// Image file name as stored in the extrinsics table
    #[arg(short = 'i', long)]
    image: String,

    /// Optional `X Y Z` points file
    #[arg(long)]
    points: Option<PathBuf>,

    #[arg(short = 'c', long, default_value_t = 8)]
    columns: usize,

    #[arg(short = 'r', long, default_value_t = 6)]
    rows: usize,

    #[arg(short = 's', long, default_value_t = 0.024)]
    square: f64,

    /// Ignore the distortion coefficients
    #[arg(long)]
    no_dist: bool,

    #[arg(short = 'o', long, default_value = "output/manual_projection.csv")]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct Row {
    idx: usize,
    #[serde(rename = "X")]
    x: f64,
    #[serde(rename = "Y")]
    y: f64,
    #[serde(rename = "Z")]
    z: f64,
    u_manual: Option<f64>,
    v_manual: Option<f64>,
    u_cv: Option<f64>,
    v_cv: Option<f64>,
    abs_err_px: Option<f64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let model =
        CalibrationParams::load_from_yaml(cli.params.to_str().ok_or("Invalid params path")?)?
            .to_model()?;
    let distortion = (!cli.no_dist).then_some(&model.distortion);
    let pose = ExtrinsicsTable::load_csv(&cli.extrinsics)?.pose_for(&cli.image)?;

    let points = match &cli.points {
        Some(path) => read_points_file(path)?,
        None => verification_points(GridSize::new(cli.columns, cli.rows), cli.square),
    };
    let manual = project_points(&points, &model.intrinsics, distortion, &pose);
    let solver = solver_projections(&points, &model.intrinsics, distortion, &pose);

    match verify_projection(&solver, &manual, CROSS_CHECK_TOLERANCE_PX) {
        Ok(stats) => info!("Projections agree: {:?}", stats),
        Err(err) => warn!("Projections disagree: {}", err),
    }

    if let Some(parent) = cli.output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(&cli.output)?;
    for (idx, ((p, m), s)) in points.iter().zip(&manual).zip(&solver).enumerate() {
        writer.serialize(Row {
            idx,
            x: p.x,
            y: p.y,
            z: p.z,
            u_manual: m.map(|m| m.x),
            v_manual: m.map(|m| m.y),
            u_cv: s.map(|s| s.x),
            v_cv: s.map(|s| s.y),
            abs_err_px: m.zip(*s).map(|(m, s)| (m - s).norm()),
        })?;
    }
    writer.flush()?;
    println!("{} points written to {:?}", points.len(), cli.output);
    Ok(())
}
