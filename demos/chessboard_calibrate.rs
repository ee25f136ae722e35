//! Chessboard Calibration Example
//!
//! Detects a chessboard in every image of a directory, calibrates the
//! camera and writes:
//! - the calibration parameter file (YAML)
//! - the per-image extrinsics table (CSV)
//! - the per-image reprojection error table, worst view first (CSV)
//!
//! Usage:
//! ```bash
//! cargo run --example chessboard_calibrate -- \
//!   --images data/calib \
//!   --columns 8 --rows 6 --square 0.024
//! ```

use camera_geometry_tools::camera::{CalibrationParams, Resolution};
use camera_geometry_tools::extractor::{extract_batch, ExtractorOptions, GridSize};
use camera_geometry_tools::optimization::{calibrate_camera, CalibrationOptions};
use camera_geometry_tools::util::extrinsics::{
    save_view_errors, ExtrinsicsRecord, ExtrinsicsTable, ViewErrorRecord,
};
use camera_geometry_tools::util::load_gray_image;
use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Planar-target camera calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory with the calibration images
    #[arg(short = 'i', long)]
    images: PathBuf,

    /// Inner corners per row
    #[arg(short = 'c', long, default_value_t = 8)]
    columns: usize,

    /// Inner corners per column
    #[arg(short = 'r', long, default_value_t = 6)]
    rows: usize,

    /// Square size in metres
    #[arg(short = 's', long, default_value_t = 0.024)]
    square: f64,

    /// Number of distortion coefficients to estimate
    #[arg(short = 'd', long, default_value_t = 5)]
    distortion_terms: usize,

    /// Output directory
    #[arg(short = 'o', long, default_value = "output")]
    output: PathBuf,
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
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
    let grid = GridSize::new(cli.columns, cli.rows);
    info!("Grid {}x{}, square {} m", grid.columns, grid.rows, cli.square);

    let mut images = Vec::new();
    for path in list_images(&cli.images)? {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or("Invalid image file name")?
            .to_string();
        let path_str = path.to_str().ok_or("Invalid image path string")?;
        images.push((name, load_gray_image(path_str)?));
    }
    let (width, height) = images
        .first()
        .map(|(_, image)| image.dimensions())
        .ok_or("No images found")?;
    if let Some((name, _)) = images.iter().find(|(_, i)| i.dimensions() != (width, height)) {
        return Err(format!("{name} does not match the {width}x{height} image size").into());
    }

    let batch = extract_batch(&images, grid, cli.square, &ExtractorOptions::default());
    for (name, err) in &batch.rejected {
        warn!("Skipping {}: {}", name, err);
    }
    println!(
        "Detected the pattern in {} of {} images",
        batch.accepted.len(),
        images.len()
    );

    let (names, sets): (Vec<String>, Vec<_>) = batch.accepted.into_iter().unzip();
    let options = CalibrationOptions {
        distortion_terms: cli.distortion_terms,
        verbose: true,
        ..CalibrationOptions::default()
    };
    let result = calibrate_camera(&sets, Resolution { width, height }, &options)?;

    println!("\n📷 Calibration Result");
    println!("=====================");
    println!("Intrinsics: {:?}", result.model.intrinsics);
    println!("Distortion: {:?}", result.model.distortion.coefficients());
    println!("RMS reprojection error: {:.4} px", result.rms);
    println!("Solver/model deviation: {:.2e} px", result.max_model_deviation);
    if !result.quality.is_nominal() {
        warn!("Calibration quality: {:?}", result.quality);
    }

    fs::create_dir_all(&cli.output)?;
    let params_path = cli.output.join("camera_params.yaml");
    CalibrationParams::from_model(&result.model, Some(result.rms))
        .save_to_yaml(params_path.to_str().ok_or("Invalid output path")?)?;

    let mut extrinsics = ExtrinsicsTable::default();
    let mut view_errors = Vec::new();
    for ((name, pose), error) in names.iter().zip(&result.poses).zip(&result.per_view) {
        extrinsics.push(ExtrinsicsRecord::new(name, pose, error.rmse));
        view_errors.push(ViewErrorRecord::new(name, error));
    }
    extrinsics.save_csv(cli.output.join("extrinsics.csv"))?;
    save_view_errors(cli.output.join("per_view_errors.csv"), &view_errors, true)?;

    info!("Results written to {:?}", cli.output);
    Ok(())
}
