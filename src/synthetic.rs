//! Synthetic scenes for the test suites: planar target views, rendered
//! chessboards and rectified stereo pairs with known geometry.

use crate::camera::projection::project_points;
use crate::camera::{Distortion, Intrinsics};
use crate::extractor::{object_points, GridSize};
use crate::geometry::{CorrespondenceSet, Pose};
use image::{GrayImage, Luma, Rgb, RgbImage};
use nalgebra::{Matrix3, Point2, Vector3};

/// `fx = fy = 1200`, principal point at the centre of a 1920x1080 image.
pub fn hd_intrinsics() -> Intrinsics {
    Intrinsics::new(1200.0, 1200.0, 960.0, 540.0)
}

/// Pose `i` of a deterministic sequence of tilted target poses, each
/// keeping the target centred in front of the camera at about `distance`.
pub fn target_pose(i: usize, grid: GridSize, square: f64, distance: f64) -> Pose {
    let angle = i as f64 * 0.7;
    let rvec = Vector3::new(
        0.35 * angle.sin(),
        0.3 * (1.3 * angle).cos(),
        0.15 * (0.5 * angle).sin(),
    );
    let rotation = crate::geometry::rotation::axis_angle_to_matrix(&rvec);
    let centre = Vector3::new(
        (grid.columns - 1) as f64 * square / 2.0,
        (grid.rows - 1) as f64 * square / 2.0,
        0.0,
    );
    let offset = Vector3::new(
        0.02 * (1.7 * angle).sin(),
        0.015 * (0.9 * angle).cos(),
        distance + 0.05 * (1.1 * angle).sin(),
    );
    // place the rotated board centre at `offset`
    let translation = offset - rotation * centre;
    Pose::new(rotation, translation).unwrap_or_else(|_| Pose::identity())
}

/// Noiseless views of a planar grid.
pub fn planar_views(
    grid: GridSize,
    square: f64,
    intrinsics: &Intrinsics,
    distortion: Option<&Distortion>,
    count: usize,
) -> Vec<(Pose, CorrespondenceSet)> {
    let objects = object_points(grid, square);
    (0..count)
        .map(|i| {
            let pose = target_pose(i, grid, square, 0.5);
            let pixels: Vec<Point2<f64>> = project_points(&objects, intrinsics, distortion, &pose)
                .into_iter()
                .flatten()
                .collect();
            let set = CorrespondenceSet::new(objects.clone(), pixels)
                .unwrap_or_else(|_| panic!("view {i} lost points behind the camera"));
            (pose, set)
        })
        .collect()
}

/// Renders a chessboard with `grid` inner corners seen through the
/// homography `h` (board units to pixels), anti-aliased by supersampling.
///
/// The board has a white margin of one square around the outer squares.
pub fn render_chessboard(
    width: u32,
    height: u32,
    grid: GridSize,
    h: &Matrix3<f64>,
) -> GrayImage {
    const SAMPLES: u32 = 4;
    let h_inv = h.try_inverse().unwrap_or_else(Matrix3::identity);
    let squares_x = grid.columns as f64 + 1.0;
    let squares_y = grid.rows as f64 + 1.0;

    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0u32;
        for sy in 0..SAMPLES {
            for sx in 0..SAMPLES {
                let u = x as f64 + (sx as f64 + 0.5) / SAMPLES as f64 - 0.5;
                let v = y as f64 + (sy as f64 + 0.5) / SAMPLES as f64 - 0.5;
                let p = h_inv * Vector3::new(u, v, 1.0);
                let (bx, by) = (p.x / p.z, p.y / p.z);
                // board units: inner corner (0,0) sits at the origin
                let cx = bx + 1.0;
                let cy = by + 1.0;
                let inside_board = cx >= 0.0 && cx < squares_x && cy >= 0.0 && cy < squares_y;
                let value = if inside_board && ((cx.floor() as i64 + cy.floor() as i64) % 2 == 0) {
                    30
                } else {
                    225
                };
                acc += value;
            }
        }
        Luma([(acc / (SAMPLES * SAMPLES)) as u8])
    })
}

/// Homography placing inner corner `(i, j)` at `origin + i * du + j * dv`.
pub fn affine_board(origin: Point2<f64>, du: Vector3<f64>, dv: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        du.x, dv.x, origin.x, //
        du.y, dv.y, origin.y, //
        0.0, 0.0, 1.0,
    )
}

/// A textured rectified pair whose true disparity is `disparity(x, y)`.
///
/// The right image samples the left texture at `x + d`, so a pixel at
/// column `x` in the left image appears at `x - d` in the right one.
pub fn stereo_pair<F>(width: u32, height: u32, disparity: F) -> (RgbImage, RgbImage)
where
    F: Fn(u32, u32) -> f64,
{
    let texture = |x: f64, y: f64| -> u8 {
        let a = (x * 0.37).sin() * (y * 0.23).cos();
        let b = ((x * 0.11 + y * 0.07).sin() * 3.1).cos();
        let c = (((x as i64 / 3) * 7919 + (y as i64 / 3) * 104729) % 97) as f64 / 97.0;
        (60.0 + 50.0 * a + 40.0 * b + 60.0 * c).clamp(0.0, 255.0) as u8
    };
    let left = RgbImage::from_fn(width, height, |x, y| {
        let g = texture(x as f64, y as f64);
        Rgb([g, g.wrapping_add(17), 255 - g])
    });
    let right = RgbImage::from_fn(width, height, |x, y| {
        let mut xs = x as f64;
        // fixed point of x_r = x_l - d(x_l)
        for _ in 0..4 {
            xs = x as f64 + disparity(xs.round().max(0.0) as u32, y);
        }
        let g = texture(xs.round(), y as f64);
        Rgb([g, g.wrapping_add(17), 255 - g])
    });
    (left, right)
}
