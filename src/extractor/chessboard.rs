//! Chessboard inner-corner detection.
//!
//! 1. Saddle response `Ixy^2 - Ixx * Iyy` of the blurred image, thresholded
//!    relative to its maximum and reduced by non-maximum suppression.
//! 2. A ring test keeps only X-junctions: four dark/light transitions on a
//!    circle around the candidate.
//! 3. The grid is grown from a seed by predicting each neighbour from the
//!    local lattice steps, and accepted when it fills `columns x rows`.
//! 4. The grid is oriented (see [`crate::extractor`]) and optionally refined
//!    to sub-pixel accuracy.

use crate::camera::CameraModelError;
use crate::extractor::subpix::refine_corners;
use crate::extractor::{gaussian_blur, sample_bilinear, to_f32, ExtractorOptions, GrayF32, GridSize};
use image::GrayImage;
use log::debug;
use nalgebra::{Point2, Vector2};
use std::collections::{HashMap, VecDeque};

const RING_SAMPLES: usize = 32;
/// Fraction of the lattice step within which a candidate matches a prediction.
const MATCH_TOLERANCE: f64 = 0.3;
const MAX_SEEDS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    position: Point2<f64>,
    score: f32,
}

fn saddle_response(image: &GrayF32) -> Vec<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut response = vec![0.0f32; w * h];
    if w < 3 || h < 3 {
        return response;
    }
    let at = |x: usize, y: usize| image.get_pixel(x as u32, y as u32)[0];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = at(x, y);
            let ixx = at(x + 1, y) - 2.0 * c + at(x - 1, y);
            let iyy = at(x, y + 1) - 2.0 * c + at(x, y - 1);
            let ixy = (at(x + 1, y + 1) - at(x + 1, y - 1) - at(x - 1, y + 1)
                + at(x - 1, y - 1))
                / 4.0;
            let s = ixy * ixy - ixx * iyy;
            if s > 0.0 {
                response[y * w + x] = s;
            }
        }
    }
    response
}

fn local_maxima(response: &[f32], width: usize, height: usize, options: &ExtractorOptions) -> Vec<Candidate> {
    let max = response.iter().cloned().fold(0.0f32, f32::max);
    if max <= f32::EPSILON {
        return Vec::new();
    }
    let threshold = max * options.relative_threshold;
    let r = options.nms_radius as usize;
    let border = options.ring_radius.ceil() as usize + 2;
    if width <= 2 * border || height <= 2 * border {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for y in border..height - border {
        for x in border..width - border {
            let s = response[y * width + x];
            if s < threshold {
                continue;
            }
            let mut is_max = true;
            'window: for yy in y.saturating_sub(r)..=(y + r).min(height - 1) {
                for xx in x.saturating_sub(r)..=(x + r).min(width - 1) {
                    let o = response[yy * width + xx];
                    // ties resolve to the first pixel in raster order
                    if o > s || (o == s && (yy, xx) < (y, x)) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                candidates.push(Candidate {
                    position: Point2::new(x as f64, y as f64),
                    score: s,
                });
            }
        }
    }
    candidates
}

/// Four light/dark transitions on a ring around `p`.
fn is_x_junction(image: &GrayF32, p: &Point2<f64>, options: &ExtractorOptions) -> bool {
    let mut ring = [0.0f32; RING_SAMPLES];
    for (k, value) in ring.iter_mut().enumerate() {
        let angle = k as f32 * std::f32::consts::TAU / RING_SAMPLES as f32;
        *value = sample_bilinear(
            image,
            p.x as f32 + options.ring_radius * angle.cos(),
            p.y as f32 + options.ring_radius * angle.sin(),
        );
    }
    let lo = ring.iter().cloned().fold(f32::INFINITY, f32::min);
    let hi = ring.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if hi - lo < options.min_contrast {
        return false;
    }
    let mid = (lo + hi) / 2.0;
    let transitions = (0..RING_SAMPLES)
        .filter(|&k| (ring[k] > mid) != (ring[(k + 1) % RING_SAMPLES] > mid))
        .count();
    transitions == 4
}

fn nearest(
    candidates: &[Candidate],
    target: &Point2<f64>,
    radius: f64,
) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, (c.position - target).norm()))
        .filter(|&(_, d)| d <= radius)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Lattice node reached during growth, with the local steps along both axes.
#[derive(Debug, Clone, Copy)]
struct Node {
    candidate: usize,
    steps: [Vector2<f64>; 2],
}

/// Initial lattice steps at a seed: nearest neighbour and the nearest one
/// not parallel to it.
fn seed_steps(candidates: &[Candidate], seed: usize) -> Option<[Vector2<f64>; 2]> {
    let origin = candidates[seed].position;
    let mut by_distance: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != seed)
        .map(|(i, c)| (i, (c.position - origin).norm()))
        .collect();
    by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));

    let &(first, d1) = by_distance.first()?;
    if d1 < 1.0 {
        return None;
    }
    let e1 = candidates[first].position - origin;
    by_distance
        .iter()
        .skip(1)
        .take(8)
        .map(|&(i, d)| (candidates[i].position - origin, d))
        .find(|(v, d)| (v.dot(&e1) / (d * d1)).abs() < 0.5 && *d < 2.0 * d1)
        .map(|(e2, _)| [e1, e2])
}

/// Breadth-first growth of the lattice from `seed`.
fn grow(candidates: &[Candidate], seed: usize) -> Option<HashMap<(i64, i64), Node>> {
    let steps = seed_steps(candidates, seed)?;
    let mut nodes: HashMap<(i64, i64), Node> = HashMap::new();
    let mut used = vec![false; candidates.len()];
    nodes.insert(
        (0, 0),
        Node {
            candidate: seed,
            steps,
        },
    );
    used[seed] = true;
    let mut queue = VecDeque::from([(0i64, 0i64)]);

    while let Some(key) = queue.pop_front() {
        let node = nodes[&key];
        let here = candidates[node.candidate].position;
        for (axis, sign) in [(0usize, 1.0), (0, -1.0), (1, 1.0), (1, -1.0)] {
            let next = if axis == 0 {
                (key.0 + sign as i64, key.1)
            } else {
                (key.0, key.1 + sign as i64)
            };
            if nodes.contains_key(&next) {
                continue;
            }
            let step = node.steps[axis] * sign;
            let predicted = here + step;
            let radius = MATCH_TOLERANCE * step.norm().min(node.steps[1 - axis].norm());
            let Some(found) = nearest(candidates, &predicted, radius) else {
                continue;
            };
            if used[found] {
                continue;
            }
            let mut steps = node.steps;
            steps[axis] = (candidates[found].position - here) * sign;
            used[found] = true;
            nodes.insert(
                next,
                Node {
                    candidate: found,
                    steps,
                },
            );
            queue.push_back(next);
        }
    }
    Some(nodes)
}

/// Arranges a grown lattice into `grid` order, or `None` if it does not
/// match the grid exactly.
fn arrange(
    candidates: &[Candidate],
    nodes: &HashMap<(i64, i64), Node>,
    grid: GridSize,
) -> Option<Vec<Point2<f64>>> {
    if nodes.len() != grid.count() {
        return None;
    }
    let min_a = nodes.keys().map(|k| k.0).min()?;
    let max_a = nodes.keys().map(|k| k.0).max()?;
    let min_b = nodes.keys().map(|k| k.1).min()?;
    let max_b = nodes.keys().map(|k| k.1).max()?;
    let extent_a = (max_a - min_a + 1) as usize;
    let extent_b = (max_b - min_b + 1) as usize;
    if extent_a * extent_b != grid.count() {
        return None;
    }
    let at = |a: usize, b: usize| -> Point2<f64> {
        candidates[nodes[&(min_a + a as i64, min_b + b as i64)].candidate].position
    };

    // lattice axis `a` along the grid columns, or transposed
    let transpose = match (
        (extent_a, extent_b) == (grid.columns, grid.rows),
        (extent_b, extent_a) == (grid.columns, grid.rows),
    ) {
        (true, false) => false,
        (false, true) => true,
        (true, true) => {
            // square grid: columns follow the axis closest to image u
            let da = at(extent_a - 1, 0) - at(0, 0);
            let db = at(0, extent_b - 1) - at(0, 0);
            (db.x.abs() / db.norm()) > (da.x.abs() / da.norm())
        }
        (false, false) => return None,
    };

    let mut grid_points = vec![Point2::origin(); grid.count()];
    for j in 0..grid.rows {
        for i in 0..grid.columns {
            grid_points[j * grid.columns + i] = if transpose { at(j, i) } else { at(i, j) };
        }
    }

    orient(&mut grid_points, grid);
    Some(grid_points)
}

/// Flips rows and columns so the first row runs along `+u` and the board
/// axes keep a positive image cross product.
fn orient(points: &mut [Point2<f64>], grid: GridSize) {
    let (c, r) = (grid.columns, grid.rows);
    let along_row: Vector2<f64> = (0..r)
        .map(|j| points[j * c + c - 1] - points[j * c])
        .sum();
    if along_row.x < 0.0 {
        for row in points.chunks_mut(c) {
            row.reverse();
        }
    }
    let along_row: Vector2<f64> = (0..r)
        .map(|j| points[j * c + c - 1] - points[j * c])
        .sum();
    let along_column: Vector2<f64> = (0..c)
        .map(|i| points[(r - 1) * c + i] - points[i])
        .sum();
    if along_row.x * along_column.y - along_row.y * along_column.x < 0.0 {
        let flipped: Vec<Point2<f64>> = (0..r)
            .rev()
            .flat_map(|j| points[j * c..(j + 1) * c].to_vec())
            .collect();
        points.copy_from_slice(&flipped);
    }
}

/// Finds the `grid` inner corners of a chessboard.
///
/// # Errors
///
/// [`CameraModelError::PatternNotFound`] when no lattice of exactly
/// `columns x rows` X-junctions is found.
pub fn find_chessboard_corners(
    image: &GrayImage,
    grid: GridSize,
    options: &ExtractorOptions,
) -> Result<Vec<Point2<f64>>, CameraModelError> {
    let not_found = CameraModelError::PatternNotFound {
        columns: grid.columns,
        rows: grid.rows,
    };
    if grid.columns < 2 || grid.rows < 2 {
        return Err(CameraModelError::InvalidParams(format!(
            "grid must be at least 2x2, got {}x{}",
            grid.columns, grid.rows
        )));
    }

    let raw = to_f32(image);
    let blurred = gaussian_blur(&raw, options.blur_sigma);
    let response = saddle_response(&blurred);
    let mut candidates: Vec<Candidate> = local_maxima(
        &response,
        blurred.width() as usize,
        blurred.height() as usize,
        options,
    )
    .into_iter()
    .filter(|c| is_x_junction(&blurred, &c.position, options))
    .collect();
    debug!("{} X-junction candidates", candidates.len());
    if candidates.len() < grid.count() {
        return Err(not_found);
    }
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    for seed in 0..candidates.len().min(MAX_SEEDS) {
        let Some(nodes) = grow(&candidates, seed) else {
            continue;
        };
        if let Some(coarse) = arrange(&candidates, &nodes, grid) {
            debug!("grid grown from seed {}", seed);
            if !options.refine {
                return Ok(coarse);
            }
            return Ok(refine_corners(&raw, &coarse, &options.subpix));
        }
    }
    Err(not_found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::projection::project_points;
    use crate::camera::Intrinsics;
    use crate::extractor::object_points;
    use crate::synthetic::{affine_board, render_chessboard, target_pose};
    use image::Luma;
    use nalgebra::{Matrix3, Vector3};

    fn max_error(found: &[Point2<f64>], expected: &[Point2<f64>]) -> f64 {
        found
            .iter()
            .zip(expected)
            .map(|(a, b)| (a - b).norm())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_fronto_parallel_board() {
        let grid = GridSize::new(8, 6);
        let origin = Point2::new(120.3, 90.6);
        let h = affine_board(origin, Vector3::new(40.0, 3.0, 0.0), Vector3::new(-2.0, 40.0, 0.0));
        let image = render_chessboard(640, 480, grid, &h);
        let corners = find_chessboard_corners(&image, grid, &ExtractorOptions::default()).unwrap();

        let expected: Vec<_> = (0..grid.count())
            .map(|k| {
                let (i, j) = ((k % 8) as f64, (k / 8) as f64);
                Point2::new(origin.x + 40.0 * i - 2.0 * j, origin.y + 3.0 * i + 40.0 * j)
            })
            .collect();
        assert!(max_error(&corners, &expected) < 0.1);
    }

    #[test]
    fn test_rotated_board_keeps_canonical_order() {
        let grid = GridSize::new(7, 5);
        // board x axis points to image -u, y axis to image -v
        let h = affine_board(
            Point2::new(400.0, 300.0),
            Vector3::new(-36.0, 0.0, 0.0),
            Vector3::new(0.0, -36.0, 0.0),
        );
        let image = render_chessboard(560, 420, grid, &h);
        let corners = find_chessboard_corners(&image, grid, &ExtractorOptions::default()).unwrap();
        // first corner is the top-left one and rows grow downward
        assert!((corners[0] - Point2::new(400.0 - 6.0 * 36.0, 300.0 - 4.0 * 36.0)).norm() < 0.1);
        assert!(corners[1].x > corners[0].x);
        assert!(corners[7].y > corners[0].y);
    }

    #[test]
    fn test_perspective_board_matches_projection() {
        let grid = GridSize::new(8, 6);
        let square = 0.024;
        let intrinsics = Intrinsics::new(600.0, 600.0, 480.0, 270.0);
        let pose = target_pose(2, grid, square, 0.5);
        let r = pose.rotation();
        let t = pose.translation();
        let board = Matrix3::new(
            r[(0, 0)] * square, r[(0, 1)] * square, t.x, //
            r[(1, 0)] * square, r[(1, 1)] * square, t.y, //
            r[(2, 0)] * square, r[(2, 1)] * square, t.z,
        );
        let h = intrinsics.matrix() * board;
        let image = render_chessboard(960, 540, grid, &h);

        let corners = find_chessboard_corners(&image, grid, &ExtractorOptions::default()).unwrap();
        let expected: Vec<_> = project_points(&object_points(grid, square), &intrinsics, None, &pose)
            .into_iter()
            .flatten()
            .collect();
        assert!(max_error(&corners, &expected) < 0.15);
    }

    #[test]
    fn test_wrong_grid_is_not_found() {
        let h = affine_board(
            Point2::new(100.0, 100.0),
            Vector3::new(30.0, 0.0, 0.0),
            Vector3::new(0.0, 30.0, 0.0),
        );
        let image = render_chessboard(400, 340, GridSize::new(6, 5), &h);
        assert!(matches!(
            find_chessboard_corners(&image, GridSize::new(7, 5), &ExtractorOptions::default()),
            Err(CameraModelError::PatternNotFound { columns: 7, rows: 5 })
        ));
        let blank = GrayImage::from_pixel(64, 64, Luma([200]));
        assert!(find_chessboard_corners(&blank, GridSize::new(3, 3), &ExtractorOptions::default())
            .is_err());
    }
}
