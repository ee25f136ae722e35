//! Semi-global block matching on a rectified pair.
//!
//! The matching cost is the sum of absolute grey-level differences over a
//! square block. Costs are aggregated along 4 or 8 scanline directions with
//! the usual `P1`/`P2` smoothness penalties, the winner is checked for
//! uniqueness and left-right consistency, and surviving disparities get a
//! parabolic sub-pixel correction. Rejected pixels are `None`, and so are
//! the leftmost `min_disparity + num_disparities - 1` columns, which lack a
//! complete search range.

use crate::camera::CameraModelError;
use crate::stereo::{DisparityField, RectifiedStereoPair};
use image::imageops::grayscale;
use image::GrayImage;
use log::debug;
use serde::{Deserialize, Serialize};

/// Largest block whose SAD still fits a `u16` cost.
pub const MAX_BLOCK_SIZE: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisparityOptions {
    pub min_disparity: i32,
    /// Size of the searched range.
    pub num_disparities: usize,
    /// Odd side length of the matching block.
    pub block_size: usize,
    /// Percentage by which the best cost must beat every other candidate.
    pub uniqueness_ratio: u32,
    /// Largest left-right disagreement in pixels; `None` disables the check.
    pub disp12_max_diff: Option<u32>,
    /// Penalty for a disparity change of one pixel between neighbours.
    pub p1: u32,
    /// Penalty for larger disparity changes.
    pub p2: u32,
    /// Aggregate along diagonals as well.
    pub eight_paths: bool,
}

impl Default for DisparityOptions {
    fn default() -> Self {
        let block_size = 5;
        DisparityOptions {
            min_disparity: 0,
            num_disparities: 128,
            block_size,
            uniqueness_ratio: 10,
            disp12_max_diff: Some(1),
            p1: 8 * (block_size * block_size) as u32,
            p2: 32 * (block_size * block_size) as u32,
            eight_paths: false,
        }
    }
}

impl DisparityOptions {
    fn validate(&self) -> Result<(), CameraModelError> {
        if self.num_disparities == 0 {
            return Err(CameraModelError::InvalidParams(
                "num_disparities must be positive".to_string(),
            ));
        }
        if self.block_size == 0 || self.block_size % 2 == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(CameraModelError::InvalidParams(format!(
                "block_size must be odd and at most {}, got {}",
                MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if self.uniqueness_ratio >= 100 {
            return Err(CameraModelError::InvalidParams(format!(
                "uniqueness_ratio must be below 100, got {}",
                self.uniqueness_ratio
            )));
        }
        if self.p2 < self.p1 {
            return Err(CameraModelError::InvalidParams(
                "p2 must not be smaller than p1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Block SAD cost volume, indexed `(y * width + x) * range + d`.
struct CostVolume {
    width: usize,
    height: usize,
    range: usize,
    costs: Vec<u16>,
}

impl CostVolume {
    fn index(&self, x: usize, y: usize, d: usize) -> usize {
        (y * self.width + x) * self.range + d
    }
}

fn block_costs(left: &GrayImage, right: &GrayImage, options: &DisparityOptions) -> CostVolume {
    let (w, h) = (left.width() as usize, left.height() as usize);
    let range = options.num_disparities;
    let half = (options.block_size / 2) as i64;
    let area = (options.block_size * options.block_size) as u64;
    let mut costs = vec![0u16; w * h * range];

    let mut integral = vec![0u64; (w + 1) * (h + 1)];
    for d in 0..range {
        let shift = options.min_disparity as i64 + d as i64;
        // integral image of the absolute differences for this disparity
        for y in 0..h {
            let mut row_sum = 0u64;
            for x in 0..w {
                let xr = x as i64 - shift;
                let diff = if xr >= 0 && xr < w as i64 {
                    (left.get_pixel(x as u32, y as u32)[0] as i32
                        - right.get_pixel(xr as u32, y as u32)[0] as i32)
                        .unsigned_abs() as u64
                } else {
                    255
                };
                row_sum += diff;
                integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row_sum;
            }
        }
        for y in 0..h {
            let y0 = (y as i64 - half).max(0) as usize;
            let y1 = (y as i64 + half).min(h as i64 - 1) as usize + 1;
            for x in 0..w {
                let x0 = (x as i64 - half).max(0) as usize;
                let x1 = (x as i64 + half).min(w as i64 - 1) as usize + 1;
                let sum = integral[y1 * (w + 1) + x1] + integral[y0 * (w + 1) + x0]
                    - integral[y0 * (w + 1) + x1]
                    - integral[y1 * (w + 1) + x0];
                let count = ((y1 - y0) * (x1 - x0)) as u64;
                costs[(y * w + x) * range + d] = (sum * area / count).min(u16::MAX as u64) as u16;
            }
        }
    }
    CostVolume {
        width: w,
        height: h,
        range,
        costs,
    }
}

/// Sums the path costs of every direction into one volume.
///
/// Path costs live in two rolling rows; only the block costs and the sum are
/// full volumes. Penalties may be arbitrarily large, so every sum saturates.
fn aggregate(volume: &CostVolume, options: &DisparityOptions) -> Vec<u32> {
    let (w, h, range) = (volume.width, volume.height, volume.range);
    let mut directions: Vec<(i64, i64)> = vec![(1, 0), (-1, 0), (0, 1), (0, -1)];
    if options.eight_paths {
        directions.extend([(1, 1), (-1, -1), (1, -1), (-1, 1)]);
    }
    let mut total = vec![0u32; volume.costs.len()];
    let mut previous_row = vec![0u32; w * range];
    let mut current_row = vec![0u32; w * range];

    for (dx, dy) in directions {
        let rows: Vec<usize> = if dy >= 0 {
            (0..h).collect()
        } else {
            (0..h).rev().collect()
        };
        let columns: Vec<usize> = if dx >= 0 {
            (0..w).collect()
        } else {
            (0..w).rev().collect()
        };
        for (row_index, &y) in rows.iter().enumerate() {
            for &x in &columns {
                let px = x as i64 - dx;
                let has_previous = px >= 0
                    && px < w as i64
                    && (dy == 0 || row_index > 0);
                let base = x * range;
                let cost = &volume.costs[volume.index(x, y, 0)..volume.index(x, y, 0) + range];
                if !has_previous {
                    for (dst, &c) in current_row[base..base + range].iter_mut().zip(cost) {
                        *dst = c as u32;
                    }
                } else {
                    let source = if dy == 0 { &current_row } else { &previous_row };
                    let pbase = px as usize * range;
                    let prev: Vec<u32> = source[pbase..pbase + range].to_vec();
                    let prev_min = prev.iter().copied().min().unwrap_or(0);
                    for d in 0..range {
                        let mut best = prev[d];
                        if d > 0 {
                            best = best.min(prev[d - 1].saturating_add(options.p1));
                        }
                        if d + 1 < range {
                            best = best.min(prev[d + 1].saturating_add(options.p1));
                        }
                        best = best.min(prev_min.saturating_add(options.p2));
                        current_row[base + d] = (cost[d] as u32).saturating_add(best - prev_min);
                    }
                }
                let offset = volume.index(x, y, 0);
                for d in 0..range {
                    total[offset + d] = total[offset + d].saturating_add(current_row[base + d]);
                }
            }
            std::mem::swap(&mut previous_row, &mut current_row);
        }
    }
    total
}

fn winner(costs: &[u32]) -> Option<usize> {
    (0..costs.len()).min_by_key(|&d| (costs[d], d))
}

/// Dense disparity of the left image of a rectified pair.
///
/// # Errors
///
/// [`CameraModelError::InvalidParams`] for inconsistent options.
pub fn compute_disparity(
    pair: &RectifiedStereoPair,
    options: &DisparityOptions,
) -> Result<DisparityField, CameraModelError> {
    options.validate()?;
    let left = grayscale(pair.left());
    let right = grayscale(pair.right());
    let (w, h) = (left.width() as usize, left.height() as usize);

    let volume = block_costs(&left, &right, options);
    let total = aggregate(&volume, options);
    let range = volume.range;
    let min_d = options.min_disparity as i64;

    // best disparity seen from the right image, for the consistency check
    let mut right_disparity = vec![None; w * h];
    if options.disp12_max_diff.is_some() {
        for y in 0..h {
            for xr in 0..w {
                right_disparity[y * w + xr] = (0..range)
                    .filter_map(|d| {
                        let x = xr as i64 + min_d + d as i64;
                        (x >= 0 && x < w as i64)
                            .then(|| (total[volume.index(x as usize, y, d)], d))
                    })
                    .min()
                    .map(|(_, d)| d);
            }
        }
    }

    let mut values = vec![None; w * h];
    for y in 0..h {
        for x in 0..w {
            // every candidate must land inside the right image
            if (x as i64) < min_d + range as i64 - 1 {
                continue;
            }
            let offset = volume.index(x, y, 0);
            let costs = &total[offset..offset + range];
            let Some(best) = winner(costs) else {
                continue;
            };
            let best_cost = costs[best] as u64;
            let ambiguous = (0..range).any(|d| {
                d.abs_diff(best) > 1
                    && costs[d] as u64 * (100 - options.uniqueness_ratio as u64)
                        <= best_cost * 100
            });
            if ambiguous {
                continue;
            }
            if let Some(max_diff) = options.disp12_max_diff {
                let xr = x as i64 - min_d - best as i64;
                let consistent = xr >= 0
                    && right_disparity[y * w + xr as usize]
                        .map_or(false, |dr: usize| dr.abs_diff(best) as u32 <= max_diff);
                if !consistent {
                    continue;
                }
            }
            let mut refined = best as f64;
            if best > 0 && best + 1 < range {
                let (c0, c1, c2) = (
                    costs[best - 1] as f64,
                    costs[best] as f64,
                    costs[best + 1] as f64,
                );
                let denominator = c0 + c2 - 2.0 * c1;
                if denominator > 0.0 {
                    refined += (c0 - c2) / (2.0 * denominator);
                }
            }
            values[y * w + x] = Some((refined + min_d as f64) as f32);
        }
    }

    let field = DisparityField::new(w, h, values)?;
    debug!(
        "disparity: {} of {} pixels valid",
        field.valid_count(),
        w * h
    );
    Ok(field)
}
