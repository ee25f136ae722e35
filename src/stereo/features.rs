//! ORB-like sparse features: FAST-9 corners, intensity-centroid orientation
//! and steered 256-bit BRIEF descriptors, matched by brute-force Hamming
//! distance with a cross-check.

use crate::extractor::{gaussian_blur, sample_bilinear, to_f32, GrayF32};
use image::GrayImage;
use log::debug;
use nalgebra::Point2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Packed 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Bresenham circle of radius 3 used by the segment test.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
const ARC_LENGTH: usize = 9;
const PATTERN_SEED: u64 = 0x0b1e_f5ee_d000_0001;
const PATTERN_EXTENT: i32 = 13;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOptions {
    /// Keep at most this many strongest corners.
    pub max_features: usize,
    /// Segment-test intensity threshold.
    pub fast_threshold: f32,
    /// Radius of the orientation patch.
    pub patch_radius: u32,
    /// Smoothing applied before sampling descriptor pairs.
    pub blur_sigma: f32,
    /// Matches farther apart than this many bits are dropped.
    pub max_hamming: u32,
    pub cross_check: bool,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        FeatureOptions {
            max_features: 5000,
            fast_threshold: 20.0,
            patch_radius: 15,
            blur_sigma: 2.0,
            max_hamming: 64,
            cross_check: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub position: Point2<f64>,
    pub score: f32,
    /// Orientation in radians.
    pub angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Largest threshold for which `(x, y)` still passes the segment test.
fn fast_score(image: &GrayF32, x: u32, y: u32) -> f32 {
    let center = image.get_pixel(x, y)[0];
    let mut ring = [0.0f32; 16];
    for (value, (dx, dy)) in ring.iter_mut().zip(CIRCLE.iter()) {
        *value = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] - center;
    }
    let mut best = 0.0f32;
    for start in 0..16 {
        let mut brighter = f32::INFINITY;
        let mut darker = f32::INFINITY;
        for k in 0..ARC_LENGTH {
            let d = ring[(start + k) % 16];
            brighter = brighter.min(d);
            darker = darker.min(-d);
        }
        best = best.max(brighter).max(darker);
    }
    best
}

/// FAST-9 corners with 3x3 non-maximum suppression, strongest first.
pub fn detect_fast(image: &GrayF32, threshold: f32, border: u32) -> Vec<Keypoint> {
    let (w, h) = image.dimensions();
    let border = border.max(3);
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }
    let mut scores = vec![0.0f32; (w * h) as usize];
    for y in border..h - border {
        for x in border..w - border {
            let s = fast_score(image, x, y);
            if s > threshold {
                scores[(y * w + x) as usize] = s;
            }
        }
    }

    let mut keypoints = Vec::new();
    for y in border..h - border {
        for x in border..w - border {
            let s = scores[(y * w + x) as usize];
            if s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            for yy in y - 1..=y + 1 {
                for xx in x - 1..=x + 1 {
                    let o = scores[(yy * w + xx) as usize];
                    if o > s || (o == s && (yy, xx) < (y, x)) {
                        is_max = false;
                    }
                }
            }
            if is_max {
                keypoints.push(Keypoint {
                    position: Point2::new(x as f64, y as f64),
                    score: s,
                    angle: 0.0,
                });
            }
        }
    }
    keypoints.sort_by(|a, b| b.score.total_cmp(&a.score));
    keypoints
}

/// Intensity-centroid orientation over a disc of `radius`.
pub fn orientation(image: &GrayF32, keypoint: &Point2<f64>, radius: u32) -> f32 {
    let r = radius as i32;
    let (mut m10, mut m01) = (0.0f32, 0.0f32);
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let v = sample_bilinear(image, keypoint.x as f32 + dx as f32, keypoint.y as f32 + dy as f32);
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

fn brief_pattern() -> &'static [[(i32, i32); 2]; 256] {
    static PATTERN: OnceLock<[[(i32, i32); 2]; 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut pattern = [[(0, 0); 2]; 256];
        for pair in pattern.iter_mut() {
            for point in pair.iter_mut() {
                *point = (
                    rng.random_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.random_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                );
            }
        }
        pattern
    })
}

/// Steered BRIEF: pairwise intensity tests rotated by the keypoint angle.
pub fn describe(smoothed: &GrayF32, keypoint: &Keypoint) -> Descriptor {
    let (sin_a, cos_a) = keypoint.angle.sin_cos();
    let sample = |(px, py): (i32, i32)| {
        let x = cos_a * px as f32 - sin_a * py as f32;
        let y = sin_a * px as f32 + cos_a * py as f32;
        sample_bilinear(
            smoothed,
            (keypoint.position.x as f32 + x).round(),
            (keypoint.position.y as f32 + y).round(),
        )
    };
    let mut descriptor = [0u8; 32];
    for (j, pair) in brief_pattern().iter().enumerate() {
        if sample(pair[0]) < sample(pair[1]) {
            descriptor[j / 8] |= 1 << (j % 8);
        }
    }
    descriptor
}

/// Detects up to `options.max_features` oriented keypoints and their
/// descriptors.
pub fn detect_and_describe(
    image: &GrayImage,
    options: &FeatureOptions,
) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let raw = to_f32(image);
    let border = options.patch_radius + PATTERN_EXTENT as u32 / 2 + 3;
    let mut keypoints = detect_fast(&raw, options.fast_threshold, border);
    keypoints.truncate(options.max_features);

    let smoothed = gaussian_blur(&raw, options.blur_sigma);
    for keypoint in keypoints.iter_mut() {
        keypoint.angle = orientation(&raw, &keypoint.position, options.patch_radius);
    }
    let descriptors = keypoints.iter().map(|k| describe(&smoothed, k)).collect();
    debug!("{} keypoints", keypoints.len());
    (keypoints, descriptors)
}

pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x ^ y).count_ones())
        .sum()
}

fn best_match(query: &Descriptor, train: &[Descriptor]) -> Option<(usize, u32)> {
    train
        .iter()
        .enumerate()
        .map(|(j, d)| (j, hamming_distance(query, d)))
        .min_by_key(|&(j, d)| (d, j))
}

/// Brute-force nearest-neighbour matching.
///
/// With `cross_check`, a pair is kept only when each descriptor is the
/// other's nearest neighbour.
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    options: &FeatureOptions,
) -> Vec<FeatureMatch> {
    let backward: Vec<Option<usize>> = if options.cross_check {
        train
            .iter()
            .map(|d| best_match(d, query).map(|(i, _)| i))
            .collect()
    } else {
        Vec::new()
    };

    query
        .iter()
        .enumerate()
        .filter_map(|(i, d)| {
            let (j, distance) = best_match(d, train)?;
            if distance > options.max_hamming {
                return None;
            }
            if options.cross_check && backward[j] != Some(i) {
                return None;
            }
            Some(FeatureMatch {
                query: i,
                train: j,
                distance,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::stereo_pair;
    use image::imageops::grayscale;
    use image::Luma;

    #[test]
    fn test_fast_detects_square_corners() {
        let image = GrayF32::from_fn(40, 40, |x, y| {
            Luma([if (12..28).contains(&x) && (12..28).contains(&y) { 200.0 } else { 20.0 }])
        });
        let keypoints = detect_fast(&image, 20.0, 3);
        assert!(!keypoints.is_empty());
        for corner in [(12.0, 12.0), (27.0, 12.0), (12.0, 27.0), (27.0, 27.0)] {
            assert!(keypoints
                .iter()
                .any(|k| (k.position - Point2::new(corner.0, corner.1)).norm() <= 1.5));
        }
        // flat interior and edges are not corners
        assert!(keypoints
            .iter()
            .all(|k| (k.position.x - 20.0).abs() > 4.0 || (k.position.y - 20.0).abs() > 4.0));
    }

    #[test]
    fn test_orientation_follows_gradient() {
        let image = GrayF32::from_fn(64, 64, |x, _| Luma([x as f32]));
        let angle = orientation(&image, &Point2::new(32.0, 32.0), 15);
        assert!(angle.abs() < 1e-3);
        let image = GrayF32::from_fn(64, 64, |_, y| Luma([y as f32]));
        let angle = orientation(&image, &Point2::new(32.0, 32.0), 15);
        assert!((angle - std::f32::consts::FRAC_PI_2).abs() < 1e-3);
    }

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(hamming_distance(&a, &b), 11);
        assert_eq!(hamming_distance(&b, &b), 0);
    }

    #[test]
    fn test_shifted_images_match_with_constant_offset() {
        let (left, right) = stereo_pair(320, 240, |_, _| 12.0);
        let options = FeatureOptions::default();
        let (k1, d1) = detect_and_describe(&grayscale(&left), &options);
        let (k2, d2) = detect_and_describe(&grayscale(&right), &options);
        let matches = match_descriptors(&d1, &d2, &options);
        assert!(matches.len() > 30, "only {} matches", matches.len());

        let consistent = matches
            .iter()
            .filter(|m| {
                let delta = k2[m.train].position - k1[m.query].position;
                (delta.x + 12.0).abs() <= 1.0 && delta.y.abs() <= 1.0
            })
            .count();
        assert!(consistent as f64 >= 0.8 * matches.len() as f64);
    }
}
