//! 8-bit renderings of disparity fields for inspection.

use crate::stereo::DisparityField;
use image::{GrayImage, Luma};

/// Linear map of valid disparities onto `0..=255`.
///
/// The range is taken over valid pixels only; invalid pixels are black. A
/// field with a single disparity value maps every valid pixel to 255.
pub fn normalize_disparity(field: &DisparityField) -> GrayImage {
    let (min, max) = field
        .values()
        .iter()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &d| {
            (lo.min(d), hi.max(d))
        });
    let span = max - min;

    GrayImage::from_fn(field.width() as u32, field.height() as u32, |x, y| {
        match field.get(x as usize, y as usize) {
            Some(d) if span > f32::EPSILON => {
                Luma([((d - min) / span * 255.0).round().clamp(0.0, 255.0) as u8])
            }
            Some(_) => Luma([255]),
            None => Luma([0]),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_disparity() {
        let field =
            DisparityField::new(3, 1, vec![Some(10.0), None, Some(30.0)]).unwrap();
        let image = normalize_disparity(&field);
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(1, 0)[0], 0);
        assert_eq!(image.get_pixel(2, 0)[0], 255);

        let flat = DisparityField::new(2, 1, vec![Some(4.0), None]).unwrap();
        let image = normalize_disparity(&flat);
        assert_eq!(image.get_pixel(0, 0)[0], 255);
    }
}
