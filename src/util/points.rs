//! Object-point files and the standard verification point sets.

use crate::extractor::{object_points, GridSize};
use crate::util::UtilError;
use nalgebra::Point3;
use std::fs;
use std::path::Path;

/// Parses one `X Y Z` triple per line.
///
/// Blank lines and lines starting with `#` are skipped; commas count as
/// whitespace. Extra trailing fields are ignored.
pub fn parse_points(text: &str) -> Result<Vec<Point3<f64>>, UtilError> {
    let mut points = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cleaned = line.replace(',', " ");
        let fields: Vec<&str> = cleaned.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(UtilError::ParseError {
                line: index + 1,
                reason: format!("expected 'X Y Z', got '{line}'"),
            });
        }
        let mut xyz = [0.0; 3];
        for (dst, src) in xyz.iter_mut().zip(fields.iter()) {
            *dst = src.parse::<f64>().map_err(|e| UtilError::ParseError {
                line: index + 1,
                reason: format!("'{src}': {e}"),
            })?;
        }
        points.push(Point3::new(xyz[0], xyz[1], xyz[2]));
    }
    Ok(points)
}

pub fn read_points_file<P: AsRef<Path>>(path: P) -> Result<Vec<Point3<f64>>, UtilError> {
    parse_points(&fs::read_to_string(path)?)
}

/// Centres of the `(columns-1) x (rows-1)` cells between inner corners.
pub fn cell_centers(grid: GridSize, square: f64) -> Vec<Point3<f64>> {
    let mut points = Vec::new();
    for i in 0..grid.columns.saturating_sub(1) {
        for j in 0..grid.rows.saturating_sub(1) {
            points.push(Point3::new(
                (i as f64 + 0.5) * square,
                (j as f64 + 0.5) * square,
                0.0,
            ));
        }
    }
    points
}

/// Points raised above three seed cells, `(1,1)`, `(c/2-1, r/2-1)` and
/// `(c-3, r-3)`, at each height given in squares.
pub fn off_plane_points(grid: GridSize, square: f64, heights: &[f64]) -> Vec<Point3<f64>> {
    let (nx, ny) = (grid.columns as i64, grid.rows as i64);
    let seeds = [(1, 1), (nx / 2 - 1, ny / 2 - 1), (nx - 3, ny - 3)];
    let mut points = Vec::new();
    for (i, j) in seeds {
        let cx = (i as f64 + 0.5) * square;
        let cy = (j as f64 + 0.5) * square;
        for h in heights {
            points.push(Point3::new(cx, cy, h * square));
        }
    }
    points
}

/// Plane corners, cell centres and off-plane points at 0.5 and 1.0 squares.
pub fn verification_points(grid: GridSize, square: f64) -> Vec<Point3<f64>> {
    let mut points = object_points(grid, square);
    points.extend(cell_centers(grid, square));
    points.extend(off_plane_points(grid, square, &[0.5, 1.0]));
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_points_with_comments_and_commas() {
        let text = "# header\n\n1 2 3\n4.5,5.5, 6.5\n  # indented comment\n-1e-3 0 2 extra\n";
        let points = parse_points(text).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1], Point3::new(4.5, 5.5, 6.5));
        assert_eq!(points[2], Point3::new(-1e-3, 0.0, 2.0));
    }

    #[test]
    fn test_parse_points_reports_line() {
        match parse_points("1 2 3\n1 2\n") {
            Err(UtilError::ParseError { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_points("1 two 3\n"),
            Err(UtilError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_verification_points_layout() {
        let grid = GridSize::new(9, 6);
        let points = verification_points(grid, 2.0);
        assert_eq!(points.len(), 54 + 40 + 6);
        assert_eq!(points[54], Point3::new(1.0, 1.0, 0.0));
        let raised = &points[94..];
        assert_eq!(raised[0], Point3::new(3.0, 3.0, 1.0));
        assert_eq!(raised[1], Point3::new(3.0, 3.0, 2.0));
        assert_eq!(raised[2], Point3::new(7.0, 5.0, 1.0));
        assert_eq!(raised[5], Point3::new(13.0, 7.0, 2.0));
    }
}
