//! Multi-view geometry shared by the calibrator, the pose solver and the
//! stereo reconstructor.

use crate::camera::CameraModelError;
use nalgebra::{Matrix3, Point2, Point3, Vector3};

pub mod essential;
pub mod homography;
pub mod pnp;
pub mod pose;
pub mod ransac;
pub mod rotation;
pub mod triangulation;

pub use pose::Pose;

/// Ordered `(object point, pixel)` pairs observed in one image.
///
/// Planar targets put every object point on `Z = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceSet {
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl CorrespondenceSet {
    pub fn new(
        object_points: Vec<Point3<f64>>,
        image_points: Vec<Point2<f64>>,
    ) -> Result<Self, CameraModelError> {
        if object_points.len() != image_points.len() {
            return Err(CameraModelError::InvalidParams(format!(
                "{} object points but {} image points",
                object_points.len(),
                image_points.len()
            )));
        }
        let finite = object_points
            .iter()
            .all(|p| p.coords.iter().all(|v| v.is_finite()))
            && image_points
                .iter()
                .all(|p| p.coords.iter().all(|v| v.is_finite()));
        if !finite {
            return Err(CameraModelError::InvalidParams(
                "correspondences must be finite".to_string(),
            ));
        }
        Ok(CorrespondenceSet {
            object_points,
            image_points,
        })
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }

    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }

    /// True when every object point lies on `Z = 0`.
    pub fn lies_on_target_plane(&self) -> bool {
        self.object_points.iter().all(|p| p.z.abs() < 1e-12)
    }
}

/// How a set of 3D points is spread in space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointLayout {
    /// All points (nearly) on one line, or coincident.
    Collinear,
    Planar,
    General,
}

/// Principal axes of a point cloud, sorted by decreasing spread.
pub struct PrincipalFrame {
    pub centroid: Vector3<f64>,
    /// Columns are the axes; the third is the plane normal for planar data.
    pub axes: Matrix3<f64>,
    pub singular_values: Vector3<f64>,
}

/// PCA of a point set via the SVD of its centred scatter matrix.
pub fn principal_frame(points: &[Point3<f64>]) -> Result<PrincipalFrame, CameraModelError> {
    if points.is_empty() {
        return Err(CameraModelError::InsufficientData {
            required: 1,
            found: 0,
        });
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let mut scatter = Matrix3::zeros();
    for p in points {
        let d = p.coords - centroid;
        scatter += d * d.transpose();
    }
    let svd = scatter.svd(true, false);
    let u = svd
        .u
        .ok_or_else(|| CameraModelError::NumericalError("SVD of scatter failed".to_string()))?;

    // nalgebra does not guarantee ordering for 3x3 SVD results
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    let mut axes = Matrix3::zeros();
    let mut singular_values = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        axes.set_column(dst, &u.column(src));
        singular_values[dst] = svd.singular_values[src].max(0.0).sqrt();
    }
    if axes.determinant() < 0.0 {
        let flipped = -axes.column(2);
        axes.set_column(2, &flipped);
    }
    Ok(PrincipalFrame {
        centroid,
        axes,
        singular_values,
    })
}

/// Classifies a point set by the relative size of its principal spreads.
pub fn classify_layout(points: &[Point3<f64>], tolerance: f64) -> Result<PointLayout, CameraModelError> {
    let frame = principal_frame(points)?;
    let s = frame.singular_values;
    if s[0] <= f64::EPSILON || s[1] <= tolerance * s[0] {
        return Ok(PointLayout::Collinear);
    }
    if s[2] <= tolerance * s[0] {
        return Ok(PointLayout::Planar);
    }
    Ok(PointLayout::General)
}

/// Hartley normalization: centroid at the origin, mean distance `sqrt(2)`.
///
/// Returns the normalized points and the 3x3 transform `T` with
/// `p_norm = T * p`, or `None` when every point coincides.
pub fn normalize_points_2d(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(x, y), p| (x + p.x, y + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_distance = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_distance <= f64::EPSILON {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_distance;
    let transform = Matrix3::new(
        scale, 0.0, -scale * cx, //
        0.0, scale, -scale * cy, //
        0.0, 0.0, 1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Point2::new(scale * (p.x - cx), scale * (p.y - cy)))
        .collect();
    Some((normalized, transform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_correspondence_set_validation() {
        let obj = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let img = vec![Point2::new(10.0, 10.0)];
        assert!(CorrespondenceSet::new(obj.clone(), img).is_err());

        let img = vec![Point2::new(10.0, 10.0), Point2::new(f64::NAN, 3.0)];
        assert!(CorrespondenceSet::new(obj.clone(), img).is_err());

        let img = vec![Point2::new(10.0, 10.0), Point2::new(20.0, 10.0)];
        let set = CorrespondenceSet::new(obj, img).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.lies_on_target_plane());
    }

    #[test]
    fn test_classify_layout() {
        let line: Vec<_> = (0..6).map(|i| Point3::new(i as f64, 2.0 * i as f64, 0.0)).collect();
        assert_eq!(classify_layout(&line, 1e-6).unwrap(), PointLayout::Collinear);

        let plane: Vec<_> = (0..12)
            .map(|i| Point3::new((i % 4) as f64, (i / 4) as f64, 0.0))
            .collect();
        assert_eq!(classify_layout(&plane, 1e-6).unwrap(), PointLayout::Planar);

        let mut general = plane.clone();
        general.push(Point3::new(1.0, 1.0, 1.5));
        assert_eq!(classify_layout(&general, 1e-6).unwrap(), PointLayout::General);
    }

    #[test]
    fn test_principal_frame_normal_of_plane() {
        let plane: Vec<_> = (0..12)
            .map(|i| Point3::new((i % 4) as f64, (i / 4) as f64, 0.0))
            .collect();
        let frame = principal_frame(&plane).unwrap();
        assert_relative_eq!(frame.axes.column(2).z.abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(frame.axes.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_normalize_points_2d() {
        let points = vec![
            Point2::new(100.0, 200.0),
            Point2::new(150.0, 250.0),
            Point2::new(120.0, 220.0),
        ];
        let (normalized, t) = normalize_points_2d(&points).unwrap();
        let mean_distance =
            normalized.iter().map(|p| p.coords.norm()).sum::<f64>() / normalized.len() as f64;
        assert_relative_eq!(mean_distance, std::f64::consts::SQRT_2, epsilon = 1e-12);
        let mapped = t * Vector3::new(150.0, 250.0, 1.0);
        assert_relative_eq!(mapped.x, normalized[1].x, epsilon = 1e-12);

        assert!(normalize_points_2d(&[Point2::new(1.0, 1.0), Point2::new(1.0, 1.0)]).is_none());
    }
}
