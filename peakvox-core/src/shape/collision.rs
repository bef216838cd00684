//! Pairwise collision table for the closed set of shapes.

use super::{Aabb, Ellipsoid, Obb, Shape, Sphere};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default bound on the imaginary part of a root counted as real.
pub const DEFAULT_IMAGINARY_TOLERANCE: f64 = 1e-5;
/// Default minimum gap between two negative roots counted as distinct.
pub const DEFAULT_ROOT_SEPARATION: f64 = 1e-5;

/// Tolerances for classifying the roots of the ellipsoid pencil.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuadricTolerance {
    /// Roots with `|im|` below this are treated as real.
    pub imaginary: f64,
    /// Negative roots closer than this are treated as a double root.
    pub separation: f64,
}

impl Default for QuadricTolerance {
    fn default() -> Self {
        Self {
            imaginary: DEFAULT_IMAGINARY_TOLERANCE,
            separation: DEFAULT_ROOT_SEPARATION,
        }
    }
}

/// Exact overlap test between two shapes of any kind.
///
/// Bounding boxes are compared first; only overlapping boxes reach the
/// specific pair function.
#[must_use]
pub fn collide(a: &Shape, b: &Shape, tolerance: &QuadricTolerance) -> bool {
    if !a.aabb().intersects(b.aabb()) {
        return false;
    }
    match (a, b) {
        (Shape::Aabb(a), Shape::Aabb(b)) => a.intersects(b),
        (Shape::Aabb(a), Shape::Obb(b)) | (Shape::Obb(b), Shape::Aabb(a)) => aabb_obb(a, b),
        (Shape::Aabb(a), Shape::Sphere(b)) | (Shape::Sphere(b), Shape::Aabb(a)) => {
            b.collides_aabb(a)
        }
        (Shape::Aabb(a), Shape::Ellipsoid(b)) | (Shape::Ellipsoid(b), Shape::Aabb(a)) => {
            b.collides_aabb(a)
        }
        (Shape::Obb(a), Shape::Obb(b)) => a.collides_obb(b),
        (Shape::Obb(a), Shape::Sphere(b)) | (Shape::Sphere(b), Shape::Obb(a)) => obb_sphere(a, b),
        (Shape::Obb(a), Shape::Ellipsoid(b)) | (Shape::Ellipsoid(b), Shape::Obb(a)) => {
            b.collides_obb(a)
        }
        (Shape::Sphere(a), Shape::Sphere(b)) => a.collides_sphere(b),
        (Shape::Sphere(a), Shape::Ellipsoid(b)) | (Shape::Ellipsoid(b), Shape::Sphere(a)) => {
            b.collides_sphere(a, tolerance)
        }
        (Shape::Ellipsoid(a), Shape::Ellipsoid(b)) => a.collides_ellipsoid(b, tolerance),
    }
}

fn aabb_obb(aabb: &Aabb, obb: &Obb) -> bool {
    obb.collides_obb(&Obb::from_aabb(aabb))
}

fn obb_sphere(obb: &Obb, sphere: &Sphere) -> bool {
    let local = obb.to_local(sphere.center());
    let half = obb.half_extents();
    let closest = local.zip_map(half, |c, h| c.max(-h).min(h));
    (local - closest).norm_squared() <= sphere.radius() * sphere.radius()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use std::f64::consts::FRAC_PI_4;

    fn rotation_z(angle: f64) -> Matrix3<f64> {
        let (s, c) = angle.sin_cos();
        Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
    }

    fn all_kinds(center: Vector3<f64>) -> Vec<Shape> {
        vec![
            Shape::Aabb(Aabb::new(center.add_scalar(-1.0), center.add_scalar(1.0)).unwrap()),
            Shape::Obb(Obb::new(center, Vector3::repeat(1.0), rotation_z(0.3)).unwrap()),
            Shape::Sphere(Sphere::new(center, 1.0).unwrap()),
            Shape::Ellipsoid(Ellipsoid::from_axes(
                center,
                &Vector3::new(1.0, 0.8, 1.2),
                &rotation_z(0.7),
            )),
        ]
    }

    #[test]
    fn test_every_pair_overlapping_and_apart() {
        let tol = QuadricTolerance::default();
        let here = all_kinds(Vector3::zeros());
        let close = all_kinds(Vector3::new(1.2, 0.3, 0.0));
        let far = all_kinds(Vector3::new(10.0, 0.0, 0.0));

        for a in &here {
            for (b, c) in close.iter().zip(&far) {
                assert!(collide(a, b, &tol), "{:?} vs {:?}", a.kind(), b.kind());
                assert!(!collide(a, c, &tol), "{:?} vs far {:?}", a.kind(), c.kind());
                assert_eq!(collide(a, b, &tol), collide(b, a, &tol));
            }
        }
    }

    #[test]
    fn test_obb_sat_separates_rotated_boxes() {
        let a = Obb::new(Vector3::zeros(), Vector3::repeat(1.0), Matrix3::identity()).unwrap();
        // diamond whose corner points at `a` along x
        let b = Obb::new(
            Vector3::new(2.5, 0.0, 0.0),
            Vector3::repeat(1.0),
            rotation_z(FRAC_PI_4),
        )
        .unwrap();
        let c = Obb::new(
            Vector3::new(2.3, 0.0, 0.0),
            Vector3::repeat(1.0),
            rotation_z(FRAC_PI_4),
        )
        .unwrap();

        // corner reaches 2.5 - sqrt(2) = 1.086 > 1 for b, 0.886 for c
        assert!(!a.collides_obb(&b));
        assert!(!b.collides_obb(&a));
        assert!(a.collides_obb(&c));
        assert!(c.collides_obb(&a));
    }

    #[test]
    fn test_sphere_against_box_corner() {
        let tol = QuadricTolerance::default();
        let cube = Shape::Aabb(Aabb::new(Vector3::zeros(), Vector3::repeat(1.0)).unwrap());
        let near = Shape::Sphere(Sphere::new(Vector3::repeat(1.5), 0.9).unwrap());
        let off = Shape::Sphere(Sphere::new(Vector3::repeat(1.5), 0.8).unwrap());

        // corner distance is sqrt(3) / 2 = 0.866
        assert!(collide(&cube, &near, &tol));
        assert!(!collide(&cube, &off, &tol));
    }

    #[test]
    fn test_ellipsoid_inside_obb() {
        let tol = QuadricTolerance::default();
        let obb = Shape::Obb(
            Obb::new(Vector3::zeros(), Vector3::repeat(5.0), rotation_z(0.5)).unwrap(),
        );
        let inner = Shape::Ellipsoid(Ellipsoid::from_axes(
            Vector3::new(1.0, 1.0, 0.0),
            &Vector3::repeat(0.5),
            &Matrix3::identity(),
        ));
        assert!(collide(&obb, &inner, &tol));
        assert!(obb.contains_point(&inner.center()));
    }
}
