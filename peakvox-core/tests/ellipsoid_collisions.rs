#![allow(clippy::uninlined_format_args)]
use nalgebra::{Rotation3, Vector3};
use peakvox_core::{collide, Ellipsoid, QuadricTolerance, Shape};

/// Deterministic uniform samples in `[0, 1)`.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next()
    }
}

fn random_ellipsoids(seed: u64, n: usize) -> Vec<Ellipsoid> {
    let mut rng = Lcg(seed);
    (0..n)
        .map(|_| {
            let center = Vector3::new(rng.range(0.0, 20.0), rng.range(0.0, 20.0), rng.range(0.0, 20.0));
            let radii = Vector3::new(rng.range(0.5, 4.0), rng.range(0.5, 4.0), rng.range(0.5, 4.0));
            let rotation = Rotation3::from_euler_angles(
                rng.range(0.0, 3.0),
                rng.range(0.0, 3.0),
                rng.range(0.0, 3.0),
            );
            Ellipsoid::from_axes(center, &radii, rotation.matrix())
        })
        .collect()
}

/// A point deep inside both shapes on the segment between the centers.
fn shared_interior_point(a: &Ellipsoid, b: &Ellipsoid) -> bool {
    (0..=100).any(|i| {
        let t = f64::from(i) / 100.0;
        let p = a.center() + (b.center() - a.center()) * t;
        a.r2(&p) < 0.9 && b.r2(&p) < 0.9
    })
}

#[test]
fn test_self_collision() {
    let tolerance = QuadricTolerance::default();
    for e in random_ellipsoids(7, 50) {
        assert!(e.collides_ellipsoid(&e, &tolerance));
    }
}

#[test]
fn test_collision_is_symmetric_and_consistent() {
    let tolerance = QuadricTolerance::default();
    let shapes = random_ellipsoids(42, 60);
    let mut hits = 0;
    for (i, a) in shapes.iter().enumerate() {
        for b in &shapes[i + 1..] {
            let ab = a.collides_ellipsoid(b, &tolerance);
            let ba = b.collides_ellipsoid(a, &tolerance);
            assert_eq!(ab, ba, "asymmetric result for {:?} and {:?}", a.center(), b.center());
            assert_eq!(
                collide(&Shape::Ellipsoid(a.clone()), &Shape::Ellipsoid(b.clone()), &tolerance),
                ab
            );

            if shared_interior_point(a, b) {
                assert!(ab, "overlapping pair reported apart");
            }
            let reach = a.radii().max() + b.radii().max();
            if (a.center() - b.center()).norm() > reach {
                assert!(!ab, "distant pair reported colliding");
            }
            hits += usize::from(ab);
        }
    }
    assert!(hits > 0);
}

#[test]
fn test_scaled_copies_collide_once_close_enough() {
    let tolerance = QuadricTolerance::default();
    let a = Ellipsoid::from_axes(
        Vector3::zeros(),
        &Vector3::new(1.0, 2.0, 3.0),
        Rotation3::from_euler_angles(0.2, 0.4, 0.6).matrix(),
    );
    let mut b = a.clone();
    b.translate(&Vector3::new(30.0, 0.0, 0.0));
    assert!(!a.collides_ellipsoid(&b, &tolerance));
    // growing both about their centers eventually makes them touch
    let grown = (1..=20).map(f64::from).find(|&k| a.scaled(k).collides_ellipsoid(&b.scaled(k), &tolerance));
    assert!(grown.is_some());
}
