//! Quadric ellipsoids and their collision tests.
//!
//! An ellipsoid is stored as a center `c` and a symmetric positive-definite
//! metric `M`; a point `p` is inside iff `(p - c)ᵀ M (p - c) <= 1`. The inverse
//! metric is kept alongside because the bounding box, the volume and the
//! principal radii are all read from it directly.

use super::{Aabb, Obb, QuadricTolerance, Sphere};
use crate::error::{Error, Result};
use nalgebra::{Matrix2, Matrix3, Matrix4, SymmetricEigen, Vector3};
use std::cmp::Ordering;
use std::f64::consts::PI;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A solid ellipsoid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ellipsoid {
    center: Vector3<f64>,
    metric: Matrix3<f64>,
    inverse_metric: Matrix3<f64>,
    aabb: Aabb,
}

/// Planar slice through an ellipsoid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ellipse2D {
    /// Center of the slice, in volume coordinates.
    pub center: Vector3<f64>,
    /// Semi-axis lengths, largest first.
    pub semi_axes: [f64; 2],
    /// Unit directions of the semi-axes, lying in the cutting plane.
    pub directions: [Vector3<f64>; 2],
}

impl Ellipsoid {
    /// Creates an ellipsoid from its center and metric tensor.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if the metric is not symmetric
    /// positive-definite.
    pub fn from_metric(center: Vector3<f64>, metric: Matrix3<f64>) -> Result<Self> {
        if (metric - metric.transpose()).amax() > 1e-9 * metric.amax().max(1.0) {
            return Err(Error::InvalidShape("metric is not symmetric".into()));
        }
        let inverse_metric = metric
            .cholesky()
            .map(|c| c.inverse())
            .ok_or_else(|| Error::InvalidShape("metric is not positive-definite".into()))?;
        Ok(Self::from_parts(center, metric, inverse_metric))
    }

    /// Creates an ellipsoid from semi-axis lengths and the matching unit
    /// directions (as columns of `axes`).
    ///
    /// A zero radius yields a flat ellipsoid whose metric is not finite;
    /// check [`Ellipsoid::min_radius`] before using such a shape in
    /// collision tests.
    #[must_use]
    pub fn from_axes(center: Vector3<f64>, radii: &Vector3<f64>, axes: &Matrix3<f64>) -> Self {
        let squared = radii.component_mul(radii);
        let metric = axes * Matrix3::from_diagonal(&squared.map(|r2| 1.0 / r2)) * axes.transpose();
        let inverse_metric = axes * Matrix3::from_diagonal(&squared) * axes.transpose();
        Self::from_parts(center, metric, inverse_metric)
    }

    pub(crate) fn from_parts(
        center: Vector3<f64>,
        metric: Matrix3<f64>,
        inverse_metric: Matrix3<f64>,
    ) -> Self {
        let mut ellipsoid = Self {
            center,
            metric,
            inverse_metric,
            aabb: Aabb::spanning(center, center),
        };
        ellipsoid.update_aabb();
        ellipsoid
    }

    fn update_aabb(&mut self) {
        let half = self.inverse_metric.diagonal().map(f64::sqrt);
        self.aabb = Aabb::spanning(self.center - half, self.center + half);
    }

    #[must_use]
    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    #[must_use]
    pub fn metric(&self) -> &Matrix3<f64> {
        &self.metric
    }

    #[must_use]
    pub fn inverse_metric(&self) -> &Matrix3<f64> {
        &self.inverse_metric
    }

    /// Bounding box; recomputed on every transform.
    #[must_use]
    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    /// Principal semi-axis lengths (ascending) and their directions as columns.
    #[must_use]
    pub fn radii_and_axes(&self) -> (Vector3<f64>, Matrix3<f64>) {
        let eigen = SymmetricEigen::new(self.inverse_metric);
        let mut order = [0, 1, 2];
        order.sort_by(|&i, &j| eigen.eigenvalues[i].total_cmp(&eigen.eigenvalues[j]));
        let radii = Vector3::from_fn(|k, _| eigen.eigenvalues[order[k]].max(0.0).sqrt());
        let axes = Matrix3::from_fn(|r, k| eigen.eigenvectors[(r, order[k])]);
        (radii, axes)
    }

    /// Principal semi-axis lengths, ascending.
    #[must_use]
    pub fn radii(&self) -> Vector3<f64> {
        self.radii_and_axes().0
    }

    /// Smallest principal semi-axis length.
    #[must_use]
    pub fn min_radius(&self) -> f64 {
        self.radii()[0]
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        4.0 * PI / 3.0 * self.inverse_metric.determinant().max(0.0).sqrt()
    }

    /// Squared metric distance of `point` from the center.
    #[must_use]
    pub fn r2(&self, point: &Vector3<f64>) -> f64 {
        let u = point - self.center;
        u.dot(&(self.metric * u))
    }

    #[must_use]
    pub fn contains_point(&self, point: &Vector3<f64>) -> bool {
        self.r2(point) <= 1.0
    }

    /// Scales the ellipsoid about its center.
    pub fn scale(&mut self, factor: f64) {
        let f2 = factor * factor;
        self.metric /= f2;
        self.inverse_metric *= f2;
        self.update_aabb();
    }

    /// Returns a copy scaled about its center.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let mut copy = self.clone();
        copy.scale(factor);
        copy
    }

    pub fn translate(&mut self, offset: &Vector3<f64>) {
        self.center += offset;
        self.update_aabb();
    }

    /// Rotates the ellipsoid about its center by an orthogonal matrix.
    pub fn rotate(&mut self, rotation: &Matrix3<f64>) {
        self.metric = rotation * self.metric * rotation.transpose();
        self.inverse_metric = rotation * self.inverse_metric * rotation.transpose();
        self.update_aabb();
    }

    /// 4×4 quadric form `[[M, -Mc], [-cᵀM, cᵀMc - 1]]`.
    #[must_use]
    pub fn homogeneous_matrix(&self) -> Matrix4<f64> {
        let mc = self.metric * self.center;
        let mut q = Matrix4::zeros();
        q.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.metric);
        q.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-mc));
        q.fixed_view_mut::<1, 3>(3, 0).copy_from(&(-mc).transpose());
        q[(3, 3)] = self.center.dot(&mc) - 1.0;
        q
    }

    /// Closed-form inverse of [`Ellipsoid::homogeneous_matrix`].
    #[must_use]
    pub fn homogeneous_matrix_inverse(&self) -> Matrix4<f64> {
        let c = &self.center;
        let mut q = Matrix4::zeros();
        q.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.inverse_metric - c * c.transpose()));
        q.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-c));
        q.fixed_view_mut::<1, 3>(3, 0).copy_from(&(-c).transpose());
        q[(3, 3)] = -1.0;
        q
    }

    /// Point of the plane `{x : n·x = n·point}` with the smallest metric
    /// distance to the center.
    #[must_use]
    pub fn intersection_center(&self, normal: &Vector3<f64>, point: &Vector3<f64>) -> Vector3<f64> {
        let ain = self.inverse_metric * normal;
        let lambda = (point.dot(normal) - self.center.dot(normal)) / normal.dot(&ain);
        self.center + lambda * ain
    }

    /// Slice of the ellipsoid by the plane through `point` with the given
    /// normal, or `None` if the plane misses it.
    #[must_use]
    pub fn cross_section(&self, normal: &Vector3<f64>, point: &Vector3<f64>) -> Option<Ellipse2D> {
        let n = normal.try_normalize(f64::EPSILON)?;
        let center = self.intersection_center(&n, point);
        let remaining = 1.0 - self.r2(&center);
        if remaining.is_nan() || remaining < 0.0 {
            return None;
        }

        let helper = if n.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let u = n.cross(&helper).normalize();
        let v = n.cross(&u);
        let mu = self.metric * u;
        let mv = self.metric * v;
        let restricted = Matrix2::new(u.dot(&mu), u.dot(&mv), v.dot(&mu), v.dot(&mv));
        let eigen = SymmetricEigen::new(restricted);

        let (big, small) = if eigen.eigenvalues[0] <= eigen.eigenvalues[1] {
            (0, 1)
        } else {
            (1, 0)
        };
        let direction = |k: usize| {
            let e = eigen.eigenvectors.column(k);
            (e[0] * u + e[1] * v).normalize()
        };
        Some(Ellipse2D {
            center,
            semi_axes: [
                (remaining / eigen.eigenvalues[big]).sqrt(),
                (remaining / eigen.eigenvalues[small]).sqrt(),
            ],
            directions: [direction(big), direction(small)],
        })
    }

    /// Total order used to evaluate a pair test the same way whichever
    /// operand comes first.
    fn canonical_cmp(&self, other: &Ellipsoid) -> Ordering {
        self.center
            .iter()
            .chain(self.metric.iter())
            .zip(other.center.iter().chain(other.metric.iter()))
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Ellipsoid–ellipsoid overlap.
    ///
    /// The characteristic polynomial `det(λ·Qa - Qb)` always has one positive
    /// real root; the ellipsoids are separated exactly when it also has two
    /// distinct negative real roots. Roots are classified with `tolerance`.
    #[must_use]
    pub fn collides_ellipsoid(&self, other: &Ellipsoid, tolerance: &QuadricTolerance) -> bool {
        if !self.aabb.intersects(&other.aabb) {
            return false;
        }
        if self.contains_point(&other.center) || other.contains_point(&self.center) {
            return true;
        }

        let (a, b) = match self.canonical_cmp(other) {
            Ordering::Greater => (other, self),
            _ => (self, other),
        };
        let pencil = a.homogeneous_matrix_inverse() * b.homogeneous_matrix();
        let roots = pencil.complex_eigenvalues();

        let mut negative = [0.0; 4];
        let mut count = 0;
        for root in roots.iter() {
            if root.im.abs() < tolerance.imaginary && root.re < 0.0 {
                negative[count] = root.re;
                count += 1;
            }
        }
        !(count == 2 && (negative[0] - negative[1]).abs() > tolerance.separation)
    }

    /// Ellipsoid–box overlap.
    ///
    /// Accepts immediately when either center lies inside the other shape;
    /// otherwise the boundaries must cross, so each of the six faces is
    /// tested for contact.
    #[must_use]
    pub fn collides_aabb(&self, aabb: &Aabb) -> bool {
        if !self.aabb.intersects(aabb) {
            return false;
        }
        if aabb.contains_point(&self.center) || self.contains_point(&aabb.center()) {
            return true;
        }

        let lower = aabb.lower();
        let upper = aabb.upper();
        let dx = aabb.extents();
        for i in 0..3 {
            let n0 = Vector3::ith(i, 1.0);
            let n1 = Vector3::ith((i + 1) % 3, 1.0);
            let n2 = Vector3::ith((i + 2) % 3, 1.0);
            let a = n0 * dx[i];
            let b = n1 * dx[(i + 1) % 3];
            if self.collides_face(lower, &a, &b, &n2) || self.collides_face(upper, &-a, &-b, &n2) {
                return true;
            }
        }
        false
    }

    /// Ellipsoid–oriented box overlap, evaluated in the box frame.
    #[must_use]
    pub fn collides_obb(&self, obb: &Obb) -> bool {
        let r = obb.axes();
        let local = Self::from_parts(
            obb.to_local(&self.center),
            r.transpose() * self.metric * r,
            r.transpose() * self.inverse_metric * r,
        );
        local.collides_aabb(&obb.local_box())
    }

    /// Ellipsoid–sphere overlap.
    #[must_use]
    pub fn collides_sphere(&self, sphere: &Sphere, tolerance: &QuadricTolerance) -> bool {
        self.collides_ellipsoid(&Ellipsoid::from(sphere), tolerance)
    }

    /// Minimum of the metric distance over the segment `a..b`.
    fn collides_segment(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        if self.contains_point(a) || self.contains_point(b) {
            return true;
        }
        let ba = b - a;
        let mba = self.metric * ba;
        let t = -(a - self.center).dot(&mba) / ba.dot(&mba);
        if !(0.0..=1.0).contains(&t) {
            return false;
        }
        self.contains_point(&(a + t * ba))
    }

    /// Contact with the parallelogram face `origin + s·a + t·b`, `s, t ∈ [0, 1]`,
    /// whose plane has normal `n`.
    fn collides_face(
        &self,
        origin: &Vector3<f64>,
        a: &Vector3<f64>,
        b: &Vector3<f64>,
        n: &Vector3<f64>,
    ) -> bool {
        let nan = n.dot(&(self.inverse_metric * n));
        let lagrange = (n.dot(origin) - n.dot(&self.center)) / nan;
        // plane misses the ellipsoid
        if lagrange * lagrange * nan > 1.0 {
            return false;
        }

        let x = self.center + lagrange * (self.inverse_metric * n);
        let s = a.dot(&(x - origin)) / a.dot(a);
        let t = b.dot(&(x - origin)) / b.dot(b);
        if (0.0..=1.0).contains(&s) && (0.0..=1.0).contains(&t) {
            return true;
        }

        let ab = origin + a + b;
        self.collides_segment(origin, &(origin + a))
            || self.collides_segment(origin, &(origin + b))
            || self.collides_segment(&(origin + a), &ab)
            || self.collides_segment(&(origin + b), &ab)
    }
}

impl From<&Sphere> for Ellipsoid {
    fn from(sphere: &Sphere) -> Self {
        let r2 = sphere.radius() * sphere.radius();
        Self::from_parts(
            *sphere.center(),
            Matrix3::identity() / r2,
            Matrix3::identity() * r2,
        )
    }
}
