//! Spheres.

use super::Aabb;
use crate::error::{Error, Result};
use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A solid sphere.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sphere {
    center: Vector3<f64>,
    radius: f64,
    aabb: Aabb,
}

impl Sphere {
    /// Creates a sphere.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if the radius is not strictly positive.
    pub fn new(center: Vector3<f64>, radius: f64) -> Result<Self> {
        if radius.is_nan() || radius <= 0.0 {
            return Err(Error::InvalidShape(format!(
                "sphere radius must be positive, got {radius}"
            )));
        }
        Ok(Self {
            center,
            radius,
            aabb: Self::bounds(&center, radius),
        })
    }

    fn bounds(center: &Vector3<f64>, radius: f64) -> Aabb {
        let half = Vector3::repeat(radius);
        Aabb::spanning(center - half, center + half)
    }

    #[must_use]
    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    #[must_use]
    pub fn radius(&self) -> f64 {
        self.radius
    }

    #[must_use]
    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    #[must_use]
    pub fn contains_point(&self, point: &Vector3<f64>) -> bool {
        (point - self.center).norm_squared() <= self.radius * self.radius
    }

    pub fn translate(&mut self, offset: &Vector3<f64>) {
        self.center += offset;
        self.aabb = Self::bounds(&self.center, self.radius);
    }

    /// Scales the radius, keeping the center fixed.
    pub fn scale(&mut self, factor: f64) {
        self.radius *= factor;
        self.aabb = Self::bounds(&self.center, self.radius);
    }

    /// Sphere–sphere overlap (touching counts).
    #[must_use]
    pub fn collides_sphere(&self, other: &Sphere) -> bool {
        let reach = self.radius + other.radius;
        (self.center - other.center).norm_squared() <= reach * reach
    }

    /// Sphere–box overlap via the closest box point to the center.
    #[must_use]
    pub fn collides_aabb(&self, aabb: &Aabb) -> bool {
        let closest = Vector3::from_fn(|i, _| {
            self.center[i].max(aabb.lower()[i]).min(aabb.upper()[i])
        });
        self.contains_point(&closest)
    }
}
