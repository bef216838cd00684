//! Solid shapes and exact overlap tests.
//!
//! The set of shapes is closed, so they are modelled as one enum with an
//! exhaustive pair table in [`collide`] instead of a trait object per kind.

mod aabb;
mod collision;
mod ellipsoid;
mod obb;
mod sphere;

pub use aabb::Aabb;
pub use collision::{
    collide, QuadricTolerance, DEFAULT_IMAGINARY_TOLERANCE, DEFAULT_ROOT_SEPARATION,
};
pub use ellipsoid::{Ellipse2D, Ellipsoid};
pub use obb::Obb;
pub use sphere::Sphere;

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Discriminant of [`Shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Aabb,
    Obb,
    Sphere,
    Ellipsoid,
}

/// Any of the supported solids.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Shape {
    Aabb(Aabb),
    Obb(Obb),
    Sphere(Sphere),
    Ellipsoid(Ellipsoid),
}

impl Shape {
    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Aabb(_) => ShapeKind::Aabb,
            Shape::Obb(_) => ShapeKind::Obb,
            Shape::Sphere(_) => ShapeKind::Sphere,
            Shape::Ellipsoid(_) => ShapeKind::Ellipsoid,
        }
    }

    /// Axis-aligned bounds of the shape.
    #[must_use]
    pub fn aabb(&self) -> &Aabb {
        match self {
            Shape::Aabb(s) => s,
            Shape::Obb(s) => s.aabb(),
            Shape::Sphere(s) => s.aabb(),
            Shape::Ellipsoid(s) => s.aabb(),
        }
    }

    #[must_use]
    pub fn center(&self) -> Vector3<f64> {
        match self {
            Shape::Aabb(s) => s.center(),
            Shape::Obb(s) => *s.center(),
            Shape::Sphere(s) => *s.center(),
            Shape::Ellipsoid(s) => *s.center(),
        }
    }

    #[must_use]
    pub fn contains_point(&self, point: &Vector3<f64>) -> bool {
        match self {
            Shape::Aabb(s) => s.contains_point(point),
            Shape::Obb(s) => s.contains_point(point),
            Shape::Sphere(s) => s.contains_point(point),
            Shape::Ellipsoid(s) => s.contains_point(point),
        }
    }

    pub fn translate(&mut self, offset: &Vector3<f64>) {
        match self {
            Shape::Aabb(s) => s.translate(offset),
            Shape::Obb(s) => s.translate(offset),
            Shape::Sphere(s) => s.translate(offset),
            Shape::Ellipsoid(s) => s.translate(offset),
        }
    }

    /// Scales the shape about its center.
    pub fn scale(&mut self, factor: f64) {
        match self {
            Shape::Aabb(s) => s.scale(factor),
            Shape::Obb(s) => s.scale(factor),
            Shape::Sphere(s) => s.scale(factor),
            Shape::Ellipsoid(s) => s.scale(factor),
        }
    }

    #[must_use]
    pub fn scaled(&self, factor: f64) -> Shape {
        let mut copy = self.clone();
        copy.scale(factor);
        copy
    }

    /// Overlap test with the default quadric tolerances.
    #[must_use]
    pub fn collides(&self, other: &Shape) -> bool {
        collide(self, other, &QuadricTolerance::default())
    }
}

impl From<Aabb> for Shape {
    fn from(shape: Aabb) -> Self {
        Shape::Aabb(shape)
    }
}

impl From<Obb> for Shape {
    fn from(shape: Obb) -> Self {
        Shape::Obb(shape)
    }
}

impl From<Sphere> for Shape {
    fn from(shape: Sphere) -> Self {
        Shape::Sphere(shape)
    }
}

impl From<Ellipsoid> for Shape {
    fn from(shape: Ellipsoid) -> Self {
        Shape::Ellipsoid(shape)
    }
}
