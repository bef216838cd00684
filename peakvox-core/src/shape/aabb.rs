//! Axis-aligned bounding boxes.

use crate::error::{Error, Result};
use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An axis-aligned box given by its lower and upper corners.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Aabb {
    lower: Vector3<f64>,
    upper: Vector3<f64>,
}

impl Aabb {
    /// Creates a box from its corners.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBounds`] unless `lower` is strictly below
    /// `upper` on every axis.
    pub fn new(lower: Vector3<f64>, upper: Vector3<f64>) -> Result<Self> {
        let valid = lower.iter().zip(upper.iter()).all(|(l, u)| l < u);
        if !valid {
            return Err(Error::InvalidBounds {
                lower: lower.into(),
                upper: upper.into(),
            });
        }
        Ok(Self { lower, upper })
    }

    /// Box spanned by the extremes of a shape. Flat boxes are allowed here.
    pub(crate) fn spanning(lower: Vector3<f64>, upper: Vector3<f64>) -> Self {
        Self { lower, upper }
    }

    /// Lower corner.
    #[must_use]
    pub fn lower(&self) -> &Vector3<f64> {
        &self.lower
    }

    /// Upper corner.
    #[must_use]
    pub fn upper(&self) -> &Vector3<f64> {
        &self.upper
    }

    /// Geometric center.
    #[must_use]
    pub fn center(&self) -> Vector3<f64> {
        0.5 * (self.lower + self.upper)
    }

    /// Edge lengths along each axis.
    #[must_use]
    pub fn extents(&self) -> Vector3<f64> {
        self.upper - self.lower
    }

    /// Returns true if the point lies inside or on the boundary.
    #[must_use]
    pub fn contains_point(&self, point: &Vector3<f64>) -> bool {
        (0..3).all(|i| self.lower[i] <= point[i] && point[i] <= self.upper[i])
    }

    /// Returns true if the two boxes share at least one point.
    #[must_use]
    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.lower[i] <= other.upper[i] && other.lower[i] <= self.upper[i])
    }

    /// Returns true if `other` lies entirely inside this box.
    #[must_use]
    pub fn contains(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.lower[i] <= other.lower[i] && other.upper[i] <= self.upper[i])
    }

    /// Moves the box by `offset`.
    pub fn translate(&mut self, offset: &Vector3<f64>) {
        self.lower += offset;
        self.upper += offset;
    }

    /// Scales the box about its center.
    pub fn scale(&mut self, factor: f64) {
        let center = self.center();
        let half = 0.5 * factor * self.extents();
        self.lower = center - half;
        self.upper = center + half;
    }

    /// One of the eight sub-boxes obtained by halving every axis.
    ///
    /// Bit `i` of `sector` selects the upper half along axis `i`.
    #[must_use]
    pub fn octant(&self, sector: usize) -> Aabb {
        let center = self.center();
        let mut lower = self.lower;
        let mut upper = self.upper;
        for axis in 0..3 {
            if sector & (1 << axis) == 0 {
                upper[axis] = center[axis];
            } else {
                lower[axis] = center[axis];
            }
        }
        Aabb { lower, upper }
    }

    /// The eight corners, indexed like [`Aabb::octant`].
    #[must_use]
    pub fn corners(&self) -> [Vector3<f64>; 8] {
        std::array::from_fn(|sector| {
            Vector3::from_fn(|axis, _| {
                if sector & (1 << axis) == 0 {
                    self.lower[axis]
                } else {
                    self.upper[axis]
                }
            })
        })
    }
}
