//! Oriented bounding boxes.

use super::Aabb;
use crate::error::{Error, Result};
use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Padding added to the absolute rotation terms of the separating-axis
/// test so that near-parallel edges do not produce a zero cross axis.
const PARALLEL_EPSILON: f64 = 1e-12;

/// A box with arbitrary orientation.
///
/// `axes` holds the box's local x, y and z directions as columns.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Obb {
    center: Vector3<f64>,
    half_extents: Vector3<f64>,
    axes: Matrix3<f64>,
    aabb: Aabb,
}

impl Obb {
    /// Creates an oriented box.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if a half extent is not positive or
    /// the axes are not orthonormal.
    pub fn new(center: Vector3<f64>, half_extents: Vector3<f64>, axes: Matrix3<f64>) -> Result<Self> {
        if half_extents.iter().any(|h| h.is_nan() || *h <= 0.0) {
            return Err(Error::InvalidShape(format!(
                "box half extents must be positive, got {:?}",
                half_extents.as_slice()
            )));
        }
        if ((axes.transpose() * axes) - Matrix3::identity()).amax() > 1e-9 {
            return Err(Error::InvalidShape("box axes are not orthonormal".into()));
        }
        let mut obb = Self {
            center,
            half_extents,
            axes,
            aabb: Aabb::spanning(center, center),
        };
        obb.update_aabb();
        Ok(obb)
    }

    /// Oriented box covering exactly an axis-aligned one.
    #[must_use]
    pub fn from_aabb(aabb: &Aabb) -> Self {
        Self {
            center: aabb.center(),
            half_extents: 0.5 * aabb.extents(),
            axes: Matrix3::identity(),
            aabb: *aabb,
        }
    }

    #[must_use]
    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    #[must_use]
    pub fn half_extents(&self) -> &Vector3<f64> {
        &self.half_extents
    }

    #[must_use]
    pub fn axes(&self) -> &Matrix3<f64> {
        &self.axes
    }

    #[must_use]
    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    fn update_aabb(&mut self) {
        let half = self.axes.abs() * self.half_extents;
        self.aabb = Aabb::spanning(self.center - half, self.center + half);
    }

    /// Coordinates of `point` in the box frame (origin at the center).
    #[must_use]
    pub fn to_local(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.axes.transpose() * (point - self.center)
    }

    /// The box itself, expressed in its own frame.
    #[must_use]
    pub fn local_box(&self) -> Aabb {
        Aabb::spanning(-self.half_extents, self.half_extents)
    }

    #[must_use]
    pub fn contains_point(&self, point: &Vector3<f64>) -> bool {
        let local = self.to_local(point);
        (0..3).all(|i| local[i].abs() <= self.half_extents[i])
    }

    pub fn translate(&mut self, offset: &Vector3<f64>) {
        self.center += offset;
        self.update_aabb();
    }

    /// Scales the box about its center.
    pub fn scale(&mut self, factor: f64) {
        self.half_extents *= factor;
        self.update_aabb();
    }

    /// Rotates the box about its center.
    pub fn rotate(&mut self, rotation: &Matrix3<f64>) {
        self.axes = rotation * self.axes;
        self.update_aabb();
    }

    /// Separating-axis test against another oriented box.
    ///
    /// Checks the three face normals of each box and the nine edge cross
    /// products; the boxes are disjoint iff one of those axes separates them.
    #[must_use]
    pub fn collides_obb(&self, other: &Obb) -> bool {
        let a = &self.half_extents;
        let b = &other.half_extents;
        let rot = self.axes.transpose() * other.axes;
        let abs_rot = rot.abs().add_scalar(PARALLEL_EPSILON);
        let t = self.axes.transpose() * (other.center - self.center);

        for i in 0..3 {
            let ra = a[i];
            let rb = b[0] * abs_rot[(i, 0)] + b[1] * abs_rot[(i, 1)] + b[2] * abs_rot[(i, 2)];
            if t[i].abs() > ra + rb {
                return false;
            }
        }

        for j in 0..3 {
            let ra = a[0] * abs_rot[(0, j)] + a[1] * abs_rot[(1, j)] + a[2] * abs_rot[(2, j)];
            let rb = b[j];
            let proj = t[0] * rot[(0, j)] + t[1] * rot[(1, j)] + t[2] * rot[(2, j)];
            if proj.abs() > ra + rb {
                return false;
            }
        }

        for i in 0..3 {
            let (i1, i2) = ((i + 1) % 3, (i + 2) % 3);
            for j in 0..3 {
                let (j1, j2) = ((j + 1) % 3, (j + 2) % 3);
                let ra = a[i1] * abs_rot[(i2, j)] + a[i2] * abs_rot[(i1, j)];
                let rb = b[j1] * abs_rot[(i, j2)] + b[j2] * abs_rot[(i, j1)];
                let proj = t[i2] * rot[(i1, j)] - t[i1] * rot[(i2, j)];
                if proj.abs() > ra + rb {
                    return false;
                }
            }
        }
        true
    }
}
