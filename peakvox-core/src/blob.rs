//! Moment accumulation for connected regions.
//!
//! A [`Blob`] never stores its voxels. It keeps the weighted zeroth, first
//! and second moments of the intensity, which is enough to fit a
//! confidence ellipsoid and makes both point insertion and merging O(1).
//! Every field is a plain sum, so merging is associative and commutative.

use crate::error::{Error, Result};
use crate::math::confidence_to_sigmas;
use crate::shape::{Ellipse2D, Ellipsoid};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Mass below which a blob is too small to fit a shape.
pub const MIN_MASS: f64 = 1e-13;

const NOISE_FACTOR: f64 = 64.0;

/// Weighted moments of a set of voxels.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Blob {
    mass: f64,
    first: [f64; 3],
    /// xx, xy, xz, yy, yz, zz
    second: [f64; 6],
    count: usize,
    min_value: f64,
    max_value: f64,
}

impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}

impl Blob {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mass: 0.0,
            first: [0.0; 3],
            second: [0.0; 6],
            count: 0,
            min_value: f64::INFINITY,
            max_value: f64::NEG_INFINITY,
        }
    }

    /// Creates an accumulator holding a single voxel.
    #[must_use]
    pub fn from_point(x: f64, y: f64, z: f64, mass: f64) -> Self {
        let mut blob = Self::new();
        blob.add_point(x, y, z, mass);
        blob
    }

    /// Adds one voxel with intensity `mass`.
    pub fn add_point(&mut self, x: f64, y: f64, z: f64, mass: f64) {
        self.mass += mass;
        self.first[0] += mass * x;
        self.first[1] += mass * y;
        self.first[2] += mass * z;
        self.second[0] += mass * x * x;
        self.second[1] += mass * x * y;
        self.second[2] += mass * x * z;
        self.second[3] += mass * y * y;
        self.second[4] += mass * y * z;
        self.second[5] += mass * z * z;
        self.count += 1;
        self.min_value = self.min_value.min(mass);
        self.max_value = self.max_value.max(mass);
    }

    /// Folds `other` into this blob.
    pub fn merge(&mut self, other: &Blob) {
        self.merge_moments(other, 1.0);
        self.count += other.count;
        self.min_value = self.min_value.min(other.min_value);
        self.max_value = self.max_value.max(other.max_value);
    }

    /// Adds `factor` times the moments of `other`.
    ///
    /// Point count and intensity extremes are left untouched, so this is
    /// meant for corrections (e.g. removing a background level) rather than
    /// for combining regions.
    pub fn merge_scaled(&mut self, other: &Blob, factor: f64) {
        self.merge_moments(other, factor);
    }

    fn merge_moments(&mut self, other: &Blob, factor: f64) {
        self.mass += factor * other.mass;
        for (a, b) in self.first.iter_mut().zip(other.first) {
            *a += factor * b;
        }
        for (a, b) in self.second.iter_mut().zip(other.second) {
            *a += factor * b;
        }
    }

    /// Total intensity.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Number of voxels added.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.count
    }

    /// Smallest voxel intensity added (`+inf` when empty).
    #[must_use]
    pub fn min_value(&self) -> f64 {
        self.min_value
    }

    /// Largest voxel intensity added (`-inf` when empty).
    #[must_use]
    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    /// Raw first moments `Σm·x, Σm·y, Σm·z`.
    #[must_use]
    pub fn first_moments(&self) -> [f64; 3] {
        self.first
    }

    /// Raw second moments `Σm·xx, Σm·xy, Σm·xz, Σm·yy, Σm·yz, Σm·zz`.
    #[must_use]
    pub fn second_moments(&self) -> [f64; 6] {
        self.second
    }

    fn ensure_mass(&self) -> Result<()> {
        if self.mass.is_nan() || self.mass < MIN_MASS {
            return Err(Error::DegenerateBlob { mass: self.mass });
        }
        Ok(())
    }

    /// Intensity-weighted centroid.
    ///
    /// # Errors
    /// Returns [`Error::DegenerateBlob`] if the mass is below [`MIN_MASS`].
    pub fn center(&self) -> Result<Vector3<f64>> {
        self.ensure_mass()?;
        Ok(Vector3::from(self.first) / self.mass)
    }

    /// Intensity-weighted covariance about the centroid.
    ///
    /// # Errors
    /// Returns [`Error::DegenerateBlob`] if the mass is below [`MIN_MASS`].
    pub fn covariance(&self) -> Result<Matrix3<f64>> {
        let center = self.center()?;
        let [xx, xy, xz, yy, yz, zz] = self.second.map(|s| s / self.mass);
        let raw = Matrix3::new(xx, xy, xz, xy, yy, yz, xz, yz, zz);
        Ok(raw - center * center.transpose())
    }

    /// Fits the ellipsoid enclosing `confidence` of a Gaussian with the
    /// blob's mean and covariance.
    ///
    /// Each semi-axis is `sqrt(variance) * sqrt(2) * erfinv(confidence)`
    /// along the matching principal direction.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `confidence` is not in `(0, 1)`
    /// and [`Error::DegenerateBlob`] if the mass is below [`MIN_MASS`].
    pub fn to_ellipsoid(&self, confidence: f64) -> Result<Ellipsoid> {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "confidence must be in (0, 1), got {confidence}"
            )));
        }
        let center = self.center()?;
        let eigen = SymmetricEigen::new(self.covariance()?);
        let sigmas = confidence_to_sigmas(confidence);
        // variances at the cancellation level of the raw moments are zero
        let [xx, _, _, yy, _, zz] = self.second;
        let noise = NOISE_FACTOR * f64::EPSILON * (xx + yy + zz).abs() / self.mass;
        let radii = eigen
            .eigenvalues
            .map(|var| if var > noise { var.sqrt() * sigmas } else { 0.0 });
        Ok(Ellipsoid::from_axes(center, &radii, &eigen.eigenvectors))
    }

    /// Slice of the fitted ellipsoid by the plane through `point` with the
    /// given normal, for display.
    ///
    /// # Errors
    /// Same as [`Blob::to_ellipsoid`].
    pub fn cross_section(
        &self,
        confidence: f64,
        normal: &Vector3<f64>,
        point: &Vector3<f64>,
    ) -> Result<Option<Ellipse2D>> {
        Ok(self.to_ellipsoid(confidence)?.cross_section(normal, point))
    }
}

impl FromIterator<(f64, f64, f64, f64)> for Blob {
    fn from_iter<I: IntoIterator<Item = (f64, f64, f64, f64)>>(iter: I) -> Self {
        let mut blob = Blob::new();
        for (x, y, z, m) in iter {
            blob.add_point(x, y, z, m);
        }
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Deterministic pseudo-random stream in `[0, 1)`.
    fn lcg(seed: &mut u64) -> f64 {
        *seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (*seed >> 11) as f64 / (1u64 << 53) as f64
    }

    fn cloud(seed: u64, n: usize) -> Vec<(f64, f64, f64, f64)> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                (
                    10.0 * lcg(&mut s),
                    10.0 * lcg(&mut s),
                    10.0 * lcg(&mut s),
                    1.0 + 99.0 * lcg(&mut s),
                )
            })
            .collect()
    }

    fn assert_same(a: &Blob, b: &Blob) {
        assert_relative_eq!(a.mass(), b.mass(), max_relative = 1e-12);
        for (x, y) in a.first_moments().iter().zip(b.first_moments()) {
            assert_relative_eq!(*x, y, max_relative = 1e-12);
        }
        for (x, y) in a.second_moments().iter().zip(b.second_moments()) {
            assert_relative_eq!(*x, y, max_relative = 1e-12);
        }
        assert_eq!(a.component_count(), b.component_count());
        assert_eq!(a.min_value(), b.min_value());
        assert_eq!(a.max_value(), b.max_value());
    }

    #[test]
    fn test_merge_matches_union() {
        let a = cloud(1, 200);
        let b = cloud(2, 150);
        let c = cloud(3, 50);

        let union: Blob = a.iter().chain(&b).chain(&c).copied().collect();

        let mut ab = a.iter().copied().collect::<Blob>();
        ab.merge(&b.iter().copied().collect());
        ab.merge(&c.iter().copied().collect());

        // other order and grouping
        let mut cb: Blob = c.iter().copied().collect();
        cb.merge(&b.iter().copied().collect());
        let mut cba: Blob = a.iter().rev().copied().collect();
        cba.merge(&cb);

        assert_same(&ab, &union);
        assert_same(&cba, &union);
    }

    #[test]
    fn test_empty_blob_is_degenerate() {
        let blob = Blob::new();
        assert!(matches!(
            blob.to_ellipsoid(0.9),
            Err(Error::DegenerateBlob { .. })
        ));
        assert_eq!(blob.component_count(), 0);
        assert!(blob.min_value().is_infinite());
    }

    #[test]
    fn test_invalid_confidence() {
        let blob = Blob::from_point(1.0, 2.0, 3.0, 5.0);
        assert!(matches!(
            blob.to_ellipsoid(1.0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_isotropic_gaussian_cloud() {
        // voxel grid weighted by an isotropic Gaussian
        let sigma = 2.0_f64;
        let mut blob = Blob::new();
        for z in -12..=12 {
            for y in -12..=12 {
                for x in -12..=12 {
                    let r2 = f64::from(x * x + y * y + z * z);
                    let m = (-r2 / (2.0 * sigma * sigma)).exp();
                    blob.add_point(f64::from(x) + 5.0, f64::from(y), f64::from(z), m);
                }
            }
        }

        let center = blob.center().unwrap();
        assert_relative_eq!(center, Vector3::new(5.0, 0.0, 0.0), epsilon = 1e-9);

        let mut previous = 0.0;
        for confidence in [0.5, 0.68, 0.9, 0.997] {
            let radii = blob.to_ellipsoid(confidence).unwrap().radii();
            assert_relative_eq!(radii[0], radii[2], max_relative = 1e-6);
            assert!(radii[0] > previous, "radii must grow with confidence");
            previous = radii[0];
        }

        // one sigma of a 1D Gaussian
        let one_sigma = blob.to_ellipsoid(0.682_689_492).unwrap().radii();
        assert_relative_eq!(one_sigma[1], sigma, max_relative = 1e-3);
    }

    #[test]
    fn test_merge_scaled_subtracts_level() {
        let mut signal = Blob::new();
        let mut geometry = Blob::new();
        for x in 0..5 {
            signal.add_point(f64::from(x), 0.0, 0.0, 12.0);
            geometry.add_point(f64::from(x), 0.0, 0.0, 1.0);
        }
        signal.merge_scaled(&geometry, -10.0);
        assert_relative_eq!(signal.mass(), 10.0);
        assert_relative_eq!(signal.center().unwrap().x, 2.0);
        assert_eq!(signal.component_count(), 5);
    }

    #[test]
    fn test_planar_blob_has_zero_radius() {
        let mut blob = Blob::new();
        for x in 0..4 {
            for y in 0..3 {
                blob.add_point(f64::from(x) + 120.0, f64::from(y) + 40.0, 517.0, 3.0);
            }
        }
        let shape = blob.to_ellipsoid(0.9).unwrap();
        assert_eq!(shape.min_radius(), 0.0);
        assert!(shape.radii()[2] > 1.0);
    }

    #[test]
    fn test_cross_section_through_center() {
        let blob: Blob = [
            (-1.0, 0.0, 0.0, 1.0),
            (1.0, 0.0, 0.0, 1.0),
            (0.0, -1.0, 0.0, 1.0),
            (0.0, 1.0, 0.0, 1.0),
            (0.0, 0.0, -1.0, 1.0),
            (0.0, 0.0, 1.0, 1.0),
        ]
        .into_iter()
        .collect();
        let slice = blob
            .cross_section(0.9, &Vector3::z(), &Vector3::zeros())
            .unwrap()
            .unwrap();
        assert_relative_eq!(slice.semi_axes[0], slice.semi_axes[1], max_relative = 1e-9);
    }
}
