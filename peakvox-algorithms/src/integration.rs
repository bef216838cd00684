//! Peak integration over fitted ellipsoids.
//!
//! Every feature gets an [`IntegrationRegion`] made of three nested
//! ellipsoids derived from its fitted shape: the peak region, the inner
//! edge of the background shell and its outer edge. The gap between the
//! first two is a guard shell that counts as neither signal nor
//! background. A [`PeakIntegrator`] accumulates one region frame by frame
//! and produces an [`Integration`].

use nalgebra::Vector3;
use ndarray::Array2;
use peakvox_core::{erf, Aabb, Blob, Ellipsoid, Error, Result};
use std::f64::consts::SQRT_2;
use std::ops::RangeInclusive;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Integration parameters.
///
/// Scales are in units of the fitted ellipsoid: a voxel at `p` has
/// `r = sqrt((p - c)ᵀ M (p - c))` and lies in the peak region for
/// `r ≤ peak_scale` and in the background for `bkg_begin ≤ r ≤ bkg_end`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegrationConfig {
    /// Scale of the peak region.
    pub peak_scale: f64,
    /// Inner scale of the background shell.
    pub bkg_begin: f64,
    /// Outer scale of the background shell.
    pub bkg_end: f64,
    /// Re-derive each shape from the background-corrected data.
    pub update_shape: bool,
    /// Confidence of re-derived shapes, in `(0, 1)`.
    pub shape_confidence: f64,
    /// Re-derived shapes smaller than this (voxel³) are rejected.
    pub min_volume: f64,
    /// Largest accepted shift of the center, in units of the old shape.
    pub identity_tolerance: f64,
    /// Number of frame partitions; `0` uses the rayon pool size.
    pub workers: usize,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            peak_scale: 1.0,
            bkg_begin: 1.0,
            bkg_end: 2.0,
            update_shape: true,
            shape_confidence: 0.997,
            min_volume: 1.0,
            identity_tolerance: 1.0,
            workers: 0,
        }
    }
}

impl IntegrationConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the peak, background-begin and background-end scales.
    #[must_use]
    pub fn with_scales(mut self, peak: f64, bkg_begin: f64, bkg_end: f64) -> Self {
        self.peak_scale = peak;
        self.bkg_begin = bkg_begin;
        self.bkg_end = bkg_end;
        self
    }

    /// Enables or disables shape re-derivation.
    #[must_use]
    pub fn with_update_shape(mut self, update: bool) -> Self {
        self.update_shape = update;
        self
    }

    /// Sets the confidence of re-derived shapes.
    #[must_use]
    pub fn with_shape_confidence(mut self, confidence: f64) -> Self {
        self.shape_confidence = confidence;
        self
    }

    /// Sets the smallest accepted re-derived volume.
    #[must_use]
    pub fn with_min_volume(mut self, volume: f64) -> Self {
        self.min_volume = volume;
        self
    }

    /// Sets the accepted center shift.
    #[must_use]
    pub fn with_identity_tolerance(mut self, tolerance: f64) -> Self {
        self.identity_tolerance = tolerance;
        self
    }

    /// Sets the number of frame partitions.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Checks every parameter.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] unless
    /// `0 < peak_scale ≤ bkg_begin < bkg_end` and the remaining
    /// parameters are in range.
    pub fn validate(&self) -> Result<()> {
        let scales_ok = self.peak_scale > 0.0
            && self.peak_scale <= self.bkg_begin
            && self.bkg_begin < self.bkg_end
            && self.bkg_end.is_finite();
        if !scales_ok {
            return Err(Error::InvalidConfig(format!(
                "integration scales must satisfy 0 < peak ({}) <= bkg_begin ({}) < bkg_end ({})",
                self.peak_scale, self.bkg_begin, self.bkg_end
            )));
        }
        if !(self.shape_confidence > 0.0 && self.shape_confidence < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "shape confidence must be in (0, 1), got {}",
                self.shape_confidence
            )));
        }
        if self.min_volume.is_nan() || self.min_volume < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "min_volume must be non-negative, got {}",
                self.min_volume
            )));
        }
        if !(self.identity_tolerance > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "identity_tolerance must be positive, got {}",
                self.identity_tolerance
            )));
        }
        Ok(())
    }
}

/// Class of a voxel relative to one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VoxelClass {
    /// Inside the peak region.
    Region,
    /// Inside the background shell.
    Background,
    /// Guard shell or outside the background ellipsoid.
    Excluded,
}

/// Voxel bounds of a region, inclusive on every axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelBounds {
    /// Column range (x).
    pub cols: RangeInclusive<usize>,
    /// Row range (y).
    pub rows: RangeInclusive<usize>,
    /// Frame range (z).
    pub frames: RangeInclusive<usize>,
}

impl VoxelBounds {
    fn n_frames(&self) -> usize {
        if self.frames.is_empty() {
            0
        } else {
            self.frames.end() - self.frames.start() + 1
        }
    }
}

/// Peak region and background shell around one fitted ellipsoid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegrationRegion {
    shape: Ellipsoid,
    region: Ellipsoid,
    background: Ellipsoid,
    peak_scale: f64,
    bkg_begin: f64,
    bkg_end: f64,
}

impl IntegrationRegion {
    /// Builds the region around `shape`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the scales are not ordered
    /// `0 < peak ≤ bkg_begin < bkg_end`.
    pub fn new(shape: Ellipsoid, peak_scale: f64, bkg_begin: f64, bkg_end: f64) -> Result<Self> {
        IntegrationConfig::new()
            .with_scales(peak_scale, bkg_begin, bkg_end)
            .validate()?;
        Ok(Self {
            region: shape.scaled(peak_scale),
            background: shape.scaled(bkg_end),
            shape,
            peak_scale,
            bkg_begin,
            bkg_end,
        })
    }

    /// Builds the region with the scales of `config`.
    ///
    /// # Errors
    /// Same as [`IntegrationRegion::new`].
    pub fn from_config(shape: Ellipsoid, config: &IntegrationConfig) -> Result<Self> {
        Self::new(shape, config.peak_scale, config.bkg_begin, config.bkg_end)
    }

    /// The unscaled fitted shape.
    #[must_use]
    pub fn shape(&self) -> &Ellipsoid {
        &self.shape
    }

    /// Peak region.
    #[must_use]
    pub fn region(&self) -> &Ellipsoid {
        &self.region
    }

    /// Outer edge of the background shell.
    #[must_use]
    pub fn background(&self) -> &Ellipsoid {
        &self.background
    }

    /// Classifies a voxel position.
    #[must_use]
    pub fn classify(&self, point: &Vector3<f64>) -> VoxelClass {
        let r2 = self.shape.r2(point);
        if r2 <= self.peak_scale * self.peak_scale {
            VoxelClass::Region
        } else if r2 > self.bkg_end * self.bkg_end {
            VoxelClass::Excluded
        } else if r2 >= self.bkg_begin * self.bkg_begin {
            VoxelClass::Background
        } else {
            VoxelClass::Excluded
        }
    }

    /// Whether the voxel is in the peak region or the guard shell.
    fn is_reserved(&self, point: &Vector3<f64>) -> bool {
        let r2 = self.shape.r2(point);
        r2 < self.bkg_begin * self.bkg_begin || r2 <= self.peak_scale * self.peak_scale
    }

    /// Voxels covered by the background ellipsoid, clipped to the data.
    ///
    /// Returns `None` if the region misses the data entirely.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn bounds(&self, n_frames: usize, n_rows: usize, n_cols: usize) -> Option<VoxelBounds> {
        if n_frames == 0 || n_rows == 0 || n_cols == 0 {
            return None;
        }
        let aabb = self.background.aabb();
        let (lower, upper) = (aabb.lower(), aabb.upper());

        let clip = |lo: f64, hi: f64, n: usize| -> Option<RangeInclusive<usize>> {
            let max = (n - 1) as f64;
            if hi < 0.0 || lo > max || lo > hi {
                return None;
            }
            Some(lo.max(0.0) as usize..=hi.min(max) as usize)
        };

        let cols = clip(lower.x.floor(), upper.x.ceil(), n_cols)?;
        let rows = clip(lower.y.floor(), upper.y.ceil(), n_rows)?;
        let frames = clip(lower.z.ceil(), upper.z.floor(), n_frames)?;
        Some(VoxelBounds { cols, rows, frames })
    }

    /// Flags every pixel of frame `index` that lies in this peak region or
    /// its guard shell, so that neighbouring regions do not count it as
    /// background.
    #[allow(clippy::cast_precision_loss)]
    pub fn update_mask(&self, mask: &mut Array2<bool>, index: usize, n_frames: usize) {
        let (n_rows, n_cols) = mask.dim();
        let Some(bounds) = self.bounds(n_frames, n_rows, n_cols) else {
            return;
        };
        if !bounds.frames.contains(&index) {
            return;
        }
        let z = index as f64;
        for row in bounds.rows.clone() {
            for col in bounds.cols.clone() {
                if self.is_reserved(&Vector3::new(col as f64, row as f64, z)) {
                    mask[[row, col]] = true;
                }
            }
        }
    }
}

/// Outcome of integrating one peak.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Integration {
    /// Background-corrected integrated intensity.
    pub intensity: f64,
    /// Standard deviation of `intensity`.
    pub sigma: f64,
    /// Mean background per voxel.
    pub background_mean: f64,
    /// Standard deviation of the background voxels.
    pub background_std: f64,
    /// First frame of the per-frame vectors.
    pub first_frame: usize,
    /// Background-corrected region intensity per frame.
    pub rocking_curve: Vec<f64>,
    /// Standard deviation of each rocking curve entry.
    pub rocking_sigma: Vec<f64>,
    /// Total intensity in the bounding box per frame.
    pub projection: Vec<f64>,
    /// Counted background intensity per frame.
    pub background_projection: Vec<f64>,
    /// Voxels counted as signal.
    pub region_points: usize,
    /// Voxels counted as background.
    pub background_points: usize,
    /// Probability that the region mean is a background fluctuation.
    pub p_value: f64,
    /// Shape after the optional re-derivation.
    pub shape: Ellipsoid,
    /// Cleared when the re-derived shape was rejected.
    pub selected: bool,
}

impl Integration {
    /// Signal to noise ratio `I / σ`.
    #[must_use]
    pub fn strength(&self) -> f64 {
        if self.sigma > 0.0 {
            self.intensity / self.sigma
        } else {
            0.0
        }
    }
}

/// Frame-by-frame accumulator for one region.
#[derive(Debug, Clone)]
pub struct PeakIntegrator {
    region: IntegrationRegion,
    bounds: Option<VoxelBounds>,
    n_frames: usize,
    n_rows: usize,
    n_cols: usize,
    projection: Vec<f64>,
    region_intensity: Vec<f64>,
    region_count: Vec<usize>,
    background_intensity: Vec<f64>,
    background_count: Vec<usize>,
    background_sq: f64,
    signal: Blob,
    geometry: Blob,
}

impl PeakIntegrator {
    /// Creates an integrator for data of the given dimensions.
    #[must_use]
    pub fn new(region: IntegrationRegion, n_frames: usize, n_rows: usize, n_cols: usize) -> Self {
        let bounds = region.bounds(n_frames, n_rows, n_cols);
        let len = bounds.as_ref().map_or(0, VoxelBounds::n_frames);
        Self {
            region,
            bounds,
            n_frames,
            n_rows,
            n_cols,
            projection: vec![0.0; len],
            region_intensity: vec![0.0; len],
            region_count: vec![0; len],
            background_intensity: vec![0.0; len],
            background_count: vec![0; len],
            background_sq: 0.0,
            signal: Blob::new(),
            geometry: Blob::new(),
        }
    }

    /// Region being integrated.
    #[must_use]
    pub fn region(&self) -> &IntegrationRegion {
        &self.region
    }

    /// Frames this integrator reads, if any.
    #[must_use]
    pub fn frames(&self) -> Option<RangeInclusive<usize>> {
        self.bounds.as_ref().map(|b| b.frames.clone())
    }

    /// Whether frame `index` falls inside the clipped bounds.
    #[must_use]
    pub fn contains_frame(&self, index: usize) -> bool {
        self.bounds.as_ref().is_some_and(|b| b.frames.contains(&index))
    }

    /// Flags this region's reserved pixels of frame `index` in `mask`.
    pub fn update_mask(&self, mask: &mut Array2<bool>, index: usize) {
        self.region.update_mask(mask, index, self.n_frames);
    }

    /// Accumulates frame `index`.
    ///
    /// Background voxels flagged in `mask` are skipped. Frames outside the
    /// region are ignored.
    #[allow(clippy::cast_precision_loss)]
    pub fn step(&mut self, frame: &Array2<f64>, index: usize, mask: &Array2<bool>) {
        let Some(bounds) = &self.bounds else {
            return;
        };
        if !bounds.frames.contains(&index) {
            return;
        }
        let offset = index - bounds.frames.start();
        let z = index as f64;

        for row in bounds.rows.clone() {
            for col in bounds.cols.clone() {
                let value = frame[[row, col]];
                self.projection[offset] += value;
                let point = Vector3::new(col as f64, row as f64, z);
                match self.region.classify(&point) {
                    VoxelClass::Region => {
                        self.region_intensity[offset] += value;
                        self.region_count[offset] += 1;
                        self.signal.add_point(point.x, point.y, z, value);
                        self.geometry.add_point(point.x, point.y, z, 1.0);
                    }
                    VoxelClass::Background if !mask[[row, col]] => {
                        self.background_intensity[offset] += value;
                        self.background_count[offset] += 1;
                        self.background_sq += value * value;
                    }
                    VoxelClass::Background | VoxelClass::Excluded => {}
                }
            }
        }
    }

    /// Finalizes the integration.
    ///
    /// # Errors
    /// Returns [`Error::NoBackground`] if no background voxel was counted.
    /// Rejected shape updates are not errors; they clear
    /// [`Integration::selected`].
    #[allow(clippy::cast_precision_loss)]
    pub fn end(&self, config: &IntegrationConfig) -> Result<Integration> {
        let background_points: usize = self.background_count.iter().sum();
        if background_points == 0 {
            return Err(Error::NoBackground);
        }
        let n_bkg = background_points as f64;
        let background_sum: f64 = self.background_intensity.iter().sum();
        let mean = background_sum / n_bkg;
        let variance = if background_points > 1 {
            ((self.background_sq - n_bkg * mean * mean) / (n_bkg - 1.0)).max(0.0)
        } else {
            0.0
        };
        let background_std = variance.sqrt();

        let rocking_curve: Vec<f64> = self
            .region_intensity
            .iter()
            .zip(&self.region_count)
            .map(|(&sum, &count)| sum - mean * count as f64)
            .collect();
        let rocking_sigma: Vec<f64> = rocking_curve
            .iter()
            .zip(&self.region_count)
            .map(|(&value, &count)| (value.max(0.0) + variance * count as f64).sqrt())
            .collect();
        let intensity = rocking_curve.iter().sum();
        let sigma = rocking_sigma.iter().map(|s| s * s).sum::<f64>().sqrt();

        let region_points: usize = self.region_count.iter().sum();
        let p_value = if region_points == 0 {
            1.0
        } else {
            let n = region_points as f64;
            let average = self.region_intensity.iter().sum::<f64>() / n;
            let spread = (mean.max(0.0) / n).sqrt();
            let z = (average - mean) / spread;
            if z.is_nan() {
                1.0
            } else {
                0.5 * (1.0 - erf(z / SQRT_2))
            }
        };

        let (shape, selected) = if config.update_shape {
            self.updated_shape(mean, config)
        } else {
            (self.region.shape().clone(), region_points > 0)
        };

        Ok(Integration {
            intensity,
            sigma,
            background_mean: mean,
            background_std,
            first_frame: self.bounds.as_ref().map_or(0, |b| *b.frames.start()),
            rocking_curve,
            rocking_sigma,
            projection: self.projection.clone(),
            background_projection: self.background_intensity.clone(),
            region_points,
            background_points,
            p_value,
            shape,
            selected,
        })
    }

    /// Shape re-derived from background-corrected region voxels, or the
    /// old shape with `selected = false` if the new one is unusable or
    /// would move the peak.
    #[allow(clippy::cast_precision_loss)]
    fn updated_shape(&self, background_mean: f64, config: &IntegrationConfig) -> (Ellipsoid, bool) {
        let old = self.region.shape();
        let mut corrected = self.signal.clone();
        corrected.merge_scaled(&self.geometry, -background_mean);

        let shape = match corrected.to_ellipsoid(config.shape_confidence) {
            Ok(shape) => shape,
            Err(err) => {
                log::debug!("Keeping fitted shape: {err}");
                return (old.clone(), false);
            }
        };
        let volume = shape.volume();
        if volume.is_nan() || volume < config.min_volume {
            log::debug!("Keeping fitted shape: re-derived volume {volume} is too small");
            return (old.clone(), false);
        }
        if let Some(data) = self.data_box() {
            if !data.contains(shape.aabb()) {
                log::debug!("Keeping fitted shape: re-derived shape leaves the data");
                return (old.clone(), false);
            }
        }
        let shift = old.r2(shape.center()).sqrt();
        if !(shift <= config.identity_tolerance) {
            log::debug!("Keeping fitted shape: center moved by {shift}");
            return (old.clone(), false);
        }
        (shape, true)
    }

    #[allow(clippy::cast_precision_loss)]
    fn data_box(&self) -> Option<Aabb> {
        Aabb::new(
            Vector3::zeros(),
            Vector3::new(
                self.n_cols as f64,
                self.n_rows as f64,
                self.n_frames as f64,
            ),
        )
        .ok()
    }
}
