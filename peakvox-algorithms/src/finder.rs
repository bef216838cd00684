//! Blob finding: partitioned labeling, collision merging and pruning.

use crate::equivalence::{
    merge_blobs, register_equivalence, union_find_equivalences, BlobMap, EquivalenceList,
    EquivalenceResolver, Label, ResolveStrategy,
};
use crate::filter::FrameFilter;
use crate::labeling::{stitch_ranges, ConnectedComponentLabeler, LabeledRange};
use crate::spatial::{IndexConfig, Octree};
use nalgebra::Vector3;
use ndarray::Array2;
use peakvox_core::{
    Aabb, Blob, Ellipsoid, Error, FrameSource, ProgressCounter, ProgressHandler, QuadricTolerance,
    Result, Shape,
};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::AtomicU32;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Principal radius below which a fitted blob is treated as flat.
pub const MIN_RADIUS: f64 = 1e-13;
/// Smallest accepted feature extent.
pub const MIN_EXTENT: f64 = 1e-5;
/// Largest accepted feature extent.
pub const MAX_EXTENT: f64 = 1e5;

/// Intensity threshold for labeling.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Threshold {
    /// Fixed intensity.
    Absolute(f64),
    /// Multiple of the median intensity of the labelled frames.
    Relative(f64),
}

/// Blob finder configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinderConfig {
    /// Voxels below this (after filtering) are background.
    pub threshold: Threshold,
    /// Frames to label; `None` labels every frame. Clipped to the data.
    pub frames: Option<Range<usize>>,
    /// Smallest accepted blob, in voxels.
    pub min_components: usize,
    /// Largest accepted blob, in voxels.
    pub max_components: usize,
    /// Confidence level of the fitted ellipsoids, in `(0, 1)`.
    pub confidence: f64,
    /// Number of labeling partitions; `0` uses the rayon pool size.
    pub workers: usize,
    /// Octree parameters for collision discovery.
    pub index: IndexConfig,
    /// Cap on collision merge rounds.
    pub max_merge_iterations: usize,
    /// How equivalence chains are collapsed.
    pub strategy: ResolveStrategy,
    /// Ellipsoid root classification tolerances.
    pub tolerance: QuadricTolerance,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            threshold: Threshold::Absolute(80.0),
            frames: None,
            min_components: 30,
            max_components: 10_000,
            confidence: 0.997,
            workers: 0,
            index: IndexConfig::default(),
            max_merge_iterations: 100,
            strategy: ResolveStrategy::default(),
            tolerance: QuadricTolerance::default(),
        }
    }
}

impl FinderConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the labeling threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Restricts labeling to a frame range.
    #[must_use]
    pub fn with_frames(mut self, frames: Range<usize>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Sets the smallest accepted blob size.
    #[must_use]
    pub fn with_min_components(mut self, size: usize) -> Self {
        self.min_components = size;
        self
    }

    /// Sets the largest accepted blob size.
    #[must_use]
    pub fn with_max_components(mut self, size: usize) -> Self {
        self.max_components = size;
        self
    }

    /// Sets the ellipsoid confidence level.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Sets the number of labeling partitions.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the octree parameters.
    #[must_use]
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    /// Sets the merge round cap.
    #[must_use]
    pub fn with_max_merge_iterations(mut self, iterations: usize) -> Self {
        self.max_merge_iterations = iterations;
        self
    }

    /// Sets the equivalence strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ResolveStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the ellipsoid root tolerances.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: QuadricTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Checks every parameter.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] naming the first bad parameter.
    pub fn validate(&self) -> Result<()> {
        match self.threshold {
            Threshold::Absolute(t) if !t.is_finite() => {
                return Err(Error::InvalidConfig(format!(
                    "absolute threshold must be finite, got {t}"
                )));
            }
            Threshold::Relative(f) if !(f.is_finite() && f > 0.0) => {
                return Err(Error::InvalidConfig(format!(
                    "relative threshold must be positive, got {f}"
                )));
            }
            _ => {}
        }
        if self.min_components > self.max_components {
            return Err(Error::InvalidConfig(format!(
                "min_components {} exceeds max_components {}",
                self.min_components, self.max_components
            )));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "confidence must be in (0, 1), got {}",
                self.confidence
            )));
        }
        if self.max_merge_iterations == 0 {
            return Err(Error::InvalidConfig(
                "max_merge_iterations must be at least 1".into(),
            ));
        }
        self.index.validate()
    }

    fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            rayon::current_num_threads().max(1)
        } else {
            self.workers
        }
    }
}

/// A surviving blob with its fitted ellipsoid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Feature {
    /// Label of the merged blob.
    pub label: Label,
    /// Accumulated moments of the merged blob.
    pub blob: Blob,
    /// Confidence ellipsoid of `blob`.
    pub shape: Ellipsoid,
    /// Cleared for implausibly sized shapes and shapes that leave the
    /// detector area.
    pub selected: bool,
}

/// Counts from one run, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinderStatistics {
    /// Blobs after labeling and seam stitching.
    pub primary_blobs: usize,
    /// Blobs after the collision merge loop.
    pub merged_blobs: usize,
    /// Blobs within the component bounds.
    pub accepted_blobs: usize,
    /// Merge rounds performed.
    pub merge_iterations: usize,
    /// Collisions found over all rounds.
    pub collisions: usize,
}

/// Result of [`BlobFinder::find`].
#[derive(Debug, Clone)]
pub struct FinderOutput {
    /// Fitted blobs in ascending label order.
    pub features: Vec<Feature>,
    /// Absolute threshold that was applied.
    pub threshold: f64,
    /// Blob counts per stage.
    pub statistics: FinderStatistics,
}

/// Splits `frames` into at most `workers` contiguous, non-empty ranges
/// whose lengths differ by at most one.
#[must_use]
pub fn partition_frames(frames: Range<usize>, workers: usize) -> Vec<Range<usize>> {
    let len = frames.len();
    let parts = workers.max(1).min(len);
    if parts == 0 {
        return Vec::new();
    }
    let base = len / parts;
    let extra = len % parts;
    let mut start = frames.start;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Finds blobs in a frame source.
pub struct BlobFinder {
    config: FinderConfig,
    filter: Option<Box<dyn FrameFilter>>,
}

impl BlobFinder {
    /// Creates a finder.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(config: FinderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            filter: None,
        })
    }

    /// Thresholds filtered frames.
    #[must_use]
    pub fn with_filter<F: FrameFilter + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    fn resolver(&self) -> EquivalenceResolver {
        EquivalenceResolver::new(self.config.strategy)
    }

    /// The configured frame range clipped to the source.
    pub fn frame_range<S: FrameSource + ?Sized>(&self, source: &S) -> Range<usize> {
        let n = source.n_frames();
        match &self.config.frames {
            Some(frames) => frames.start.min(n)..frames.end.min(n).max(frames.start.min(n)),
            None => 0..n,
        }
    }

    /// The absolute threshold for `frames`.
    ///
    /// Relative thresholds scale the median of the per-frame medians of
    /// the filtered frames.
    ///
    /// # Errors
    /// Propagates frame read errors.
    pub fn absolute_threshold<S>(&self, source: &S, frames: Range<usize>) -> Result<f64>
    where
        S: FrameSource + Sync + ?Sized,
    {
        let factor = match self.config.threshold {
            Threshold::Absolute(t) => return Ok(t),
            Threshold::Relative(factor) => factor,
        };
        let mut medians = frames
            .into_par_iter()
            .map(|index| {
                let raw = source.frame(index)?;
                let frame = self.filtered(&raw);
                let mut values: Vec<f64> = frame.iter().copied().collect();
                Ok(median(&mut values))
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(factor * median(&mut medians))
    }

    fn filtered(&self, raw: &Array2<f64>) -> Array2<f64> {
        match &self.filter {
            Some(filter) => filter.apply(raw),
            None => raw.clone(),
        }
    }

    /// Runs labeling, merging, pruning and feature fitting.
    ///
    /// # Errors
    /// Propagates frame read errors and [`Error::Aborted`].
    pub fn find<S>(&self, source: &S, progress: &dyn ProgressHandler) -> Result<FinderOutput>
    where
        S: FrameSource + Sync + ?Sized,
    {
        let frames = self.frame_range(source);
        let threshold = self.absolute_threshold(source, frames.clone())?;
        let mut statistics = FinderStatistics::default();

        progress.set_status("Finding blobs...");
        let mut blobs = self.find_primary_blobs(source, frames, threshold, progress)?;
        statistics.primary_blobs = blobs.len();
        progress.log(&format!("{} primary blobs", blobs.len()));

        progress.set_status("Merging colliding blobs...");
        let (iterations, collisions) = if blobs.is_empty() {
            (0, 0)
        } else {
            let world = world_box(source)?;
            self.merge_collisions(&mut blobs, &world, progress)?
        };
        statistics.merge_iterations = iterations;
        statistics.collisions = collisions;
        statistics.merged_blobs = blobs.len();
        progress.log(&format!(
            "{} blobs after {iterations} merge rounds ({collisions} collisions)",
            blobs.len()
        ));

        self.prune(&mut blobs);
        statistics.accepted_blobs = blobs.len();
        progress.log(&format!("{} blobs within component bounds", blobs.len()));

        let features = self.features(&blobs, source);
        let selected = features.iter().filter(|f| f.selected).count();
        log::info!(
            "Found {} features ({selected} selected) at threshold {threshold}",
            features.len()
        );
        progress.set_progress(100);

        Ok(FinderOutput {
            features,
            threshold,
            statistics,
        })
    }

    /// Labels the frame range in parallel partitions and joins them.
    ///
    /// Each partition resolves its own equivalences with the configured
    /// strategy; partitions are then stitched where labelled pixels meet
    /// across a partition seam. Seam pairs are always closed transitively,
    /// since one blob may touch several blobs of the neighbouring
    /// partition.
    ///
    /// # Errors
    /// Propagates frame read errors and [`Error::Aborted`].
    pub fn find_primary_blobs<S>(
        &self,
        source: &S,
        frames: Range<usize>,
        threshold: f64,
        progress: &dyn ProgressHandler,
    ) -> Result<BlobMap>
    where
        S: FrameSource + Sync + ?Sized,
    {
        let counter = AtomicU32::new(0);
        let mut labeler = ConnectedComponentLabeler::new(threshold, &counter);
        if let Some(filter) = &self.filter {
            labeler = labeler.with_filter(filter.as_ref());
        }
        let ticks = ProgressCounter::new(progress, frames.len());
        let partitions = partition_frames(frames, self.config.effective_workers());
        let resolver = self.resolver();

        let labeled = partitions
            .into_par_iter()
            .map(|range| {
                let mut part = labeler.label_range(source, range, Some(&ticks))?;
                let map = resolver.canonical_map(&mut part.equivalences);
                merge_blobs(&mut part.blobs, &map);
                part.equivalences.clear();
                relabel(&mut part.first_labels, &map);
                relabel(&mut part.last_labels, &map);
                Ok(part)
            })
            .collect::<Result<Vec<LabeledRange>>>()?;

        let mut blobs = BlobMap::new();
        let mut equivalences = EquivalenceList::new();
        for pair in labeled.windows(2) {
            equivalences.extend(stitch_ranges(&pair[0].last_labels, &pair[1].first_labels));
        }
        for part in labeled {
            blobs.extend(part.blobs);
        }
        let map = union_find_equivalences(&equivalences);
        let merged = merge_blobs(&mut blobs, &map);
        log::debug!(
            "Stitched partitions with {} seam equivalences ({merged} merges)",
            equivalences.len()
        );
        Ok(blobs)
    }

    /// Registers an equivalence for every pair of colliding blob
    /// ellipsoids.
    ///
    /// Blobs that cannot be fitted, or whose fit is flat, are removed.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the octree parameters are
    /// invalid.
    pub fn find_collisions(&self, blobs: &mut BlobMap, world: &Aabb) -> Result<EquivalenceList> {
        let confidence = self.config.confidence;
        // shapes[i] is the ellipsoid of blob owners[i]
        let mut shapes: Vec<Shape> = Vec::with_capacity(blobs.len());
        let mut owners: Vec<Label> = Vec::with_capacity(blobs.len());

        blobs.retain(|&label, blob| match blob.to_ellipsoid(confidence) {
            Ok(shape) if shape.min_radius() >= MIN_RADIUS => {
                shapes.push(Shape::Ellipsoid(shape));
                owners.push(label);
                true
            }
            Ok(_) => {
                log::debug!("Dropping flat blob {label}");
                false
            }
            Err(err) => {
                log::debug!("Dropping blob {label}: {err}");
                false
            }
        });

        let mut octree = Octree::new(*world, self.config.index, &shapes)?.with_tolerance(self.config.tolerance);
        let indexed = octree.add_all();
        if indexed.len() < shapes.len() {
            log::debug!("{} blobs outside the world box", shapes.len() - indexed.len());
        }

        let mut equivalences = EquivalenceList::new();
        for (a, b) in octree.get_collisions() {
            register_equivalence(owners[a.index()], owners[b.index()], &mut equivalences);
        }
        Ok(equivalences)
    }

    /// Merges colliding blobs until a round performs no merge.
    ///
    /// Returns the number of rounds and the total number of collisions.
    ///
    /// # Errors
    /// Returns [`Error::Aborted`] if cancelled between rounds.
    pub fn merge_collisions(
        &self,
        blobs: &mut BlobMap,
        world: &Aabb,
        progress: &dyn ProgressHandler,
    ) -> Result<(usize, usize)> {
        let resolver = self.resolver();
        let mut collisions = 0;
        for iteration in 1..=self.config.max_merge_iterations {
            if progress.aborted() {
                return Err(Error::Aborted);
            }
            let before = blobs.len();
            let mut equivalences = self.find_collisions(blobs, world)?;
            collisions += equivalences.len();
            let merged = resolver.resolve(blobs, &mut equivalences);
            log::debug!(
                "Merge round {iteration}: {before} -> {} blobs ({merged} merges)",
                blobs.len()
            );
            if merged == 0 {
                return Ok((iteration, collisions));
            }
        }
        log::warn!(
            "Merge loop stopped after {} rounds with {} blobs still merging",
            self.config.max_merge_iterations,
            blobs.len()
        );
        Ok((self.config.max_merge_iterations, collisions))
    }

    /// Removes blobs outside the component bounds.
    pub fn prune(&self, blobs: &mut BlobMap) {
        let (min, max) = (self.config.min_components, self.config.max_components);
        blobs.retain(|_, blob| (min..=max).contains(&blob.component_count()));
    }

    /// Fits the final ellipsoid of every blob and flags the implausible
    /// ones.
    #[allow(clippy::cast_precision_loss)]
    pub fn features<S: FrameSource + ?Sized>(&self, blobs: &BlobMap, source: &S) -> Vec<Feature> {
        let margin = self.filter.as_ref().map_or(0, |f| f.margin()) as f64;
        let detector = Aabb::new(
            Vector3::new(margin, margin, 0.0),
            Vector3::new(
                source.n_cols() as f64 - margin,
                source.n_rows() as f64 - margin,
                source.n_frames() as f64 - 1.0,
            ),
        )
        .ok();

        blobs
            .iter()
            .filter_map(|(&label, blob)| {
                let shape = blob.to_ellipsoid(self.config.confidence).ok()?;
                let extents = shape.aabb().extents();
                let sized = extents.min() >= MIN_EXTENT && extents.max() <= MAX_EXTENT;
                let inside = detector.is_some_and(|d| d.contains(shape.aabb()));
                Some(Feature {
                    label,
                    blob: blob.clone(),
                    shape,
                    selected: sized && inside,
                })
            })
            .collect()
    }
}

/// `[0, cols] x [0, rows] x [0, frames]` in voxel coordinates.
///
/// # Errors
/// Returns [`Error::InvalidBounds`] for a source with an empty dimension.
#[allow(clippy::cast_precision_loss)]
pub fn world_box<S: FrameSource + ?Sized>(source: &S) -> Result<Aabb> {
    Aabb::new(
        Vector3::zeros(),
        Vector3::new(
            source.n_cols() as f64,
            source.n_rows() as f64,
            source.n_frames() as f64,
        ),
    )
}

fn relabel(labels: &mut Array2<Label>, map: &BTreeMap<Label, Label>) {
    if map.is_empty() {
        return;
    }
    labels.mapv_inplace(|label| map.get(&label).copied().unwrap_or(label));
}

#[cfg(test)]
mod tests {
    use super::*;
    use peakvox_core::{Progress, Volume};

    #[test]
    fn test_partition_frames() {
        assert_eq!(partition_frames(0..10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(partition_frames(5..7, 4), vec![5..6, 6..7]);
        assert_eq!(partition_frames(3..3, 4), Vec::<Range<usize>>::new());
        assert_eq!(partition_frames(0..4, 0), vec![0..4]);
    }

    #[test]
    fn test_config_validation() {
        assert!(FinderConfig::default().validate().is_ok());
        for bad in [
            FinderConfig::new().with_confidence(1.0),
            FinderConfig::new().with_min_components(10).with_max_components(5),
            FinderConfig::new().with_threshold(Threshold::Relative(-1.0)),
            FinderConfig::new().with_max_merge_iterations(0),
            FinderConfig::new().with_index(IndexConfig::default().with_max_depth(0)),
        ] {
            assert!(matches!(BlobFinder::new(bad), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_relative_threshold_uses_median() {
        let volume = Volume::from_fn(3, 4, 4, |(z, _, x)| if x == 0 { 100.0 } else { z as f64 + 1.0 });
        let finder =
            BlobFinder::new(FinderConfig::new().with_threshold(Threshold::Relative(3.0))).unwrap();
        // per-frame medians 1, 2, 3
        let threshold = finder.absolute_threshold(&volume, 0..3).unwrap();
        assert!((threshold - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_frame_range_is_clipped() {
        let volume = Volume::from_fn(5, 2, 2, |_| 0.0);
        let finder = BlobFinder::new(FinderConfig::new().with_frames(3..9)).unwrap();
        assert_eq!(finder.frame_range(&volume), 3..5);
        let finder = BlobFinder::new(FinderConfig::new().with_frames(7..9)).unwrap();
        assert!(finder.frame_range(&volume).is_empty());
    }

    #[test]
    fn test_flat_blobs_are_dropped() {
        let finder = BlobFinder::new(FinderConfig::default()).unwrap();
        let world = Aabb::new(Vector3::zeros(), Vector3::repeat(10.0)).unwrap();
        let mut blobs = BlobMap::new();
        // single frame: zero extent along z
        let mut flat = Blob::new();
        for x in 0..3 {
            for y in 0..3 {
                flat.add_point(f64::from(x) + 2.0, f64::from(y) + 2.0, 4.0, 1.0);
            }
        }
        blobs.insert(1, flat);
        blobs.insert(2, Blob::new());
        let equivalences = finder.find_collisions(&mut blobs, &world).unwrap();
        assert!(equivalences.is_empty());
        assert!(blobs.is_empty());
    }

    fn cube(x0: f64) -> Blob {
        let mut blob = Blob::new();
        for z in 0..3 {
            for y in 0..3 {
                for x in 0..3 {
                    blob.add_point(x0 + f64::from(x), 20.0 + f64::from(y), 20.0 + f64::from(z), 1.0);
                }
            }
        }
        blob
    }

    #[test]
    fn test_merge_loop_ends_on_round_without_merges() {
        let finder = BlobFinder::new(FinderConfig::default()).unwrap();
        let world = Aabb::new(Vector3::zeros(), Vector3::repeat(100.0)).unwrap();
        let mut flat = Blob::new();
        for x in 0..3 {
            for y in 0..3 {
                flat.add_point(40.0 + f64::from(x), 40.0 + f64::from(y), 40.0, 1.0);
            }
        }
        // dropping the flat blob shrinks the map but merges nothing
        let mut blobs = BlobMap::from([(1, cube(10.0)), (2, cube(60.0)), (3, flat)]);
        let (rounds, collisions) = finder
            .merge_collisions(&mut blobs, &world, &Progress::new())
            .unwrap();
        assert_eq!((rounds, collisions), (1, 0));
        assert_eq!(blobs.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        let mut blobs = BlobMap::from([(1, cube(10.0)), (2, cube(11.0)), (3, cube(60.0))]);
        let (rounds, collisions) = finder
            .merge_collisions(&mut blobs, &world, &Progress::new())
            .unwrap();
        assert_eq!((rounds, collisions), (2, 1));
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[&1].component_count(), 54);
    }

    #[test]
    fn test_abort_stops_merge_loop() {
        let finder = BlobFinder::new(FinderConfig::default()).unwrap();
        let world = Aabb::new(Vector3::zeros(), Vector3::repeat(10.0)).unwrap();
        let progress = Progress::new();
        progress.abort();
        let mut blobs = BlobMap::new();
        assert!(matches!(
            finder.merge_collisions(&mut blobs, &world, &progress),
            Err(Error::Aborted)
        ));
    }
}
