//! Streaming 6-connected component labeling over a range of frames.
//!
//! Each above-threshold voxel looks at three already visited neighbours:
//! left (previous column), top (previous row) and previous (same pixel in
//! the prior frame). Conflicting neighbour labels are not relabelled in
//! place; they are recorded as equivalences and merged afterwards.

use crate::equivalence::{register_equivalence, BlobMap, EquivalenceList, Label};
use crate::filter::FrameFilter;
use ndarray::Array2;
use peakvox_core::{ensure_shape, Blob, FrameSource, ProgressCounter, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

const LEFT: u8 = 1;
const TOP: u8 = 2;
const PREVIOUS: u8 = 4;

/// Output of labeling one contiguous frame range.
#[derive(Debug, Clone)]
pub struct LabeledRange {
    /// Frames that were labelled.
    pub frames: Range<usize>,
    /// Blobs keyed by their primary label.
    pub blobs: BlobMap,
    /// Equivalences found inside the range, unresolved.
    pub equivalences: EquivalenceList,
    /// Labels of the first frame of the range.
    pub first_labels: Array2<Label>,
    /// Labels of the last frame of the range.
    pub last_labels: Array2<Label>,
}

/// Labels voxels at or above a threshold.
///
/// Label ids come from a shared counter so that labelers running on
/// disjoint frame ranges never hand out the same id.
pub struct ConnectedComponentLabeler<'a> {
    threshold: f64,
    counter: &'a AtomicU32,
    filter: Option<&'a dyn FrameFilter>,
}

impl<'a> ConnectedComponentLabeler<'a> {
    /// Creates a labeler drawing ids from `counter`.
    pub fn new(threshold: f64, counter: &'a AtomicU32) -> Self {
        Self {
            threshold,
            counter,
            filter: None,
        }
    }

    /// Thresholds filtered frames instead of raw ones.
    ///
    /// Blob moments always use the raw intensities.
    #[must_use]
    pub fn with_filter(mut self, filter: &'a dyn FrameFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Lowest labelled intensity.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn next_label(&self) -> Label {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Labels `frames` of `source`.
    ///
    /// The first frame of the range has no previous frame, so blobs that
    /// continue across the range start are split and joined later.
    ///
    /// # Errors
    /// Propagates frame read errors, frame shape mismatches, and
    /// cancellation reported by `progress`.
    pub fn label_range<S>(
        &self,
        source: &S,
        frames: Range<usize>,
        progress: Option<&ProgressCounter<'_>>,
    ) -> Result<LabeledRange>
    where
        S: FrameSource + ?Sized,
    {
        let shape = source.frame_shape();
        let mut current = Array2::<Label>::zeros(shape);
        let mut previous = Array2::<Label>::zeros(shape);
        let mut first_labels = Array2::<Label>::zeros(shape);
        let mut blobs = BlobMap::new();
        let mut equivalences = EquivalenceList::new();

        for index in frames.clone() {
            let raw = source.frame(index)?;
            ensure_shape(&raw, shape)?;
            self.label_frame(
                index,
                &raw,
                &previous,
                &mut current,
                &mut blobs,
                &mut equivalences,
            );
            if index == frames.start {
                first_labels.assign(&current);
            }
            std::mem::swap(&mut current, &mut previous);
            if let Some(progress) = progress {
                progress.tick()?;
            }
        }

        Ok(LabeledRange {
            frames,
            blobs,
            equivalences,
            first_labels,
            last_labels: previous,
        })
    }

    /// Labels one frame given the labels of the frame before it.
    #[allow(clippy::cast_precision_loss)]
    pub fn label_frame(
        &self,
        index: usize,
        raw: &Array2<f64>,
        previous: &Array2<Label>,
        current: &mut Array2<Label>,
        blobs: &mut BlobMap,
        equivalences: &mut EquivalenceList,
    ) {
        let filtered = self.filter.map(|f| f.apply(raw));
        let values = filtered.as_ref().unwrap_or(raw);
        let (rows, cols) = raw.dim();
        let z = index as f64;

        for row in 0..rows {
            for col in 0..cols {
                if values[[row, col]] < self.threshold {
                    current[[row, col]] = 0;
                    continue;
                }

                let left = if col == 0 { 0 } else { current[[row, col - 1]] };
                let top = if row == 0 { 0 } else { current[[row - 1, col]] };
                let prev = previous[[row, col]];

                let mut code = 0;
                if left != 0 {
                    code |= LEFT;
                }
                if top != 0 {
                    code |= TOP;
                }
                if prev != 0 {
                    code |= PREVIOUS;
                }

                let label = match code {
                    0 => self.next_label(),
                    LEFT => left,
                    TOP => top,
                    PREVIOUS => prev,
                    3 => {
                        if top != left {
                            register_equivalence(top, left, equivalences);
                        }
                        top
                    }
                    5 => {
                        if left != prev {
                            register_equivalence(left, prev, equivalences);
                        }
                        left
                    }
                    6 => {
                        if top != prev {
                            register_equivalence(top, prev, equivalences);
                        }
                        top
                    }
                    _ => {
                        register_triple(left, top, prev, equivalences);
                        left
                    }
                };

                current[[row, col]] = label;
                let value = raw[[row, col]];
                blobs
                    .entry(label)
                    .and_modify(|blob| blob.add_point(col as f64, row as f64, z, value))
                    .or_insert_with(|| Blob::from_point(col as f64, row as f64, z, value));
            }
        }
    }
}

/// Equivalences for a voxel whose three neighbours are all labelled.
fn register_triple(left: Label, top: Label, prev: Label, equivalences: &mut EquivalenceList) {
    if top == left && top != prev {
        register_equivalence(top, prev, equivalences);
    } else if top == prev && top != left {
        register_equivalence(top, left, equivalences);
    } else if left == prev && left != top {
        register_equivalence(left, top, equivalences);
    } else if left != prev && left != top && top != prev {
        register_equivalence(top, prev, equivalences);
        register_equivalence(top, left, equivalences);
        register_equivalence(left, prev, equivalences);
    }
}

/// Equivalences joining two adjacent ranges: every pixel labelled in both
/// the last frame of one range and the first frame of the next.
#[must_use]
pub fn stitch_ranges(last: &Array2<Label>, first: &Array2<Label>) -> EquivalenceList {
    let mut equivalences = EquivalenceList::new();
    for (&a, &b) in last.iter().zip(first.iter()) {
        if a != 0 && b != 0 && a != b {
            register_equivalence(a, b, &mut equivalences);
        }
    }
    equivalences.sort_unstable();
    equivalences.dedup();
    equivalences
}
