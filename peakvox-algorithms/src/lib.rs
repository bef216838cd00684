//! peakvox-algorithms: Blob finding and peak integration passes.
//!
//! This crate provides the processing passes over a frame stack:
//! - **Labeling** - streaming 6-connected components over frame partitions
//! - **Equivalence resolution** - single-pass or union-find label merging
//! - **Octree** - collision discovery between fitted blob ellipsoids
//! - **Integration** - background-corrected intensities per peak
//!
#![warn(missing_docs)]

pub mod equivalence;
pub mod filter;
mod finder;
mod integration;
pub mod labeling;
mod processing;
pub mod spatial;

pub use equivalence::{
    register_equivalence, BlobMap, EquivalenceList, EquivalenceResolver, Label, ResolveStrategy,
};
pub use filter::{AnnularFilter, BoxFilter, DeltaFilter, FrameFilter};
pub use finder::{
    partition_frames, world_box, BlobFinder, Feature, FinderConfig, FinderOutput,
    FinderStatistics, Threshold, MAX_EXTENT, MIN_EXTENT, MIN_RADIUS,
};
pub use integration::{
    Integration, IntegrationConfig, IntegrationRegion, PeakIntegrator, VoxelBounds, VoxelClass,
};
pub use labeling::{stitch_ranges, ConnectedComponentLabeler, LabeledRange};
pub use processing::{find_and_integrate, integrate_peaks, Peak, PeakReport};
pub use spatial::{IndexConfig, Octree, ShapeId, MAX_DEPTH_LIMIT};
