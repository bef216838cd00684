//! Error types for peakvox-core.

use thiserror::Error;

/// Result type alias for peakvox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for peakvox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The accumulated mass is too small to fit a shape.
    #[error("degenerate blob: mass {mass} is below the fitting threshold")]
    DegenerateBlob { mass: f64 },

    /// Integration finished without a single background voxel.
    #[error("no background voxels were found for this peak")]
    NoBackground,

    /// Invalid configuration parameter.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// Bounding box with inverted or coincident bounds.
    #[error("invalid bounds: lower {lower:?} must be strictly below upper {upper:?}")]
    InvalidBounds { lower: [f64; 3], upper: [f64; 3] },

    /// Shape parameters that do not describe a solid.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Frame index outside the data.
    #[error("frame {index} is out of range (source has {n_frames} frames)")]
    FrameIndex { index: usize, n_frames: usize },

    /// Frame with unexpected dimensions.
    #[error("frame shape mismatch: expected {expected:?}, found {found:?}")]
    FrameShape {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// The run was cancelled through its progress handler.
    #[error("operation aborted")]
    Aborted,

    /// Failure reported by a frame source.
    #[error("frame source error: {0}")]
    Source(String),
}
