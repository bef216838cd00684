//! peakvox-core: Core types for blob finding in 3D detector scans.
//!
//! This crate provides the moment accumulator used to describe blobs,
//! the closed set of collision shapes, and the collaborator traits for
//! frame access and progress reporting.
//!

pub mod blob;
pub mod error;
pub mod frame;
pub mod math;
pub mod progress;
pub mod shape;

pub use blob::{Blob, MIN_MASS};
pub use error::{Error, Result};
pub use frame::{check_index, ensure_shape, FrameSource, SerializedSource, Volume};
pub use math::{confidence_to_sigmas, erf, erf_inv, sigmas_to_confidence};
pub use progress::{Progress, ProgressCounter, ProgressHandler};
pub use shape::{
    collide, Aabb, Ellipse2D, Ellipsoid, Obb, QuadricTolerance, Shape, ShapeKind, Sphere,
};
