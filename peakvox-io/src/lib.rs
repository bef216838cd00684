//! peakvox-io: Raw volume files and result export.
//!
//! Volumes are read through a memory map via memmap2 and exposed as a
//! [`peakvox_core::FrameSource`]; results are written as CSV or JSON.
//!

mod error;
mod reader;
mod writer;

pub use error::{Error, Result};
pub use reader::{RawHeader, RawVolumeReader, HEADER_LEN, MAGIC};
pub use writer::{write_raw_volume, PeakRow, PeakWriter};
