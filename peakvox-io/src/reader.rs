//! Memory-mapped reader for raw volume files.
//!
//! A raw volume is a 16-byte header (`PVX1` followed by the frame, row
//! and column counts as little-endian `u32`) and then every frame as
//! little-endian `f32` values in row-major order.

use crate::{Error, Result};
use memmap2::Mmap;
use ndarray::Array2;
use peakvox_core::{check_index, FrameSource};
use std::fs::File;
use std::path::{Path, PathBuf};

/// File magic of raw volumes.
pub const MAGIC: [u8; 4] = *b"PVX1";
/// Header size in bytes.
pub const HEADER_LEN: usize = 16;

const VALUE_LEN: usize = std::mem::size_of::<f32>();

/// Dimensions stored in a raw volume header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub n_frames: u32,
    pub n_rows: u32,
    pub n_cols: u32,
}

impl RawHeader {
    /// Parses the header at the start of `bytes`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] if `bytes` is too short or does not
    /// start with [`MAGIC`].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidFormat(format!(
                "file is {} bytes, shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        if bytes[..4] != MAGIC {
            return Err(Error::InvalidFormat("missing PVX1 magic".into()));
        }
        let word = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        Ok(Self {
            n_frames: word(4),
            n_rows: word(8),
            n_cols: word(12),
        })
    }

    /// Encodes the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&MAGIC);
        bytes[4..8].copy_from_slice(&self.n_frames.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.n_rows.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.n_cols.to_le_bytes());
        bytes
    }

    /// Values per frame, or `None` on overflow.
    #[must_use]
    pub fn frame_len(&self) -> Option<usize> {
        (self.n_rows as usize).checked_mul(self.n_cols as usize)
    }

    /// Expected file size, or `None` on overflow.
    #[must_use]
    pub fn file_len(&self) -> Option<usize> {
        self.frame_len()?
            .checked_mul(self.n_frames as usize)?
            .checked_mul(VALUE_LEN)?
            .checked_add(HEADER_LEN)
    }
}

/// A raw volume file with memory-mapped frame access.
///
/// The mapping is shared read-only, so frames can be read from several
/// threads at once.
pub struct RawVolumeReader {
    mmap: Mmap,
    path: PathBuf,
    header: RawHeader,
}

impl RawVolumeReader {
    /// Opens a raw volume and validates its size against the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped, or
    /// [`Error::InvalidFormat`] if the header is invalid or the file size
    /// does not match it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };

        let header = RawHeader::parse(&mmap)?;
        let expected = header
            .file_len()
            .ok_or_else(|| Error::InvalidFormat("volume dimensions overflow".into()))?;
        if mmap.len() != expected {
            return Err(Error::InvalidFormat(format!(
                "{}x{}x{} volume needs {expected} bytes, file has {}",
                header.n_frames,
                header.n_rows,
                header.n_cols,
                mmap.len()
            )));
        }
        log::debug!(
            "Mapped {} ({} frames of {}x{})",
            path.as_ref().display(),
            header.n_frames,
            header.n_rows,
            header.n_cols
        );

        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
            header,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> RawHeader {
        self.header
    }

    /// Raw little-endian bytes of frame `index`.
    fn frame_bytes(&self, index: usize) -> &[u8] {
        let len = self.n_rows() * self.n_cols() * VALUE_LEN;
        let start = HEADER_LEN + index * len;
        &self.mmap[start..start + len]
    }
}

impl FrameSource for RawVolumeReader {
    fn n_frames(&self) -> usize {
        self.header.n_frames as usize
    }

    fn n_rows(&self) -> usize {
        self.header.n_rows as usize
    }

    fn n_cols(&self) -> usize {
        self.header.n_cols as usize
    }

    fn frame(&self, index: usize) -> peakvox_core::Result<Array2<f64>> {
        check_index(index, self.n_frames())?;
        let values: Vec<f64> = self
            .frame_bytes(index)
            .chunks_exact(VALUE_LEN)
            .map(|b| f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect();
        Array2::from_shape_vec(self.frame_shape(), values)
            .map_err(|err| peakvox_core::Error::Source(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_bytes(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_header_bytes() {
        let header = RawHeader {
            n_frames: 3,
            n_rows: 2,
            n_cols: 258,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], b"PVX1");
        assert_eq!(&bytes[12..], &[2, 1, 0, 0]);
        assert_eq!(RawHeader::parse(&bytes).unwrap(), header);
        assert_eq!(header.file_len(), Some(16 + 3 * 2 * 258 * 4));
    }

    #[test]
    fn test_reads_frames() {
        let header = RawHeader {
            n_frames: 2,
            n_rows: 2,
            n_cols: 3,
        };
        let mut bytes = header.to_bytes().to_vec();
        for v in 0..12u8 {
            bytes.extend_from_slice(&f32::from(v).to_le_bytes());
        }
        let file = write_bytes(&bytes);

        let reader = RawVolumeReader::open(file.path()).unwrap();
        assert_eq!(reader.frame_shape(), (2, 3));
        let frame = reader.frame(1).unwrap();
        assert_eq!(frame[[0, 0]], 6.0);
        assert_eq!(frame[[1, 2]], 11.0);
        assert!(matches!(
            reader.frame(2),
            Err(peakvox_core::Error::FrameIndex { index: 2, n_frames: 2 })
        ));
    }

    #[test]
    fn test_rejects_bad_files() {
        let file = write_bytes(b"PVX2\0\0\0\0\0\0\0\0\0\0\0\0");
        assert!(matches!(
            RawVolumeReader::open(file.path()),
            Err(Error::InvalidFormat(_))
        ));

        let file = write_bytes(b"PVX1");
        assert!(matches!(
            RawVolumeReader::open(file.path()),
            Err(Error::InvalidFormat(_))
        ));

        // header promises one 1x1 frame, no payload follows
        let header = RawHeader {
            n_frames: 1,
            n_rows: 1,
            n_cols: 1,
        };
        let file = write_bytes(&header.to_bytes());
        assert!(matches!(
            RawVolumeReader::open(file.path()),
            Err(Error::InvalidFormat(_))
        ));
    }
}
