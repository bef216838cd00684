//! Frame access for 3D scans.
//!
//! A scan is a stack of 2D detector frames. Frames are `Array2<f64>`
//! indexed `[[row, col]]`; in voxel coordinates `x` is the column, `y` the
//! row and `z` the frame index.

use crate::error::{Error, Result};
use ndarray::{Array2, Array3, Axis};
use parking_lot::Mutex;

/// Indexed, 0-based access to the frames of a scan.
///
/// Sources that can be read from several threads at once should also be
/// `Sync`; others can be wrapped in [`SerializedSource`].
pub trait FrameSource {
    /// Number of frames in the scan.
    fn n_frames(&self) -> usize;

    /// Number of detector rows per frame.
    fn n_rows(&self) -> usize;

    /// Number of detector columns per frame.
    fn n_cols(&self) -> usize;

    /// Reads one frame.
    ///
    /// # Errors
    /// Returns [`Error::FrameIndex`] for an index past the end, or a
    /// source-specific error if the frame cannot be read.
    fn frame(&self, index: usize) -> Result<Array2<f64>>;

    /// `(rows, cols)` of every frame.
    fn frame_shape(&self) -> (usize, usize) {
        (self.n_rows(), self.n_cols())
    }
}

impl<S: FrameSource + ?Sized> FrameSource for &S {
    fn n_frames(&self) -> usize {
        (**self).n_frames()
    }

    fn n_rows(&self) -> usize {
        (**self).n_rows()
    }

    fn n_cols(&self) -> usize {
        (**self).n_cols()
    }

    fn frame(&self, index: usize) -> Result<Array2<f64>> {
        (**self).frame(index)
    }
}

/// Checks a frame index against the source length.
///
/// # Errors
/// Returns [`Error::FrameIndex`] if `index >= n_frames`.
pub fn check_index(index: usize, n_frames: usize) -> Result<()> {
    if index >= n_frames {
        return Err(Error::FrameIndex { index, n_frames });
    }
    Ok(())
}

/// Checks that `frame` has the dimensions the source advertises.
///
/// # Errors
/// Returns [`Error::FrameShape`] on mismatch.
pub fn ensure_shape(frame: &Array2<f64>, expected: (usize, usize)) -> Result<()> {
    let found = frame.dim();
    if found != expected {
        return Err(Error::FrameShape { expected, found });
    }
    Ok(())
}

/// Guards every read of the inner source with a mutex.
pub struct SerializedSource<S> {
    inner: Mutex<S>,
    n_frames: usize,
    n_rows: usize,
    n_cols: usize,
}

impl<S: FrameSource> SerializedSource<S> {
    pub fn new(source: S) -> Self {
        Self {
            n_frames: source.n_frames(),
            n_rows: source.n_rows(),
            n_cols: source.n_cols(),
            inner: Mutex::new(source),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S: FrameSource> FrameSource for SerializedSource<S> {
    fn n_frames(&self) -> usize {
        self.n_frames
    }

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn n_cols(&self) -> usize {
        self.n_cols
    }

    fn frame(&self, index: usize) -> Result<Array2<f64>> {
        self.inner.lock().frame(index)
    }
}

/// A scan held in memory, laid out as `(frame, row, col)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f64>,
}

impl Volume {
    #[must_use]
    pub fn new(data: Array3<f64>) -> Self {
        Self { data }
    }

    /// Builds a volume from a function of `(frame, row, col)`.
    pub fn from_fn<F>(n_frames: usize, n_rows: usize, n_cols: usize, f: F) -> Self
    where
        F: FnMut((usize, usize, usize)) -> f64,
    {
        Self {
            data: Array3::from_shape_fn((n_frames, n_rows, n_cols), f),
        }
    }

    /// Copies every frame of another source.
    ///
    /// # Errors
    /// Propagates read failures and frame shape mismatches.
    pub fn from_source<S: FrameSource + ?Sized>(source: &S) -> Result<Self> {
        let shape = source.frame_shape();
        let mut data = Array3::zeros((source.n_frames(), shape.0, shape.1));
        for (index, mut slot) in data.axis_iter_mut(Axis(0)).enumerate() {
            let frame = source.frame(index)?;
            ensure_shape(&frame, shape)?;
            slot.assign(&frame);
        }
        Ok(Self { data })
    }

    #[must_use]
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f64> {
        &mut self.data
    }

    #[must_use]
    pub fn into_inner(self) -> Array3<f64> {
        self.data
    }
}

impl FrameSource for Volume {
    fn n_frames(&self) -> usize {
        self.data.dim().0
    }

    fn n_rows(&self) -> usize {
        self.data.dim().1
    }

    fn n_cols(&self) -> usize {
        self.data.dim().2
    }

    fn frame(&self, index: usize) -> Result<Array2<f64>> {
        check_index(index, self.n_frames())?;
        Ok(self.data.index_axis(Axis(0), index).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_frames() {
        let volume = Volume::from_fn(3, 2, 4, |(z, y, x)| (100 * z + 10 * y + x) as f64);
        assert_eq!(volume.frame_shape(), (2, 4));
        let frame = volume.frame(2).unwrap();
        assert_eq!(frame[[1, 3]], 213.0);
        assert!(matches!(
            volume.frame(3),
            Err(Error::FrameIndex { index: 3, n_frames: 3 })
        ));
    }

    #[test]
    fn test_serialized_source_matches_inner() {
        let volume = Volume::from_fn(2, 3, 3, |(z, y, x)| (z + y * x) as f64);
        let serialized = SerializedSource::new(volume.clone());
        assert_eq!(serialized.n_frames(), 2);
        assert_eq!(serialized.frame(1).unwrap(), volume.frame(1).unwrap());

        let copy = Volume::from_source(&serialized).unwrap();
        assert_eq!(copy, volume);
    }

    #[test]
    fn test_ensure_shape() {
        let frame = Array2::<f64>::zeros((2, 5));
        assert!(ensure_shape(&frame, (2, 5)).is_ok());
        assert!(matches!(
            ensure_shape(&frame, (5, 2)),
            Err(Error::FrameShape { .. })
        ));
    }
}
