//! Per-frame pre-filters applied before thresholding.
//!
//! Filters see one frame at a time and never change its shape. Pixels
//! outside the frame are taken from the nearest border pixel.

use ndarray::Array2;

/// Maps a frame to a filtered frame of the same shape.
pub trait FrameFilter: Send + Sync {
    /// Filters one frame.
    fn apply(&self, frame: &Array2<f64>) -> Array2<f64>;

    /// Number of border pixels whose filtered value depends on pixels
    /// outside the frame.
    fn margin(&self) -> usize {
        0
    }
}

impl<F> FrameFilter for F
where
    F: Fn(&Array2<f64>) -> Array2<f64> + Send + Sync,
{
    fn apply(&self, frame: &Array2<f64>) -> Array2<f64> {
        self(frame)
    }
}

/// Identity filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaFilter;

impl FrameFilter for DeltaFilter {
    fn apply(&self, frame: &Array2<f64>) -> Array2<f64> {
        frame.clone()
    }
}

/// Mean over a `(2r + 1)²` square window.
#[derive(Debug, Clone, Copy)]
pub struct BoxFilter {
    /// Half-width of the window in pixels.
    pub radius: usize,
}

impl FrameFilter for BoxFilter {
    #[allow(clippy::cast_precision_loss)]
    fn apply(&self, frame: &Array2<f64>) -> Array2<f64> {
        let r = isize_of(self.radius);
        let offsets: Vec<(isize, isize)> = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| (dy, dx)))
            .collect();
        let norm = offsets.len() as f64;
        Array2::from_shape_fn(frame.dim(), |(row, col)| {
            offsets
                .iter()
                .map(|&(dy, dx)| clamped(frame, row, col, dy, dx))
                .sum::<f64>()
                / norm
        })
    }

    fn margin(&self) -> usize {
        self.radius
    }
}

/// Mean of the disk `d ≤ r1` minus the mean of the ring `r2 < d ≤ r3`.
///
/// Flat backgrounds map to zero and compact peaks stay positive, which
/// makes a plain absolute threshold usable across the detector.
#[derive(Debug, Clone, Copy)]
pub struct AnnularFilter {
    /// Radius of the inner disk.
    pub r1: f64,
    /// Inner radius of the ring.
    pub r2: f64,
    /// Outer radius of the ring.
    pub r3: f64,
}

impl AnnularFilter {
    fn offsets(&self) -> (Vec<(isize, isize)>, Vec<(isize, isize)>) {
        #[allow(clippy::cast_possible_truncation)]
        let reach = self.r3.max(self.r1).max(0.0).ceil() as isize;
        let mut inner = Vec::new();
        let mut ring = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                #[allow(clippy::cast_precision_loss)]
                let d = ((dx * dx + dy * dy) as f64).sqrt();
                if d <= self.r1 {
                    inner.push((dy, dx));
                } else if d > self.r2 && d <= self.r3 {
                    ring.push((dy, dx));
                }
            }
        }
        (inner, ring)
    }
}

impl FrameFilter for AnnularFilter {
    #[allow(clippy::cast_precision_loss)]
    fn apply(&self, frame: &Array2<f64>) -> Array2<f64> {
        let (inner, ring) = self.offsets();
        let mean = |offsets: &[(isize, isize)], row, col| {
            if offsets.is_empty() {
                return 0.0;
            }
            offsets
                .iter()
                .map(|&(dy, dx)| clamped(frame, row, col, dy, dx))
                .sum::<f64>()
                / offsets.len() as f64
        };
        Array2::from_shape_fn(frame.dim(), |(row, col)| {
            mean(inner.as_slice(), row, col) - mean(ring.as_slice(), row, col)
        })
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn margin(&self) -> usize {
        self.r3.max(self.r1).max(0.0).ceil() as usize
    }
}

fn isize_of(value: usize) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

fn clamped(frame: &Array2<f64>, row: usize, col: usize, dy: isize, dx: isize) -> f64 {
    let (rows, cols) = frame.dim();
    let r = row.saturating_add_signed(dy).min(rows - 1);
    let c = col.saturating_add_signed(dx).min(cols - 1);
    frame[[r, c]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spike() -> Array2<f64> {
        let mut frame = Array2::from_elem((9, 9), 5.0);
        frame[[4, 4]] = 95.0;
        frame
    }

    #[test]
    fn test_delta_is_identity() {
        let frame = spike();
        assert_eq!(DeltaFilter.apply(&frame), frame);
    }

    #[test]
    fn test_box_filter_spreads_spike() {
        let out = BoxFilter { radius: 1 }.apply(&spike());
        assert_relative_eq!(out[[4, 4]], 15.0);
        assert_relative_eq!(out[[3, 5]], 15.0);
        assert_relative_eq!(out[[0, 0]], 5.0);
        assert_eq!(out.dim(), (9, 9));
    }

    #[test]
    fn test_annular_removes_flat_background() {
        let filter = AnnularFilter {
            r1: 1.0,
            r2: 2.0,
            r3: 3.0,
        };
        let out = filter.apply(&spike());
        assert_relative_eq!(out[[0, 8]], 0.0, epsilon = 1e-12);
        // inner disk holds 5 pixels, one of them the spike
        assert_relative_eq!(out[[4, 4]], 90.0 / 5.0, epsilon = 1e-12);
        assert_eq!(filter.margin(), 3);
    }

    #[test]
    fn test_closure_filter() {
        let double = |frame: &Array2<f64>| frame * 2.0;
        let out = double.apply(&spike());
        assert_relative_eq!(out[[4, 4]], 190.0);
        assert_eq!(FrameFilter::margin(&double), 0);
    }
}
