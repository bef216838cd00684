//! Parallel integration pass and the combined find-and-integrate helper.

use crate::finder::{partition_frames, BlobFinder, Feature, FinderStatistics};
use crate::integration::{Integration, IntegrationConfig, IntegrationRegion, PeakIntegrator};
use ndarray::Array2;
use parking_lot::Mutex;
use peakvox_core::{ensure_shape, Ellipsoid, FrameSource, ProgressCounter, ProgressHandler, Result};
use rayon::prelude::*;
use std::ops::{Range, RangeInclusive};

/// A found feature and the outcome of integrating it.
#[derive(Debug)]
pub struct Peak {
    /// Feature as found by the blob finder.
    pub feature: Feature,
    /// `None` for unselected features, which are not integrated.
    pub integration: Option<Result<Integration>>,
}

impl Peak {
    /// Integration result if the peak was integrated successfully.
    #[must_use]
    pub fn integrated(&self) -> Option<&Integration> {
        self.integration.as_ref().and_then(|r| r.as_ref().ok())
    }
}

/// Result of [`find_and_integrate`].
#[derive(Debug)]
pub struct PeakReport {
    /// Absolute threshold used for blob finding.
    pub threshold: f64,
    /// Blob counts per finder stage.
    pub statistics: FinderStatistics,
    /// One entry per feature, in feature order.
    pub peaks: Vec<Peak>,
}

/// Integrates every shape over `source` in one parallel pass.
///
/// Frames covered by at least one region are split into contiguous
/// partitions. For each frame, every region covering it first flags its
/// peak and guard pixels in a shared mask, so that no region counts a
/// neighbour's signal as background; then every covering integrator
/// steps under its own lock.
///
/// The outer `Result` fails on configuration, frame read errors and
/// cancellation. Each inner `Result` is the outcome of one peak, in the
/// order of `shapes`.
///
/// # Errors
/// Returns [`peakvox_core::Error::InvalidConfig`] for an invalid
/// `config`, propagates frame read errors, and returns
/// [`peakvox_core::Error::Aborted`] if `progress` requests cancellation.
pub fn integrate_peaks<S>(
    shapes: &[Ellipsoid],
    source: &S,
    config: &IntegrationConfig,
    progress: &dyn ProgressHandler,
) -> Result<Vec<Result<Integration>>>
where
    S: FrameSource + Sync + ?Sized,
{
    config.validate()?;
    let (n_frames, n_rows, n_cols) = (source.n_frames(), source.n_rows(), source.n_cols());

    let integrators = shapes
        .iter()
        .map(|shape| {
            let region = IntegrationRegion::from_config(shape.clone(), config)?;
            Ok(PeakIntegrator::new(region, n_frames, n_rows, n_cols))
        })
        .collect::<Result<Vec<_>>>()?;
    let spans: Vec<Option<RangeInclusive<usize>>> =
        integrators.iter().map(PeakIntegrator::frames).collect();
    let regions: Vec<IntegrationRegion> = integrators.iter().map(|i| i.region().clone()).collect();
    let integrators: Vec<Mutex<PeakIntegrator>> = integrators.into_iter().map(Mutex::new).collect();

    let frames = covered_frames(&spans);
    let workers = if config.workers == 0 {
        rayon::current_num_threads().max(1)
    } else {
        config.workers
    };

    progress.set_status("Integrating peaks...");
    let ticks = ProgressCounter::new(progress, frames.len());
    partition_frames(frames, workers)
        .into_par_iter()
        .try_for_each(|range| -> Result<()> {
            for index in range {
                ticks.check()?;
                let active: Vec<usize> = spans
                    .iter()
                    .enumerate()
                    .filter(|(_, span)| span.as_ref().is_some_and(|s| s.contains(&index)))
                    .map(|(i, _)| i)
                    .collect();
                if !active.is_empty() {
                    let frame = source.frame(index)?;
                    ensure_shape(&frame, (n_rows, n_cols))?;
                    let mut mask = Array2::from_elem((n_rows, n_cols), false);
                    for &i in &active {
                        regions[i].update_mask(&mut mask, index, n_frames);
                    }
                    for &i in &active {
                        integrators[i].lock().step(&frame, index, &mask);
                    }
                }
                ticks.tick()?;
            }
            Ok(())
        })?;

    let results: Vec<Result<Integration>> = integrators
        .into_iter()
        .enumerate()
        .map(|(i, integrator)| {
            let result = integrator.into_inner().end(config);
            if let Err(err) = &result {
                log::warn!("Peak {i} could not be integrated: {err}");
            }
            result
        })
        .collect();

    let integrated = results.iter().filter(|r| r.is_ok()).count();
    log::info!("Integrated {integrated} of {} peaks", results.len());
    progress.log(&format!("{integrated} of {} peaks integrated", results.len()));
    progress.set_progress(100);
    Ok(results)
}

/// Smallest frame range covering every span.
fn covered_frames(spans: &[Option<RangeInclusive<usize>>]) -> Range<usize> {
    let mut covered: Option<(usize, usize)> = None;
    for span in spans.iter().flatten() {
        let (lo, hi) = (*span.start(), *span.end());
        covered = Some(covered.map_or((lo, hi), |(a, b)| (a.min(lo), b.max(hi))));
    }
    covered.map_or(0..0, |(lo, hi)| lo..hi + 1)
}

/// Finds blobs in `source` and integrates every selected feature.
///
/// # Errors
/// Propagates the fatal errors of [`BlobFinder::find`] and
/// [`integrate_peaks`]. Failures of single peaks are reported in
/// [`Peak::integration`].
pub fn find_and_integrate<S>(
    source: &S,
    finder: &BlobFinder,
    config: &IntegrationConfig,
    progress: &dyn ProgressHandler,
) -> Result<PeakReport>
where
    S: FrameSource + Sync + ?Sized,
{
    config.validate()?;
    let found = finder.find(source, progress)?;

    let shapes: Vec<Ellipsoid> = found
        .features
        .iter()
        .filter(|f| f.selected)
        .map(|f| f.shape.clone())
        .collect();
    let mut integrations = integrate_peaks(&shapes, source, config, progress)?.into_iter();

    let peaks = found
        .features
        .into_iter()
        .map(|feature| {
            let integration = if feature.selected {
                integrations.next()
            } else {
                None
            };
            Peak {
                feature,
                integration,
            }
        })
        .collect();

    Ok(PeakReport {
        threshold: found.threshold,
        statistics: found.statistics,
        peaks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use peakvox_core::{Error, Progress, Volume};

    fn sphere(x: f64, y: f64, z: f64, r: f64) -> Ellipsoid {
        Ellipsoid::from_axes(Vector3::new(x, y, z), &Vector3::repeat(r), &Matrix3::identity())
    }

    #[test]
    fn test_covered_frames() {
        assert_eq!(covered_frames(&[]), 0..0);
        assert_eq!(covered_frames(&[None, Some(3..=5), Some(1..=2)]), 1..6);
    }

    #[test]
    fn test_results_follow_shape_order() {
        let volume = Volume::from_fn(10, 12, 12, |_| 4.0);
        let shapes = [sphere(5.0, 5.0, 5.0, 1.5), sphere(100.0, 100.0, 5.0, 1.0)];
        let config = IntegrationConfig::new().with_update_shape(false);
        let results = integrate_peaks(&shapes, &volume, &config, &Progress::new()).unwrap();
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert!((first.background_mean - 4.0).abs() < 1e-12);
        assert!(matches!(results[1], Err(Error::NoBackground)));
    }

    #[test]
    fn test_worker_count_does_not_change_results() {
        let volume = Volume::from_fn(16, 16, 16, |(z, y, x)| ((x * 7 + y * 3 + z * 5) % 11) as f64);
        let shapes = [sphere(6.0, 6.0, 6.0, 2.0), sphere(9.0, 9.0, 8.0, 2.0)];
        let config = IntegrationConfig::new().with_update_shape(false);
        let one = integrate_peaks(&shapes, &volume, &config.clone().with_workers(1), &Progress::new())
            .unwrap();
        let four = integrate_peaks(&shapes, &volume, &config.with_workers(4), &Progress::new())
            .unwrap();
        for (a, b) in one.iter().zip(&four) {
            let (a, b) = (a.as_ref().unwrap(), b.as_ref().unwrap());
            assert_eq!(a.region_points, b.region_points);
            assert_eq!(a.background_points, b.background_points);
            assert!((a.intensity - b.intensity).abs() < 1e-9);
        }
    }

    #[test]
    fn test_abort_is_fatal() {
        let volume = Volume::from_fn(8, 8, 8, |_| 1.0);
        let progress = Progress::new();
        progress.abort();
        let result = integrate_peaks(
            &[sphere(4.0, 4.0, 4.0, 1.0)],
            &volume,
            &IntegrationConfig::default(),
            &progress,
        );
        assert!(matches!(result, Err(Error::Aborted)));
    }
}
