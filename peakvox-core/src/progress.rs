//! Progress reporting and cooperative cancellation.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Sink for progress, status text and cancellation requests.
///
/// Handlers are shared between worker threads, so every method takes
/// `&self`.
pub trait ProgressHandler: Send + Sync {
    /// Reports completion of the current phase, in percent.
    fn set_progress(&self, percent: u32);

    /// Replaces the one-line status text.
    fn set_status(&self, status: &str);

    /// Appends a message to the run log.
    fn log(&self, message: &str);

    /// Requests cancellation.
    fn abort(&self);

    /// Whether cancellation was requested.
    fn aborted(&self) -> bool;
}

/// Default handler: keeps the latest state and forwards text to `log`.
#[derive(Debug, Default)]
pub struct Progress {
    percent: AtomicU32,
    cancel_flag: AtomicBool,
    status: Mutex<String>,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn progress(&self) -> u32 {
        self.percent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }
}

impl ProgressHandler for Progress {
    fn set_progress(&self, percent: u32) {
        self.percent.store(percent.min(100), Ordering::Relaxed);
    }

    fn set_status(&self, status: &str) {
        log::info!("{status}");
        *self.status.lock() = status.to_owned();
    }

    fn log(&self, message: &str) {
        log::info!("{message}");
    }

    fn abort(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    fn aborted(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }
}

/// Converts per-item completion from many threads into whole-percent
/// progress updates.
pub struct ProgressCounter<'a> {
    handler: &'a dyn ProgressHandler,
    total: usize,
    done: AtomicUsize,
    last: AtomicU32,
}

impl<'a> ProgressCounter<'a> {
    pub fn new(handler: &'a dyn ProgressHandler, total: usize) -> Self {
        handler.set_progress(0);
        Self {
            handler,
            total: total.max(1),
            done: AtomicUsize::new(0),
            last: AtomicU32::new(0),
        }
    }

    /// Fails with [`Error::Aborted`] if cancellation was requested.
    ///
    /// # Errors
    /// See above.
    pub fn check(&self) -> Result<()> {
        if self.handler.aborted() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Marks one more item as done.
    ///
    /// # Errors
    /// Returns [`Error::Aborted`] if cancellation was requested.
    #[allow(clippy::cast_possible_truncation)]
    pub fn tick(&self) -> Result<()> {
        self.check()?;
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let percent = (done.min(self.total) * 100 / self.total) as u32;
        if self.last.fetch_max(percent, Ordering::Relaxed) < percent {
            self.handler.set_progress(percent);
        }
        Ok(())
    }

    /// Highest percentage reported so far.
    #[must_use]
    pub fn percent(&self) -> u32 {
        self.last.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_reaches_100() {
        let progress = Progress::new();
        let counter = ProgressCounter::new(&progress, 400);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        counter.tick().unwrap();
                    }
                });
            }
        });
        assert_eq!(counter.percent(), 100);
        assert!(progress.progress() > 0);
    }

    #[test]
    fn test_abort_is_observed() {
        let progress = Progress::new();
        let counter = ProgressCounter::new(&progress, 10);
        counter.tick().unwrap();
        progress.abort();
        assert!(progress.aborted());
        assert!(matches!(counter.tick(), Err(Error::Aborted)));
    }

    #[test]
    fn test_status_is_kept() {
        let progress = Progress::new();
        progress.set_status("labeling");
        assert_eq!(progress.status(), "labeling");
    }
}
