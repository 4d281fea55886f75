//! Delivery finalization: compressed copy plus overview pyramid.
//!
//! [`finalize`] copies a completed mosaic into the store's compressed tiled
//! layout and builds a geometric overview pyramid on the copy. Pyramid
//! builds over very large rasters emit progress for hours; the
//! [`ProgressThrottle`] bounds log volume to one line per interval without
//! affecting the build itself.

use crate::raster::{RasterError, RasterStore, ResampleMethod};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Minimum wall-clock spacing between progress reports.
pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from finalization.
#[derive(Debug, Error)]
pub enum PyramidError {
    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// Overview decimation levels for a raster whose smallest dimension is
/// `min_dimension`: successive powers of two, stopping just before the
/// level at which `min_dimension / level` would reach zero.
pub fn overview_levels(min_dimension: u32) -> Vec<u32> {
    let mut levels = Vec::new();
    let mut level = 2u32;
    while min_dimension / level > 0 {
        levels.push(level);
        match level.checked_mul(2) {
            Some(next) => level = next,
            None => break,
        }
    }
    levels
}

/// Rate limiter for progress reporting.
///
/// Owns its own timestamps rather than stashing them in process-wide
/// state, so each build carries exactly one throttle for its own scope.
/// Reports are released at most once per interval; the final 100% report
/// is always released when the build as a whole took at least one
/// interval, so long builds always log their completion.
#[derive(Debug)]
pub struct ProgressThrottle {
    started: Instant,
    last_report: Instant,
    interval: Duration,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_report: now,
            interval,
        }
    }

    /// Whether a report at `fraction` complete should be emitted now.
    pub fn should_report(&mut self, fraction: f64) -> bool {
        self.should_report_at(fraction, Instant::now())
    }

    fn should_report_at(&mut self, fraction: f64, now: Instant) -> bool {
        let due = now.duration_since(self.last_report) > self.interval;
        let final_of_long_build =
            fraction >= 1.0 && now.duration_since(self.started) >= self.interval;
        if due || final_of_long_build {
            self.last_report = now;
            true
        } else {
            false
        }
    }
}

/// Copies `source_path` into a compressed, tiled, pyramided delivery
/// raster at `target_path`.
pub fn finalize(
    store: &dyn RasterStore,
    source_path: &Path,
    resample: ResampleMethod,
    target_path: &Path,
) -> Result<(), PyramidError> {
    info!(
        source = %source_path.display(),
        target = %target_path.display(),
        "compressing raster"
    );
    store.create_compressed_copy(source_path, target_path)?;

    let descriptor = store.describe(target_path)?;
    let levels = overview_levels(descriptor.min_dimension());
    info!(
        target = %target_path.display(),
        min_dimension = descriptor.min_dimension(),
        ?levels,
        "building overview pyramid"
    );

    // Overviews live in a sidecar, so a read-only handle suffices even on
    // the finalized layout.
    let mut handle = store.open(target_path)?;
    let mut throttle = ProgressThrottle::new(PROGRESS_REPORT_INTERVAL);
    let target_name = target_path.display().to_string();
    handle.build_overviews(&levels, resample, &mut |fraction| {
        if throttle.should_report(fraction) {
            info!(
                target = %target_name,
                percent = format_args!("{:.2}", fraction * 100.0),
                "overview build progress"
            );
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{DataType, FlatFileStore, Geotransform, WGS84_WKT};
    use tempfile::TempDir;

    #[test]
    fn test_overview_levels_for_1000() {
        assert_eq!(
            overview_levels(1000),
            vec![2, 4, 8, 16, 32, 64, 128, 256, 512]
        );
    }

    #[test]
    fn test_overview_levels_edge_cases() {
        assert_eq!(overview_levels(1), Vec::<u32>::new());
        assert_eq!(overview_levels(2), vec![2]);
        assert_eq!(overview_levels(3), vec![2]);
        assert_eq!(overview_levels(4), vec![2, 4]);
    }

    #[test]
    fn test_throttle_suppresses_frequent_reports() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
        let t0 = throttle.started;
        assert!(!throttle.should_report_at(0.1, t0 + Duration::from_secs(1)));
        assert!(!throttle.should_report_at(0.2, t0 + Duration::from_secs(4)));
        assert!(throttle.should_report_at(0.3, t0 + Duration::from_secs(6)));
        // Interval restarts after each released report.
        assert!(!throttle.should_report_at(0.4, t0 + Duration::from_secs(8)));
        assert!(throttle.should_report_at(0.5, t0 + Duration::from_secs(12)));
    }

    #[test]
    fn test_throttle_always_releases_final_report_of_long_build() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
        let t0 = throttle.started;
        assert!(throttle.should_report_at(0.9, t0 + Duration::from_secs(6)));
        // 100% arrives only 1s after the last report, but the build took
        // longer than the interval: released anyway.
        assert!(throttle.should_report_at(1.0, t0 + Duration::from_secs(7)));
    }

    #[test]
    fn test_throttle_quiet_for_short_build() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
        let t0 = throttle.started;
        assert!(!throttle.should_report_at(0.5, t0 + Duration::from_secs(1)));
        assert!(!throttle.should_report_at(1.0, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_finalize_produces_compressed_pyramided_copy() {
        let dir = TempDir::new().unwrap();
        let store = FlatFileStore::new();
        let source = dir.path().join("mosaic.ras");
        let target = dir.path().join("mosaic_compressed.ras");

        let mut handle = store
            .create(&source, 64, 32, DataType::F32, -1.0, (16, 16))
            .unwrap();
        handle
            .set_georeference(Geotransform::new(-180.0, 90.0, 1.0, -1.0), WGS84_WKT)
            .unwrap();
        handle.fill(7.0).unwrap();
        handle.flush().unwrap();
        drop(handle);

        finalize(&store, &source, ResampleMethod::Nearest, &target).unwrap();

        let desc = store.describe(&target).unwrap();
        assert_eq!((desc.cols, desc.rows), (64, 32));
        // min dimension 32 -> levels 2..16
        let summary = FlatFileStore::overview_summary(&target).unwrap();
        let levels: Vec<u32> = summary.iter().map(|l| l.level).collect();
        assert_eq!(levels, vec![2, 4, 8, 16]);
    }
}
