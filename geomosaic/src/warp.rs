//! Warp collaborator seam.
//!
//! Reprojection and resampling are not this pipeline's business; it only
//! schedules them. The [`Warper`] trait is the black-box capability the
//! orchestrator submits warp tasks against. Production deployments back it
//! with an external warp engine; [`GridAlignedWarper`] is the built-in
//! implementation that resamples a tile onto the pipeline's common grid
//! using the raster store alone.
//!
//! The built-in warper snaps the output origin onto the global grid
//! anchored at (-180, 90), which is what guarantees every warped tile
//! satisfies the mosaicker's integral-offset invariant.

use crate::raster::{
    Block, Geotransform, RasterError, RasterStore, ResampleMethod, DEFAULT_BLOCK_SHAPE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from warp operations.
#[derive(Debug, Error)]
pub enum WarpError {
    #[error(transparent)]
    Raster(#[from] RasterError),

    /// The built-in warper only supports nearest-neighbor resampling.
    #[error("Resample method {0:?} not supported by the built-in warper")]
    UnsupportedResample(ResampleMethod),

    /// Source pixel sizes must be positive and the raster north-up.
    #[error("Source {0} has a degenerate geotransform")]
    DegenerateSource(PathBuf),
}

/// External warp capability: reproject/resample one tile onto the
/// pipeline's common pixel size and spatial reference.
pub trait Warper: Send + Sync + 'static {
    fn warp(
        &self,
        source_path: &Path,
        target_pixel_size: (f64, f64),
        target_path: &Path,
        resample: ResampleMethod,
        target_srs_wkt: &str,
    ) -> Result<(), WarpError>;
}

/// Built-in warper that resamples onto the global grid.
///
/// Assumes source tiles already carry geographic coordinates; it changes
/// pixel size and grid registration, not the coordinate system. The target
/// SRS is recorded on the output as-is.
pub struct GridAlignedWarper {
    store: Arc<dyn RasterStore>,
}

impl GridAlignedWarper {
    pub fn new(store: Arc<dyn RasterStore>) -> Self {
        Self { store }
    }
}

impl Warper for GridAlignedWarper {
    fn warp(
        &self,
        source_path: &Path,
        target_pixel_size: (f64, f64),
        target_path: &Path,
        resample: ResampleMethod,
        target_srs_wkt: &str,
    ) -> Result<(), WarpError> {
        if resample != ResampleMethod::Nearest {
            return Err(WarpError::UnsupportedResample(resample));
        }
        let source = self.store.describe(source_path)?;
        let src_gt = source.geotransform;
        if src_gt.pixel_width <= 0.0 || src_gt.pixel_height >= 0.0 {
            return Err(WarpError::DegenerateSource(source_path.to_path_buf()));
        }
        let (px, py_abs) = (target_pixel_size.0.abs(), target_pixel_size.1.abs());

        // Source extent in map units.
        let min_x = src_gt.origin_x;
        let max_y = src_gt.origin_y;
        let max_x = min_x + source.cols as f64 * src_gt.pixel_width;
        let min_y = max_y + source.rows as f64 * src_gt.pixel_height;

        // Snap the output origin onto the global grid anchored at
        // (-180, 90); this is what keeps the mosaic offsets integral.
        let origin_x = -180.0 + ((min_x + 180.0) / px).floor() * px;
        let origin_y = 90.0 - ((90.0 - max_y) / py_abs).floor() * py_abs;
        let cols = ((max_x - origin_x) / px).ceil().max(1.0) as u32;
        let rows = ((origin_y - min_y) / py_abs).ceil().max(1.0) as u32;

        debug!(
            source = %source_path.display(),
            target = %target_path.display(),
            cols,
            rows,
            "warping tile onto common grid"
        );

        let mut target = self.store.create(
            target_path,
            cols,
            rows,
            source.data_type,
            source.nodata,
            DEFAULT_BLOCK_SHAPE,
        )?;
        target.set_georeference(
            Geotransform::new(origin_x, origin_y, px, -py_abs),
            target_srs_wkt,
        )?;

        let mut source_handle = self.store.open(source_path)?;
        let mut src_row_cache: Option<(u32, Vec<f64>)> = None;
        let mut out_row = Vec::with_capacity(cols as usize);
        for row in 0..rows {
            // Map the target row's center into source pixel space.
            let y_center = origin_y - (row as f64 + 0.5) * py_abs;
            let src_row_f = (src_gt.origin_y - y_center) / -src_gt.pixel_height;
            let src_row = src_row_f.floor();
            let src_values: &[f64] = if src_row < 0.0 || src_row >= source.rows as f64 {
                &[]
            } else {
                let src_row = src_row as u32;
                let stale = !matches!(&src_row_cache, Some((cached, _)) if *cached == src_row);
                if stale {
                    let block = source_handle.read_block(0, src_row, source.cols, 1)?;
                    src_row_cache = Some((src_row, block.data));
                }
                &src_row_cache.as_ref().expect("cache populated").1
            };

            out_row.clear();
            for col in 0..cols {
                let x_center = origin_x + (col as f64 + 0.5) * px;
                let src_col = ((x_center - src_gt.origin_x) / src_gt.pixel_width).floor();
                let value = if src_values.is_empty()
                    || src_col < 0.0
                    || src_col >= source.cols as f64
                {
                    source.nodata
                } else {
                    src_values[src_col as usize]
                };
                out_row.push(value);
            }
            target.write_block(&Block::new(cols, 1, out_row.clone()), 0, row)?;
        }
        target.flush()?;
        Ok(())
    }
}
