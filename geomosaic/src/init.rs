//! Empty global raster initialization.
//!
//! Every output group starts from a whole-earth raster filled with nodata;
//! merges then claim cells tile by tile. The raster spans [-180, 180) by
//! [90, -90) in WGS84 with rows increasing southward.

use crate::raster::{DataType, Geotransform, RasterError, RasterStore, DEFAULT_BLOCK_SHAPE, WGS84_WKT};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from raster initialization.
#[derive(Debug, Error)]
pub enum InitError {
    /// Cell size must be positive and no larger than the raster span.
    #[error("Invalid cell size {0}: must be in (0, 180]")]
    InvalidCellSize(f64),

    #[error(transparent)]
    Raster(#[from] RasterError),

    /// Completion token could not be written.
    #[error("Failed to write completion token {path}: {source}")]
    Token {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Dimensions of a whole-earth raster at the given cell size, in degrees.
pub fn global_dimensions(cell_size: f64) -> Result<(u32, u32), InitError> {
    if !(cell_size > 0.0 && cell_size <= 180.0) {
        return Err(InitError::InvalidCellSize(cell_size));
    }
    let cols = (360.0 / cell_size).floor() as u32;
    let rows = (180.0 / cell_size).floor() as u32;
    Ok((cols, rows))
}

/// Creates an empty whole-earth raster filled with `nodata`.
///
/// The geotransform is anchored at (-180, +90) with positive x pixel size
/// and negative y pixel size. After filling and flushing, the raster is
/// re-opened as a basic write-integrity check; the completion token is
/// written only once that succeeds.
pub fn create_empty_global_raster(
    store: &dyn RasterStore,
    cell_size: f64,
    nodata: f64,
    data_type: DataType,
    target_path: &Path,
    token_path: &Path,
) -> Result<(), InitError> {
    let (cols, rows) = global_dimensions(cell_size)?;
    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| InitError::Token {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    debug!(
        target = %target_path.display(),
        cols,
        rows,
        nodata,
        "creating empty global raster"
    );
    let mut handle = store.create(target_path, cols, rows, data_type, nodata, DEFAULT_BLOCK_SHAPE)?;
    handle.set_georeference(
        Geotransform::new(-180.0, 90.0, cell_size, -cell_size),
        WGS84_WKT,
    )?;
    handle.fill(nodata)?;
    handle.flush()?;
    drop(handle);

    // Verify the raster re-opens before declaring the work durable.
    store.open(target_path)?;
    std::fs::write(token_path, b"complete!").map_err(|e| InitError::Token {
        path: token_path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}
