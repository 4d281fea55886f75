//! Block-streaming merge of one source raster into a shared target.
//!
//! [`merge`] composites the non-nodata pixels of a source raster into a
//! target raster in place, one block at a time, without ever loading either
//! raster whole. The composition rule is fill-only-empty: a target pixel is
//! written only while it still holds nodata, so the first merge to touch a
//! cell wins and later merges never overwrite it.
//!
//! Merges targeting the same raster must be serialized; [`MergeChain`]
//! provides that ordering structurally by threading a dependency edge from
//! each merge task to its predecessor in the same chain, so the
//! single-writer guarantee holds without any runtime lock.

use crate::graph::{TaskId, TaskSpec};
use crate::raster::{RasterError, RasterStore};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Maximum deviation from an integral pixel offset before a source grid is
/// considered misaligned with the target grid, as a fraction of a pixel.
pub const ALIGNMENT_TOLERANCE: f64 = 1e-3;

/// Relative tolerance for nodata comparison.
const NODATA_RTOL: f64 = 1e-5;
/// Absolute tolerance for nodata comparison.
const NODATA_ATOL: f64 = 1e-8;

/// Errors from merge operations.
#[derive(Debug, Error)]
pub enum MosaicError {
    /// Raster open, read, or write failure.
    #[error(transparent)]
    Raster(#[from] RasterError),

    /// Source origin does not fall on an integral target pixel offset.
    #[error("Source {src} misaligned with target grid: {axis} offset {offset} pixels", src = .source_path.display())]
    Misaligned {
        source_path: PathBuf,
        axis: &'static str,
        offset: f64,
    },

    /// Source raster lies wholly outside the target extent. Warped tiles
    /// always overlap their mosaic, so this is a caller bug, not a
    /// condition to skip silently.
    #[error("Source {src} lies entirely outside target {tgt}", src = .source_path.display(), tgt = .target.display())]
    OutsideTarget { source_path: PathBuf, target: PathBuf },

    /// Completion token could not be written.
    #[error("Failed to write completion token {path}: {source}")]
    Token {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whether `value` counts as nodata, with `numpy.isclose`-style tolerance.
///
/// A NaN nodata value matches NaN pixels; exact comparison is useless there.
pub fn is_nodata(value: f64, nodata: f64) -> bool {
    if nodata.is_nan() {
        return value.is_nan();
    }
    (value - nodata).abs() <= NODATA_ATOL + NODATA_RTOL * nodata.abs()
}

/// Composites the non-nodata pixels of `source_path` into `target_path`.
///
/// Preconditions (the caller's warp step guarantees them): source and
/// target share pixel size, data type, and nodata semantics; the target
/// exists and has been initialized with nodata or previously merged.
///
/// On success the completion token is written at `token_path`. The target
/// raster itself is deliberately not a completion marker; many merges share
/// it.
pub fn merge(
    store: &dyn RasterStore,
    source_path: &Path,
    target_path: &Path,
    token_path: &Path,
) -> Result<(), MosaicError> {
    let source = store.describe(source_path)?;
    let target = store.describe(target_path)?;
    let target_gt = target.geotransform;
    let source_gt = source.geotransform;

    let x_offset = pixel_offset(
        source_gt.origin_x - target_gt.origin_x,
        target_gt.pixel_width,
        source_path,
        "x",
    )?;
    let y_offset = pixel_offset(
        source_gt.origin_y - target_gt.origin_y,
        target_gt.pixel_height,
        source_path,
        "y",
    )?;

    let outside = x_offset >= target.cols as i64
        || y_offset >= target.rows as i64
        || x_offset + source.cols as i64 <= 0
        || y_offset + source.rows as i64 <= 0;
    if outside {
        return Err(MosaicError::OutsideTarget {
            source_path: source_path.to_path_buf(),
            target: target_path.to_path_buf(),
        });
    }

    debug!(
        source = %source_path.display(),
        target = %target_path.display(),
        x_offset,
        y_offset,
        "merging"
    );

    let target_nodata = target.nodata;
    let source_nodata = source.nodata;
    let mut target_handle = store.open_for_update(target_path)?;
    let mut filled_pixels: u64 = 0;
    for item in store.block_iter(source_path)? {
        let (offset, source_block) = item?;
        let tx = offset.x_off as i64 + x_offset;
        let ty = offset.y_off as i64 + y_offset;
        // Negative or overhanging windows surface as a raster error here;
        // a partially overlapping tile is a caller bug just like a wholly
        // outside one.
        if tx < 0 || ty < 0 {
            return Err(RasterError::WindowOutOfBounds {
                x_off: tx,
                y_off: ty,
                width: source_block.width,
                height: source_block.height,
                cols: target.cols,
                rows: target.rows,
            }
            .into());
        }
        let mut target_block =
            target_handle.read_block(tx as u32, ty as u32, source_block.width, source_block.height)?;

        let mut dirty = false;
        for (tv, &sv) in target_block.data.iter_mut().zip(&source_block.data) {
            if is_nodata(*tv, target_nodata) && !is_nodata(sv, source_nodata) {
                *tv = sv;
                dirty = true;
                filled_pixels += 1;
            }
        }
        if dirty {
            target_handle.write_block(&target_block, tx as u32, ty as u32)?;
        }
    }
    target_handle.flush()?;
    drop(target_handle);

    debug!(
        source = %source_path.display(),
        filled_pixels,
        "merge complete"
    );
    std::fs::write(token_path, b"complete!").map_err(|e| MosaicError::Token {
        path: token_path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn pixel_offset(
    distance: f64,
    pixel_size: f64,
    source: &Path,
    axis: &'static str,
) -> Result<i64, MosaicError> {
    let offset = distance / pixel_size;
    if (offset - offset.round()).abs() > ALIGNMENT_TOLERANCE {
        return Err(MosaicError::Misaligned {
            source_path: source.to_path_buf(),
            axis,
            offset,
        });
    }
    Ok(offset.round() as i64)
}

/// The totally-ordered sequence of merge tasks targeting one output
/// group's raster.
///
/// Invariant: at most one in-flight merge per chain. Each pushed task
/// depends on the previous one (or on the group's initialization task for
/// the first), so distinct workers can never concurrently mutate the same
/// output raster. Chain order equals submission order, which makes overlap
/// resolution deterministic.
#[derive(Debug)]
pub struct MergeChain {
    group_key: String,
    init_task: TaskId,
    tail: Option<TaskId>,
    len: usize,
}

impl MergeChain {
    /// Starts a chain anchored on the group's initialization task.
    pub fn new(group_key: impl Into<String>, init_task: TaskId) -> Self {
        Self {
            group_key: group_key.into(),
            init_task,
            tail: None,
            len: 0,
        }
    }

    /// The task the next merge must depend on.
    pub fn predecessor(&self) -> TaskId {
        self.tail.unwrap_or(self.init_task)
    }

    /// Adds the chain's serialization edge to a merge task spec.
    pub fn link(&self, spec: TaskSpec) -> TaskSpec {
        spec.after([self.predecessor()])
    }

    /// Records a submitted merge task as the new chain tail.
    pub fn advance(&mut self, merge_task: TaskId) {
        self.tail = Some(merge_task);
        self.len += 1;
    }

    /// The last merge task, or the init task for an empty chain. The
    /// group's raster is complete exactly when this task is satisfied.
    pub fn final_task(&self) -> TaskId {
        self.predecessor()
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
