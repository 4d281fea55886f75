//! Raster storage capability.
//!
//! The pipeline never talks to a raster codec directly. Everything it needs
//! is expressed through the narrow [`RasterStore`] / [`RasterHandle`] pair:
//! create, open, block-read, block-write, metadata query, and overview
//! builds. The built-in [`FlatFileStore`] backend implements the capability
//! on a simple container format and is what the tests and the CLI use; a
//! GDAL-backed store can be substituted without touching the pipeline.
//!
//! Blocks surface as `f64` buffers regardless of the stored pixel type; the
//! store converts to and from the native encoding at the I/O boundary. All
//! listed pixel types are exactly representable in an `f64`, so the
//! conversion is lossless.

mod flat;

pub use flat::{FlatFileStore, OverviewLevel};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// WGS84 geographic coordinate system, well-known text form (EPSG:4326).
pub const WGS84_WKT: &str = concat!(
    r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,"#,
    r#"298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],"#,
    r#"PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],"#,
    r#"UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],"#,
    r#"AUTHORITY["EPSG","4326"]]"#
);

/// Default block shape for created rasters, in pixels.
pub const DEFAULT_BLOCK_SHAPE: (u32, u32) = (256, 256);

/// Errors from raster storage operations.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Underlying file I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a raster container this store understands.
    #[error("Not a recognized raster container: {0}")]
    BadMagic(PathBuf),

    /// Header or tile index failed to decode.
    #[error("Corrupt raster container {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// A block window falls outside the raster extent.
    #[error("Block window ({x_off},{y_off}) {width}x{height} outside raster {cols}x{rows}")]
    WindowOutOfBounds {
        x_off: i64,
        y_off: i64,
        width: u32,
        height: u32,
        cols: u32,
        rows: u32,
    },

    /// Write attempted on a raster opened read-only or on a finalized layout.
    #[error("Raster {0} is not writable")]
    NotWritable(PathBuf),

    /// The nodata value cannot be represented in the pixel data type.
    #[error("Nodata value {nodata} not representable as {data_type:?}")]
    IncompatibleNodata { nodata: f64, data_type: DataType },
}

/// Pixel data types supported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl DataType {
    /// Width of one encoded pixel in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Whether `value` survives a round trip through this data type.
    ///
    /// Float types accept anything (including NaN, a common nodata choice);
    /// integer types require an in-range integral value.
    pub fn can_represent(self, value: f64) -> bool {
        match self {
            Self::F32 | Self::F64 => true,
            _ if value.fract() != 0.0 || value.is_nan() => false,
            Self::U8 => (0.0..=u8::MAX as f64).contains(&value),
            Self::I16 => (i16::MIN as f64..=i16::MAX as f64).contains(&value),
            Self::U16 => (0.0..=u16::MAX as f64).contains(&value),
            Self::I32 => (i32::MIN as f64..=i32::MAX as f64).contains(&value),
            Self::U32 => (0.0..=u32::MAX as f64).contains(&value),
            _ => unreachable!(),
        }
    }
}

/// Affine georeference of a north-up raster.
///
/// Rotation terms are not supported; the pipeline only ever produces and
/// consumes axis-aligned rasters. `pixel_height` is negative for the usual
/// rows-increase-southward orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geotransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl Geotransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Absolute pixel size (x, y).
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }
}

/// Immutable snapshot of a raster's metadata.
///
/// Re-queried on demand via [`RasterStore::describe`]; never cached across
/// mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterDescriptor {
    pub path: PathBuf,
    pub cols: u32,
    pub rows: u32,
    pub data_type: DataType,
    pub nodata: f64,
    pub geotransform: Geotransform,
    pub block_width: u32,
    pub block_height: u32,
}

impl RasterDescriptor {
    /// Smallest raster dimension, used for overview level computation.
    pub fn min_dimension(&self) -> u32 {
        self.cols.min(self.rows)
    }
}

/// Position of a block within a raster, in pixels from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOffset {
    pub x_off: u32,
    pub y_off: u32,
}

/// A decoded block of pixels.
///
/// `data` is row-major, `width * height` long. Edge blocks carry their
/// actual (possibly smaller) dimensions; no padding is introduced.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f64>,
}

impl Block {
    pub fn new(width: u32, height: u32, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            data,
        }
    }

    /// A block filled with a single value.
    pub fn filled(width: u32, height: u32, value: f64) -> Self {
        Self::new(width, height, vec![value; (width as usize) * (height as usize)])
    }
}

/// Resampling method for warps and overview builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMethod {
    /// Nearest neighbor.
    Nearest,
    /// Box average of contributing pixels.
    Average,
}

impl FromStr for ResampleMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "near" | "nearest" => Ok(Self::Nearest),
            "average" | "avg" => Ok(Self::Average),
            other => Err(format!("unknown resample method: {other}")),
        }
    }
}

/// Lazy row-major sequence of a raster's blocks.
pub type BlockIter = Box<dyn Iterator<Item = Result<(BlockOffset, Block), RasterError>> + Send>;

/// An open raster.
///
/// Single-block reads and writes are atomic with respect to the file; the
/// pipeline never relies on cross-block atomicity.
pub trait RasterHandle: Send + std::fmt::Debug {
    /// Metadata snapshot taken when the raster was opened.
    fn descriptor(&self) -> &RasterDescriptor;

    /// Sets the geotransform and spatial reference.
    fn set_georeference(
        &mut self,
        geotransform: Geotransform,
        srs_wkt: &str,
    ) -> Result<(), RasterError>;

    /// Fills every pixel of the band with `value`.
    fn fill(&mut self, value: f64) -> Result<(), RasterError>;

    /// Reads a pixel window. The window must lie fully inside the raster.
    fn read_block(
        &mut self,
        x_off: u32,
        y_off: u32,
        width: u32,
        height: u32,
    ) -> Result<Block, RasterError>;

    /// Writes a block at the given pixel offset.
    fn write_block(&mut self, block: &Block, x_off: u32, y_off: u32) -> Result<(), RasterError>;

    /// Builds a geometric overview pyramid at the given decimation levels.
    ///
    /// `progress` receives a completion fraction in `[0, 1]` as the build
    /// advances; the final call is always `1.0`.
    fn build_overviews(
        &mut self,
        levels: &[u32],
        resample: ResampleMethod,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), RasterError>;

    /// Flushes pending writes to durable storage.
    fn flush(&mut self) -> Result<(), RasterError>;
}

/// Factory capability over a raster format.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to use
/// from blocking worker threads.
pub trait RasterStore: Send + Sync + 'static {
    /// Creates a new single-band raster, initially georeferenced at the
    /// identity transform.
    fn create(
        &self,
        path: &Path,
        cols: u32,
        rows: u32,
        data_type: DataType,
        nodata: f64,
        block_shape: (u32, u32),
    ) -> Result<Box<dyn RasterHandle>, RasterError>;

    /// Opens an existing raster read-only.
    fn open(&self, path: &Path) -> Result<Box<dyn RasterHandle>, RasterError>;

    /// Opens an existing raster for in-place block writes.
    fn open_for_update(&self, path: &Path) -> Result<Box<dyn RasterHandle>, RasterError>;

    /// Queries metadata without holding the raster open.
    fn describe(&self, path: &Path) -> Result<RasterDescriptor, RasterError>;

    /// Returns a finite, restartable, row-major block iterator.
    fn block_iter(&self, path: &Path) -> Result<BlockIter, RasterError>;

    /// Copies a raster into the store's compressed tiled layout.
    ///
    /// The copy is pixel-identical to the source; only the on-disk layout
    /// changes. The result is read-only.
    fn create_compressed_copy(&self, source: &Path, target: &Path) -> Result<(), RasterError>;
}
