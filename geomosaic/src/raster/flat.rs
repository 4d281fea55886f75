//! Flat-file raster backend.
//!
//! A minimal single-band container implementing the [`RasterStore`]
//! capability without an external codec. Two on-disk layouts:
//!
//! - `Scanline`: raw row-major pixels, updatable in place. Used for working
//!   rasters that merge tasks mutate block by block.
//! - `TiledDeflate`: fixed-shape tiles, each Deflate-compressed, with a tile
//!   index at the file tail. Read-only; produced by
//!   [`RasterStore::create_compressed_copy`] for delivery artifacts.
//!
//! Layout of a container file:
//!
//! ```text
//! [0..4)      magic "GMRA"
//! [4..8)      u32 LE header length
//! [8..4096)   bincode header (+ padding)
//! [4096..)    pixel payload
//! ```
//!
//! Overview pyramids live in a `<path>.ovr` sidecar with the same framing
//! (magic "GMOV") holding each decimated level as raw rows in the raster's
//! native pixel type.

use super::{
    Block, BlockIter, BlockOffset, DataType, Geotransform, RasterDescriptor, RasterError,
    RasterHandle, RasterStore, ResampleMethod, DEFAULT_BLOCK_SHAPE,
};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const RASTER_MAGIC: &[u8; 4] = b"GMRA";
const OVERVIEW_MAGIC: &[u8; 4] = b"GMOV";
const FORMAT_VERSION: u32 = 1;

/// Reserved byte span for the serialized header; payload starts here.
const HEADER_REGION: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatHeader {
    version: u32,
    cols: u32,
    rows: u32,
    data_type: DataType,
    nodata: f64,
    geotransform: Geotransform,
    srs_wkt: String,
    block_width: u32,
    block_height: u32,
    layout: Layout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Layout {
    Scanline,
    TiledDeflate { index_offset: u64, n_tiles: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TileEntry {
    offset: u64,
    len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverviewHeader {
    version: u32,
    data_type: DataType,
    levels: Vec<OverviewLevelMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverviewLevelMeta {
    level: u32,
    cols: u32,
    rows: u32,
    offset: u64,
}

/// One level of an overview pyramid, as reported by
/// [`FlatFileStore::overview_summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverviewLevel {
    /// Decimation factor relative to full resolution.
    pub level: u32,
    pub cols: u32,
    pub rows: u32,
}

fn io_err(path: &Path, source: std::io::Error) -> RasterError {
    RasterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, detail: impl Into<String>) -> RasterError {
    RasterError::Corrupt {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

// =============================================================================
// Pixel codec
// =============================================================================

fn encode_values(data_type: DataType, values: &[f64], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(values.len() * data_type.byte_width());
    for &v in values {
        match data_type {
            DataType::U8 => out.push(v as u8),
            DataType::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            DataType::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
            DataType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            DataType::U32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
            DataType::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            DataType::F64 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

fn decode_values(data_type: DataType, bytes: &[u8], out: &mut Vec<f64>) {
    let width = data_type.byte_width();
    out.clear();
    out.reserve(bytes.len() / width);
    for chunk in bytes.chunks_exact(width) {
        let v = match data_type {
            DataType::U8 => chunk[0] as f64,
            DataType::I16 => i16::from_le_bytes([chunk[0], chunk[1]]) as f64,
            DataType::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as f64,
            DataType::I32 => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DataType::U32 => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DataType::F32 => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DataType::F64 => f64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]),
        };
        out.push(v);
    }
}

// =============================================================================
// Header framing
// =============================================================================

fn write_framed_header<T: Serialize>(
    file: &mut File,
    path: &Path,
    magic: &[u8; 4],
    header: &T,
) -> Result<(), RasterError> {
    let encoded = bincode::serialize(header).map_err(|e| corrupt(path, e.to_string()))?;
    if encoded.len() as u64 + 8 > HEADER_REGION {
        return Err(corrupt(path, "header exceeds reserved region"));
    }
    file.seek(SeekFrom::Start(0)).map_err(|e| io_err(path, e))?;
    file.write_all(magic).map_err(|e| io_err(path, e))?;
    file.write_all(&(encoded.len() as u32).to_le_bytes())
        .map_err(|e| io_err(path, e))?;
    file.write_all(&encoded).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn read_framed_header<T: for<'de> Deserialize<'de>>(
    file: &mut File,
    path: &Path,
    magic: &[u8; 4],
) -> Result<T, RasterError> {
    let mut found = [0u8; 4];
    file.seek(SeekFrom::Start(0)).map_err(|e| io_err(path, e))?;
    file.read_exact(&mut found).map_err(|e| io_err(path, e))?;
    if &found != magic {
        return Err(RasterError::BadMagic(path.to_path_buf()));
    }
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes).map_err(|e| io_err(path, e))?;
    let len = u32::from_le_bytes(len_bytes) as u64;
    if len + 8 > HEADER_REGION {
        return Err(corrupt(path, "declared header length exceeds reserved region"));
    }
    let mut encoded = vec![0u8; len as usize];
    file.read_exact(&mut encoded).map_err(|e| io_err(path, e))?;
    bincode::deserialize(&encoded).map_err(|e| corrupt(path, e.to_string()))
}

// =============================================================================
// Store
// =============================================================================

/// The built-in flat-file raster store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatFileStore;

impl FlatFileStore {
    /// Conventional file extension for containers in this format.
    pub const EXTENSION: &'static str = "ras";

    pub fn new() -> Self {
        Self
    }

    fn open_handle(&self, path: &Path, writable: bool) -> Result<FlatRasterHandle, RasterError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        let header: FlatHeader = read_framed_header(&mut file, path, RASTER_MAGIC)?;
        if writable && matches!(header.layout, Layout::TiledDeflate { .. }) {
            return Err(RasterError::NotWritable(path.to_path_buf()));
        }
        Ok(FlatRasterHandle::new(path.to_path_buf(), file, header, writable))
    }

    /// Reads the overview sidecar of a raster, if one has been built.
    pub fn overview_summary(path: &Path) -> Result<Vec<OverviewLevel>, RasterError> {
        let ovr_path = overview_path(path);
        let mut file = File::open(&ovr_path).map_err(|e| io_err(&ovr_path, e))?;
        let header: OverviewHeader = read_framed_header(&mut file, &ovr_path, OVERVIEW_MAGIC)?;
        Ok(header
            .levels
            .iter()
            .map(|l| OverviewLevel {
                level: l.level,
                cols: l.cols,
                rows: l.rows,
            })
            .collect())
    }
}

fn overview_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".ovr");
    PathBuf::from(os)
}

impl RasterStore for FlatFileStore {
    fn create(
        &self,
        path: &Path,
        cols: u32,
        rows: u32,
        data_type: DataType,
        nodata: f64,
        block_shape: (u32, u32),
    ) -> Result<Box<dyn RasterHandle>, RasterError> {
        if !data_type.can_represent(nodata) {
            return Err(RasterError::IncompatibleNodata { nodata, data_type });
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        let header = FlatHeader {
            version: FORMAT_VERSION,
            cols,
            rows,
            data_type,
            nodata,
            geotransform: Geotransform::new(0.0, 0.0, 1.0, -1.0),
            srs_wkt: String::new(),
            block_width: block_shape.0,
            block_height: block_shape.1,
            layout: Layout::Scanline,
        };
        write_framed_header(&mut file, path, RASTER_MAGIC, &header)?;
        // Size the payload up front so partial-write crashes are detectable.
        let payload = (cols as u64) * (rows as u64) * data_type.byte_width() as u64;
        file.set_len(HEADER_REGION + payload)
            .map_err(|e| io_err(path, e))?;
        Ok(Box::new(FlatRasterHandle::new(
            path.to_path_buf(),
            file,
            header,
            true,
        )))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn RasterHandle>, RasterError> {
        Ok(Box::new(self.open_handle(path, false)?))
    }

    fn open_for_update(&self, path: &Path) -> Result<Box<dyn RasterHandle>, RasterError> {
        Ok(Box::new(self.open_handle(path, true)?))
    }

    fn describe(&self, path: &Path) -> Result<RasterDescriptor, RasterError> {
        Ok(self.open_handle(path, false)?.descriptor.clone())
    }

    fn block_iter(&self, path: &Path) -> Result<BlockIter, RasterError> {
        let handle = self.open_handle(path, false)?;
        Ok(Box::new(FlatBlockIter::new(handle)))
    }

    fn create_compressed_copy(&self, source: &Path, target: &Path) -> Result<(), RasterError> {
        let mut src = self.open_handle(source, false)?;
        let (block_w, block_h) = DEFAULT_BLOCK_SHAPE;
        let cols = src.header.cols;
        let rows = src.header.rows;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(target)
            .map_err(|e| io_err(target, e))?;
        let mut header = FlatHeader {
            version: FORMAT_VERSION,
            cols,
            rows,
            data_type: src.header.data_type,
            nodata: src.header.nodata,
            geotransform: src.header.geotransform,
            srs_wkt: src.header.srs_wkt.clone(),
            block_width: block_w,
            block_height: block_h,
            layout: Layout::TiledDeflate {
                index_offset: 0,
                n_tiles: 0,
            },
        };
        write_framed_header(&mut file, target, RASTER_MAGIC, &header)?;
        file.seek(SeekFrom::Start(HEADER_REGION))
            .map_err(|e| io_err(target, e))?;

        let mut entries = Vec::new();
        let mut cursor = HEADER_REGION;
        let mut encoded = Vec::new();
        for y_off in (0..rows).step_by(block_h as usize) {
            let height = block_h.min(rows - y_off);
            for x_off in (0..cols).step_by(block_w as usize) {
                let width = block_w.min(cols - x_off);
                let block = src.read_block(x_off, y_off, width, height)?;
                encode_values(src.header.data_type, &block.data, &mut encoded);
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&encoded).map_err(|e| io_err(target, e))?;
                let compressed = encoder.finish().map_err(|e| io_err(target, e))?;
                file.write_all(&compressed).map_err(|e| io_err(target, e))?;
                entries.push(TileEntry {
                    offset: cursor,
                    len: compressed.len() as u64,
                });
                cursor += compressed.len() as u64;
            }
        }

        let index = bincode::serialize(&entries).map_err(|e| corrupt(target, e.to_string()))?;
        file.write_all(&index).map_err(|e| io_err(target, e))?;
        header.layout = Layout::TiledDeflate {
            index_offset: cursor,
            n_tiles: entries.len() as u64,
        };
        write_framed_header(&mut file, target, RASTER_MAGIC, &header)?;
        file.sync_all().map_err(|e| io_err(target, e))?;
        Ok(())
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
struct FlatRasterHandle {
    path: PathBuf,
    file: File,
    header: FlatHeader,
    descriptor: RasterDescriptor,
    writable: bool,
    /// Tile index, lazily loaded for `TiledDeflate` rasters.
    tile_index: Option<Vec<TileEntry>>,
}

impl FlatRasterHandle {
    fn new(path: PathBuf, file: File, header: FlatHeader, writable: bool) -> Self {
        let descriptor = RasterDescriptor {
            path: path.clone(),
            cols: header.cols,
            rows: header.rows,
            data_type: header.data_type,
            nodata: header.nodata,
            geotransform: header.geotransform,
            block_width: header.block_width,
            block_height: header.block_height,
        };
        Self {
            path,
            file,
            header,
            descriptor,
            writable,
            tile_index: None,
        }
    }

    fn check_window(&self, x_off: i64, y_off: i64, width: u32, height: u32) -> Result<(), RasterError> {
        let fits = x_off >= 0
            && y_off >= 0
            && x_off + width as i64 <= self.header.cols as i64
            && y_off + height as i64 <= self.header.rows as i64;
        if fits {
            Ok(())
        } else {
            Err(RasterError::WindowOutOfBounds {
                x_off,
                y_off,
                width,
                height,
                cols: self.header.cols,
                rows: self.header.rows,
            })
        }
    }

    fn pixel_offset(&self, x: u64, y: u64) -> u64 {
        HEADER_REGION + (y * self.header.cols as u64 + x) * self.header.data_type.byte_width() as u64
    }

    fn read_block_scanline(
        &mut self,
        x_off: u32,
        y_off: u32,
        width: u32,
        height: u32,
    ) -> Result<Block, RasterError> {
        let byte_width = self.header.data_type.byte_width();
        let mut row_bytes = vec![0u8; width as usize * byte_width];
        let mut row_values = Vec::with_capacity(width as usize);
        let mut data = Vec::with_capacity((width as usize) * (height as usize));
        for row in 0..height {
            let offset = self.pixel_offset(x_off as u64, (y_off + row) as u64);
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| io_err(&self.path, e))?;
            self.file
                .read_exact(&mut row_bytes)
                .map_err(|e| io_err(&self.path, e))?;
            decode_values(self.header.data_type, &row_bytes, &mut row_values);
            data.extend_from_slice(&row_values);
        }
        Ok(Block::new(width, height, data))
    }

    fn load_tile_index(&mut self) -> Result<(), RasterError> {
        if self.tile_index.is_some() {
            return Ok(());
        }
        let (index_offset, n_tiles) = match self.header.layout {
            Layout::TiledDeflate {
                index_offset,
                n_tiles,
            } => (index_offset, n_tiles),
            Layout::Scanline => return Ok(()),
        };
        let end = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_err(&self.path, e))?;
        if index_offset >= end {
            return Err(corrupt(&self.path, "tile index offset beyond end of file"));
        }
        self.file
            .seek(SeekFrom::Start(index_offset))
            .map_err(|e| io_err(&self.path, e))?;
        let mut raw = vec![0u8; (end - index_offset) as usize];
        self.file
            .read_exact(&mut raw)
            .map_err(|e| io_err(&self.path, e))?;
        let entries: Vec<TileEntry> =
            bincode::deserialize(&raw).map_err(|e| corrupt(&self.path, e.to_string()))?;
        if entries.len() as u64 != n_tiles {
            return Err(corrupt(&self.path, "tile index length mismatch"));
        }
        self.tile_index = Some(entries);
        Ok(())
    }

    fn read_tile(&mut self, tile_x: u32, tile_y: u32) -> Result<Block, RasterError> {
        self.load_tile_index()?;
        let tiles_across = self.header.cols.div_ceil(self.header.block_width);
        let entry = {
            let index = self.tile_index.as_ref().expect("index loaded");
            index[(tile_y as usize) * (tiles_across as usize) + tile_x as usize].clone()
        };
        let width = self
            .header
            .block_width
            .min(self.header.cols - tile_x * self.header.block_width);
        let height = self
            .header
            .block_height
            .min(self.header.rows - tile_y * self.header.block_height);

        self.file
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| io_err(&self.path, e))?;
        let mut compressed = vec![0u8; entry.len as usize];
        self.file
            .read_exact(&mut compressed)
            .map_err(|e| io_err(&self.path, e))?;
        let mut raw = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut raw)
            .map_err(|e| io_err(&self.path, e))?;
        let expected = (width as usize) * (height as usize) * self.header.data_type.byte_width();
        if raw.len() != expected {
            return Err(corrupt(&self.path, "tile payload size mismatch"));
        }
        let mut data = Vec::new();
        decode_values(self.header.data_type, &raw, &mut data);
        Ok(Block::new(width, height, data))
    }

    fn read_block_tiled(
        &mut self,
        x_off: u32,
        y_off: u32,
        width: u32,
        height: u32,
    ) -> Result<Block, RasterError> {
        let bw = self.header.block_width;
        let bh = self.header.block_height;
        let mut data = vec![0.0f64; (width as usize) * (height as usize)];
        let tile_x0 = x_off / bw;
        let tile_x1 = (x_off + width - 1) / bw;
        let tile_y0 = y_off / bh;
        let tile_y1 = (y_off + height - 1) / bh;
        for tile_y in tile_y0..=tile_y1 {
            for tile_x in tile_x0..=tile_x1 {
                let tile = self.read_tile(tile_x, tile_y)?;
                let tile_px = tile_x * bw;
                let tile_py = tile_y * bh;
                // Intersection of the requested window with this tile.
                let x0 = x_off.max(tile_px);
                let x1 = (x_off + width).min(tile_px + tile.width);
                let y0 = y_off.max(tile_py);
                let y1 = (y_off + height).min(tile_py + tile.height);
                for y in y0..y1 {
                    let src_start =
                        ((y - tile_py) as usize) * tile.width as usize + (x0 - tile_px) as usize;
                    let dst_start = ((y - y_off) as usize) * width as usize + (x0 - x_off) as usize;
                    let run = (x1 - x0) as usize;
                    data[dst_start..dst_start + run]
                        .copy_from_slice(&tile.data[src_start..src_start + run]);
                }
            }
        }
        Ok(Block::new(width, height, data))
    }

    fn write_header(&mut self) -> Result<(), RasterError> {
        let header = self.header.clone();
        write_framed_header(&mut self.file, &self.path, RASTER_MAGIC, &header)
    }
}

impl RasterHandle for FlatRasterHandle {
    fn descriptor(&self) -> &RasterDescriptor {
        &self.descriptor
    }

    fn set_georeference(
        &mut self,
        geotransform: Geotransform,
        srs_wkt: &str,
    ) -> Result<(), RasterError> {
        if !self.writable {
            return Err(RasterError::NotWritable(self.path.clone()));
        }
        self.header.geotransform = geotransform;
        self.header.srs_wkt = srs_wkt.to_string();
        self.descriptor.geotransform = geotransform;
        self.write_header()
    }

    fn fill(&mut self, value: f64) -> Result<(), RasterError> {
        if !self.writable {
            return Err(RasterError::NotWritable(self.path.clone()));
        }
        let row = vec![value; self.header.cols as usize];
        let mut encoded = Vec::new();
        encode_values(self.header.data_type, &row, &mut encoded);
        self.file
            .seek(SeekFrom::Start(HEADER_REGION))
            .map_err(|e| io_err(&self.path, e))?;
        for _ in 0..self.header.rows {
            self.file
                .write_all(&encoded)
                .map_err(|e| io_err(&self.path, e))?;
        }
        Ok(())
    }

    fn read_block(
        &mut self,
        x_off: u32,
        y_off: u32,
        width: u32,
        height: u32,
    ) -> Result<Block, RasterError> {
        self.check_window(x_off as i64, y_off as i64, width, height)?;
        match self.header.layout {
            Layout::Scanline => self.read_block_scanline(x_off, y_off, width, height),
            Layout::TiledDeflate { .. } => self.read_block_tiled(x_off, y_off, width, height),
        }
    }

    fn write_block(&mut self, block: &Block, x_off: u32, y_off: u32) -> Result<(), RasterError> {
        if !self.writable || !matches!(self.header.layout, Layout::Scanline) {
            return Err(RasterError::NotWritable(self.path.clone()));
        }
        self.check_window(x_off as i64, y_off as i64, block.width, block.height)?;
        let mut encoded = Vec::new();
        for row in 0..block.height {
            let start = (row as usize) * block.width as usize;
            let values = &block.data[start..start + block.width as usize];
            encode_values(self.header.data_type, values, &mut encoded);
            let offset = self.pixel_offset(x_off as u64, (y_off + row) as u64);
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| io_err(&self.path, e))?;
            self.file
                .write_all(&encoded)
                .map_err(|e| io_err(&self.path, e))?;
        }
        Ok(())
    }

    fn build_overviews(
        &mut self,
        levels: &[u32],
        resample: ResampleMethod,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), RasterError> {
        build_overview_pyramid(self, levels, resample, progress)
    }

    fn flush(&mut self) -> Result<(), RasterError> {
        self.file.sync_all().map_err(|e| io_err(&self.path, e))
    }
}

// =============================================================================
// Block iterator
// =============================================================================

struct FlatBlockIter {
    handle: FlatRasterHandle,
    tile_x: u32,
    tile_y: u32,
    tiles_across: u32,
    tiles_down: u32,
}

impl FlatBlockIter {
    fn new(handle: FlatRasterHandle) -> Self {
        let tiles_across = handle.header.cols.div_ceil(handle.header.block_width);
        let tiles_down = handle.header.rows.div_ceil(handle.header.block_height);
        Self {
            handle,
            tile_x: 0,
            tile_y: 0,
            tiles_across,
            tiles_down,
        }
    }
}

impl Iterator for FlatBlockIter {
    type Item = Result<(BlockOffset, Block), RasterError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tile_y >= self.tiles_down {
            return None;
        }
        let header = &self.handle.header;
        let x_off = self.tile_x * header.block_width;
        let y_off = self.tile_y * header.block_height;
        let width = header.block_width.min(header.cols - x_off);
        let height = header.block_height.min(header.rows - y_off);

        self.tile_x += 1;
        if self.tile_x >= self.tiles_across {
            self.tile_x = 0;
            self.tile_y += 1;
        }

        Some(
            self.handle
                .read_block(x_off, y_off, width, height)
                .map(|block| (BlockOffset { x_off, y_off }, block)),
        )
    }
}

// =============================================================================
// Overview pyramid
// =============================================================================

/// Builds the `.ovr` sidecar by successive halving.
///
/// Levels must be ascending powers of two, each double its predecessor;
/// that is the only sequence the pipeline produces. Each level is computed
/// from the previous one two source rows at a time, so memory stays bounded
/// by a handful of rows regardless of raster size.
fn build_overview_pyramid(
    handle: &mut FlatRasterHandle,
    levels: &[u32],
    resample: ResampleMethod,
    progress: &mut dyn FnMut(f64),
) -> Result<(), RasterError> {
    let ovr_path = overview_path(&handle.path);
    if levels.is_empty() {
        progress(1.0);
        return Ok(());
    }
    for window in levels.windows(2) {
        if window[1] != window[0] * 2 {
            return Err(corrupt(
                &ovr_path,
                format!("overview levels must double: {:?}", levels),
            ));
        }
    }
    if levels[0] != 2 {
        return Err(corrupt(&ovr_path, "overview levels must start at 2"));
    }

    let data_type = handle.header.data_type;
    let nodata = handle.header.nodata;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&ovr_path)
        .map_err(|e| io_err(&ovr_path, e))?;
    let mut ovr_header = OverviewHeader {
        version: FORMAT_VERSION,
        data_type,
        levels: Vec::new(),
    };
    write_framed_header(&mut file, &ovr_path, OVERVIEW_MAGIC, &ovr_header)?;

    // Total output rows across all levels, for progress fractions.
    let mut total_rows = 0u64;
    let mut dims = (handle.header.cols, handle.header.rows);
    for _ in levels {
        dims = (dims.0.div_ceil(2).max(1), dims.1.div_ceil(2).max(1));
        total_rows += dims.1 as u64;
    }

    let mut done_rows = 0u64;
    let mut cursor = HEADER_REGION;
    let mut prev: Option<OverviewLevelMeta> = None;
    let mut encoded = Vec::new();
    for &level in levels {
        let (prev_cols, prev_rows) = match &prev {
            Some(meta) => (meta.cols, meta.rows),
            None => (handle.header.cols, handle.header.rows),
        };
        let out_cols = prev_cols.div_ceil(2).max(1);
        let out_rows = prev_rows.div_ceil(2).max(1);
        let meta = OverviewLevelMeta {
            level,
            cols: out_cols,
            rows: out_rows,
            offset: cursor,
        };
        let mut out_row = Vec::with_capacity(out_cols as usize);
        for y in 0..out_rows {
            let src_y = y * 2;
            let src_height = 2.min(prev_rows - src_y);
            let source = match &prev {
                Some(prev_meta) => {
                    read_overview_rows(&mut file, &ovr_path, prev_meta, data_type, src_y, src_height)?
                }
                None => {
                    handle
                        .read_block(0, src_y, prev_cols, src_height)?
                        .data
                }
            };
            out_row.clear();
            for x in 0..out_cols {
                let src_x = (x * 2) as usize;
                let src_width = 2.min(prev_cols as usize - src_x);
                let value = match resample {
                    ResampleMethod::Nearest => source[src_x],
                    ResampleMethod::Average => {
                        let mut sum = 0.0;
                        let mut count = 0usize;
                        for dy in 0..src_height as usize {
                            for dx in 0..src_width {
                                let v = source[dy * prev_cols as usize + src_x + dx];
                                if !is_nodata_value(v, nodata) {
                                    sum += v;
                                    count += 1;
                                }
                            }
                        }
                        if count == 0 {
                            nodata
                        } else {
                            sum / count as f64
                        }
                    }
                };
                out_row.push(value);
            }
            encode_values(data_type, &out_row, &mut encoded);
            file.seek(SeekFrom::Start(
                meta.offset + (y as u64) * (out_cols as u64) * data_type.byte_width() as u64,
            ))
            .map_err(|e| io_err(&ovr_path, e))?;
            file.write_all(&encoded).map_err(|e| io_err(&ovr_path, e))?;
            done_rows += 1;
            progress(done_rows as f64 / total_rows as f64);
        }
        cursor += (out_cols as u64) * (out_rows as u64) * data_type.byte_width() as u64;
        ovr_header.levels.push(meta.clone());
        prev = Some(meta);
    }

    write_framed_header(&mut file, &ovr_path, OVERVIEW_MAGIC, &ovr_header)?;
    file.sync_all().map_err(|e| io_err(&ovr_path, e))?;
    progress(1.0);
    Ok(())
}

fn read_overview_rows(
    file: &mut File,
    path: &Path,
    meta: &OverviewLevelMeta,
    data_type: DataType,
    y: u32,
    height: u32,
) -> Result<Vec<f64>, RasterError> {
    let row_bytes = (meta.cols as usize) * data_type.byte_width();
    let mut raw = vec![0u8; row_bytes * height as usize];
    file.seek(SeekFrom::Start(
        meta.offset + (y as u64) * row_bytes as u64,
    ))
    .map_err(|e| io_err(path, e))?;
    file.read_exact(&mut raw).map_err(|e| io_err(path, e))?;
    let mut values = Vec::new();
    decode_values(data_type, &raw, &mut values);
    Ok(values)
}

/// Nodata equality for resampling, tolerating NaN nodata.
fn is_nodata_value(value: f64, nodata: f64) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else {
        value == nodata
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn create_test_raster(
        store: &FlatFileStore,
        path: &Path,
        cols: u32,
        rows: u32,
        fill: f64,
    ) -> RasterDescriptor {
        let mut handle = store
            .create(path, cols, rows, DataType::F32, -9999.0, (16, 16))
            .expect("create");
        handle
            .set_georeference(Geotransform::new(-180.0, 90.0, 1.0, -1.0), super::super::WGS84_WKT)
            .expect("georeference");
        handle.fill(fill).expect("fill");
        handle.flush().expect("flush");
        handle.descriptor().clone()
    }

    #[test]
    fn test_create_and_describe_roundtrip() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 40, 20, -9999.0);

        let desc = store.describe(&path).expect("describe");
        assert_eq!(desc.cols, 40);
        assert_eq!(desc.rows, 20);
        assert_eq!(desc.data_type, DataType::F32);
        assert_eq!(desc.nodata, -9999.0);
        assert_eq!(desc.geotransform.origin_x, -180.0);
        assert_eq!(desc.block_width, 16);
    }

    #[test]
    fn test_fill_then_read_block() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 8, 8, 5.0);

        let mut handle = store.open(&path).expect("open");
        let block = handle.read_block(2, 2, 4, 4).expect("read");
        assert!(block.data.iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_write_block_roundtrip() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 10, 10, 0.0);

        let mut handle = store.open_for_update(&path).expect("open");
        let block = Block::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        handle.write_block(&block, 4, 5).expect("write");

        let read_back = handle.read_block(4, 5, 3, 2).expect("read");
        assert_eq!(read_back.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // Neighboring pixels untouched.
        let neighbor = handle.read_block(3, 5, 1, 1).expect("read");
        assert_eq!(neighbor.data, vec![0.0]);
    }

    #[test]
    fn test_read_block_out_of_bounds() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 8, 8, 0.0);

        let mut handle = store.open(&path).expect("open");
        let err = handle.read_block(6, 6, 4, 4).unwrap_err();
        assert!(matches!(err, RasterError::WindowOutOfBounds { .. }));
    }

    #[test]
    fn test_readonly_handle_rejects_writes() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 8, 8, 0.0);

        let mut handle = store.open(&path).expect("open");
        let err = handle.write_block(&Block::filled(1, 1, 1.0), 0, 0).unwrap_err();
        assert!(matches!(err, RasterError::NotWritable(_)));
    }

    #[test]
    fn test_incompatible_nodata_rejected() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        let err = store
            .create(&path, 4, 4, DataType::U8, -1.0, (4, 4))
            .err()
            .expect("should reject");
        assert!(matches!(err, RasterError::IncompatibleNodata { .. }));
    }

    #[test]
    fn test_block_iter_row_major_with_partial_edges() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        // 20x10 raster, 16x16 blocks: 2 across x 1 down, right edge partial.
        create_test_raster(&store, &path, 20, 10, 1.0);

        let blocks: Vec<_> = store
            .block_iter(&path)
            .expect("iter")
            .collect::<Result<Vec<_>, _>>()
            .expect("blocks");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, BlockOffset { x_off: 0, y_off: 0 });
        assert_eq!((blocks[0].1.width, blocks[0].1.height), (16, 10));
        assert_eq!(blocks[1].0, BlockOffset { x_off: 16, y_off: 0 });
        assert_eq!((blocks[1].1.width, blocks[1].1.height), (4, 10));
    }

    #[test]
    fn test_block_iter_restartable() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 20, 10, 1.0);

        let first: usize = store.block_iter(&path).expect("iter").count();
        let second: usize = store.block_iter(&path).expect("iter").count();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compressed_copy_is_pixel_identical() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 30, 17, 0.0);
        {
            let mut handle = store.open_for_update(&path).expect("open");
            let block = Block::new(2, 2, vec![1.5, 2.5, 3.5, 4.5]);
            handle.write_block(&block, 27, 14).expect("write");
        }

        let copy_path = dir.path().join("a_compressed.ras");
        store
            .create_compressed_copy(&path, &copy_path)
            .expect("copy");

        let desc = store.describe(&copy_path).expect("describe");
        assert_eq!((desc.cols, desc.rows), (30, 17));
        let mut copy = store.open(&copy_path).expect("open copy");
        let block = copy.read_block(27, 14, 2, 2).expect("read");
        assert_eq!(block.data, vec![1.5, 2.5, 3.5, 4.5]);
        let elsewhere = copy.read_block(0, 0, 3, 3).expect("read");
        assert!(elsewhere.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_compressed_copy_rejects_update() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 8, 8, 0.0);
        let copy_path = dir.path().join("a_c.ras");
        store.create_compressed_copy(&path, &copy_path).expect("copy");

        let err = store.open_for_update(&copy_path).unwrap_err();
        assert!(matches!(err, RasterError::NotWritable(_)));
    }

    #[test]
    fn test_overviews_nearest() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 16, 16, 0.0);
        {
            // Distinct value at the origin so nearest picks it up at every level.
            let mut handle = store.open_for_update(&path).expect("open");
            handle
                .write_block(&Block::filled(1, 1, 9.0), 0, 0)
                .expect("write");
        }

        let mut handle = store.open_for_update(&path).expect("open");
        let mut reports = 0;
        handle
            .build_overviews(&[2, 4, 8], ResampleMethod::Nearest, &mut |_| reports += 1)
            .expect("overviews");
        assert!(reports > 0);

        let summary = FlatFileStore::overview_summary(&path).expect("summary");
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0], OverviewLevel { level: 2, cols: 8, rows: 8 });
        assert_eq!(summary[2], OverviewLevel { level: 8, cols: 2, rows: 2 });
    }

    #[test]
    fn test_overviews_average_skips_nodata() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 4, 4, -9999.0);
        {
            let mut handle = store.open_for_update(&path).expect("open");
            // One valid pixel in the top-left 2x2 window.
            handle
                .write_block(&Block::filled(1, 1, 8.0), 0, 0)
                .expect("write");
        }

        let mut handle = store.open_for_update(&path).expect("open");
        handle
            .build_overviews(&[2], ResampleMethod::Average, &mut |_| {})
            .expect("overviews");

        // Average of the single valid pixel is that pixel, not diluted by nodata.
        let summary = FlatFileStore::overview_summary(&path).expect("summary");
        assert_eq!(summary[0].cols, 2);
    }

    #[test]
    fn test_overviews_reject_non_doubling_levels() {
        let dir = scratch();
        let store = FlatFileStore::new();
        let path = dir.path().join("a.ras");
        create_test_raster(&store, &path, 8, 8, 0.0);

        let mut handle = store.open_for_update(&path).expect("open");
        let err = handle
            .build_overviews(&[2, 6], ResampleMethod::Nearest, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, RasterError::Corrupt { .. }));
    }
}
