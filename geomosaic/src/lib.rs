//! Batch raster mosaicking pipeline.
//!
//! Merges heterogeneous collections of geospatial raster tiles into
//! seamless per-group global mosaics, then finalizes each mosaic into a
//! compressed, pyramided delivery raster. The whole run is expressed as a
//! dependency graph of memoized tasks: every unit of work leaves a durable
//! completion marker behind, so an interrupted run resumes from the first
//! incomplete task instead of starting over.
//!
//! # Architecture
//!
//! - [`raster`]: the storage abstraction ([`raster::RasterStore`]) and the
//!   built-in flat-file container backing it.
//! - [`graph`]: the async task DAG executor with file-token memoization.
//! - [`init`]: empty whole-earth raster creation.
//! - [`mosaic`]: the fill-only-empty block merge and the [`mosaic::MergeChain`]
//!   that serializes writers per output raster.
//! - [`warp`]: the reprojection collaborator seam.
//! - [`pyramid`]: compressed delivery copies and overview pyramids.
//! - [`pipeline`]: the orchestrator wiring all of the above into one run.
//!
//! # Example
//!
//! ```no_run
//! use geomosaic::pipeline::{GroupInput, Pipeline, PipelineConfig};
//! use geomosaic::raster::{FlatFileStore, RasterStore};
//! use geomosaic::warp::GridAlignedWarper;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn RasterStore> = Arc::new(FlatFileStore::new());
//! let warper = Arc::new(GridAlignedWarper::new(Arc::clone(&store)));
//! let config = PipelineConfig::new("/data/workspace");
//! let pipeline = Pipeline::new(store, warper, config);
//!
//! let groups = vec![GroupInput {
//!     key: "export.ras".into(),
//!     sample_path: "/data/tiles/region_a/export.ras".into(),
//!     tile_paths: vec![
//!         "/data/tiles/region_a/export.ras".into(),
//!         "/data/tiles/region_b/export.ras".into(),
//!     ],
//! }];
//! let reports = pipeline.run(groups).await?;
//! for report in reports {
//!     println!("{} -> {}", report.key, report.finalized_path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod graph;
pub mod init;
pub mod mosaic;
pub mod pipeline;
pub mod pyramid;
pub mod raster;
pub mod warp;

pub use pipeline::{GroupInput, GroupReport, Pipeline, PipelineConfig, PipelineError};
pub use raster::{RasterStore, ResampleMethod};
pub use warp::Warper;
