//! Command-line front end for the mosaicking pipeline.

mod discover;
mod logging;

use clap::Parser;
use geomosaic::pipeline::{
    Pipeline, PipelineConfig, PipelineError, DEFAULT_CELL_SIZE_DEGREES, DEFAULT_N_WORKERS,
};
use geomosaic::raster::{FlatFileStore, RasterStore, ResampleMethod};
use geomosaic::warp::GridAlignedWarper;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Mosaic disjoint raster tiles into seamless global rasters.
///
/// Walks the leaf directories of the input tree, groups tiles by filename
/// suffix, and merges each group into one compressed, pyramided global
/// raster in the workspace. Interrupted runs resume where they left off.
#[derive(Debug, Parser)]
#[command(name = "geomosaic", version)]
struct Cli {
    /// Directory tree whose leaf directories hold the raster tiles.
    #[arg(long)]
    input_dir: PathBuf,

    /// Workspace directory for outputs, tokens, and the session log.
    #[arg(long)]
    workspace: PathBuf,

    /// Filename suffix identifying one output group; repeatable.
    #[arg(long = "suffix", required = true)]
    suffixes: Vec<String>,

    /// Output cell size in degrees.
    #[arg(long, default_value_t = DEFAULT_CELL_SIZE_DEGREES)]
    cell_size: f64,

    /// Worker pool cap.
    #[arg(long, default_value_t = DEFAULT_N_WORKERS)]
    workers: usize,

    /// Scheduler reconcile interval in seconds.
    #[arg(long, default_value_t = 5)]
    update_interval: u64,

    /// Resample method: nearest or average.
    #[arg(long, default_value = "nearest", value_parser = parse_resample)]
    resample: ResampleMethod,
}

fn parse_resample(value: &str) -> Result<ResampleMethod, String> {
    value
        .parse()
        .map_err(|_| format!("unknown resample method '{value}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match logging::init(&cli.workspace) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!(
                "cannot open session log in {}: {err}",
                cli.workspace.display()
            );
            return ExitCode::FAILURE;
        }
    };

    info!(
        input_dir = %cli.input_dir.display(),
        workspace = %cli.workspace.display(),
        suffixes = ?cli.suffixes,
        cell_size = cli.cell_size,
        workers = cli.workers,
        "starting mosaic run"
    );

    let groups = match discover::discover_groups(&cli.input_dir, &cli.suffixes) {
        Ok(groups) => groups,
        Err(err) => {
            error!(error = %err, "tile discovery failed");
            return ExitCode::FAILURE;
        }
    };
    for group in &groups {
        info!(group = %group.key, tiles = group.tile_paths.len(), "discovered group");
    }

    let store: Arc<dyn RasterStore> = Arc::new(FlatFileStore::new());
    let warper = Arc::new(GridAlignedWarper::new(Arc::clone(&store)));
    let config = PipelineConfig {
        workspace_dir: cli.workspace,
        cell_size: cli.cell_size,
        n_workers: cli.workers,
        update_interval: Duration::from_secs(cli.update_interval),
        resample: cli.resample,
    };
    let pipeline = Pipeline::new(store, warper, config);

    match pipeline.run(groups).await {
        Ok(reports) => {
            for report in &reports {
                info!(
                    group = %report.key,
                    tiles = report.tiles,
                    output = %report.finalized_path.display(),
                    "group complete"
                );
            }
            info!(groups = reports.len(), "mosaic run complete");
            ExitCode::SUCCESS
        }
        Err(PipelineError::GroupsFailed { reports }) => {
            for report in &reports {
                match &report.failure {
                    Some(reason) => error!(group = %report.key, %reason, "group failed"),
                    None => info!(
                        group = %report.key,
                        output = %report.finalized_path.display(),
                        "group complete"
                    ),
                }
            }
            error!("mosaic run finished with failures");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "mosaic run aborted");
            ExitCode::FAILURE
        }
    }
}
