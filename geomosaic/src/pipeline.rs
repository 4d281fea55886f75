//! Pipeline orchestration: building and driving the task DAG.
//!
//! The orchestrator turns a pre-resolved `{group key -> tile paths}`
//! mapping into a task DAG:
//!
//! ```text
//! per group:   init ──► (warp ── merge) ──► (warp ── merge) ──► ...
//!                         tile 1             tile 2
//!              merges chained: single writer per output raster
//! barrier      join ── every chain drained
//! per group:   finalize (compressed copy + overview pyramid)
//! barrier      join ── all delivery artifacts written
//! ```
//!
//! Warps run in parallel across groups and tiles up to the worker cap;
//! merges into one raster are serialized by their [`MergeChain`]. A failed
//! task cancels the rest of its group's chain but never touches sibling
//! groups. Completion tokens make the whole construction resumable: a rerun
//! re-derives the same DAG and skips everything already done.

use crate::graph::{GraphError, TaskError, TaskGraph, TaskId, TaskSpec};
use crate::init;
use crate::mosaic::{self, MergeChain};
use crate::pyramid;
use crate::raster::{RasterStore, ResampleMethod, WGS84_WKT};
use crate::warp::Warper;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Mosaic cell size in degrees: 300 m pixels, with a degree spanning
/// 110570 m at the equator.
pub const DEFAULT_CELL_SIZE_DEGREES: f64 = 300.0 / 110_570.0;

/// Default worker cap, clamped further by available parallelism.
pub const DEFAULT_N_WORKERS: usize = 8;

/// Default scheduler reconcile interval.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory receiving output rasters, tokens, and delivery artifacts.
    pub workspace_dir: PathBuf,
    /// Target cell size in degrees.
    pub cell_size: f64,
    /// Worker pool cap.
    pub n_workers: usize,
    /// Scheduler reconcile interval.
    pub update_interval: Duration,
    /// Resample method for warps and overview pyramids.
    pub resample: ResampleMethod,
}

impl PipelineConfig {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            cell_size: DEFAULT_CELL_SIZE_DEGREES,
            n_workers: DEFAULT_N_WORKERS,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            resample: ResampleMethod::Nearest,
        }
    }
}

/// One output group: all tiles sharing a naming suffix, destined for one
/// mosaicked global raster.
///
/// Discovery is an external collaborator; the pipeline consumes only this
/// pre-resolved form and assumes no traversal order beyond the tile order
/// given here, which fixes the merge chain order.
#[derive(Debug, Clone)]
pub struct GroupInput {
    /// Group key; also the output raster's file name within the workspace.
    pub key: String,
    /// Canonical tile used to infer nodata and pixel data type before any
    /// output exists.
    pub sample_path: PathBuf,
    /// Every tile to merge, in chain order.
    pub tile_paths: Vec<PathBuf>,
}

/// Outcome for one output group.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub key: String,
    /// The mutable working mosaic.
    pub raster_path: PathBuf,
    /// The compressed, pyramided delivery raster.
    pub finalized_path: PathBuf,
    /// Number of tiles scheduled into the group's merge chain.
    pub tiles: usize,
    /// First failure recorded for the group, if any. A failed group keeps
    /// its partial raster on disk; the absent finalized artifact is what
    /// signals incompleteness downstream.
    pub failure: Option<String>,
}

impl GroupReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Errors from pipeline construction and execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Precondition violation; nothing was scheduled.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Scheduler misuse (submission after close, bad dependency).
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// One or more groups did not reach a finalized output.
    #[error("{} of {} group(s) failed", reports.iter().filter(|r| !r.succeeded()).count(), reports.len())]
    GroupsFailed { reports: Vec<GroupReport> },
}

/// The batch mosaicking pipeline.
pub struct Pipeline {
    store: Arc<dyn RasterStore>,
    warper: Arc<dyn Warper>,
    config: PipelineConfig,
}

struct GroupPlan {
    key: String,
    raster_path: PathBuf,
    finalized_path: PathBuf,
    chain: MergeChain,
    task_ids: Vec<TaskId>,
    finalize_task: Option<TaskId>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RasterStore>,
        warper: Arc<dyn Warper>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            warper,
            config,
        }
    }

    /// Runs the full pipeline over the given groups.
    ///
    /// Returns per-group reports on success; fails with
    /// [`PipelineError::GroupsFailed`] (still carrying every report) when
    /// any group's chain or finalization failed. Reruns after a partial
    /// failure resume from the first incomplete task.
    pub async fn run(&self, groups: Vec<GroupInput>) -> Result<Vec<GroupReport>, PipelineError> {
        self.validate(&groups)?;
        std::fs::create_dir_all(&self.config.workspace_dir)
            .map_err(|e| PipelineError::Configuration(format!("cannot create workspace: {e}")))?;

        let graph = TaskGraph::new(self.config.n_workers, self.config.update_interval);
        let mut plans = self.submit_mosaic_phase(&graph, groups)?;

        // Compression reads each raster whole; it must not race a merge.
        let merge_outcome = graph.join().await;
        if let Err(err) = &merge_outcome {
            info!(error = %err, "merge phase finished with failures");
        }

        self.submit_finalize_phase(&graph, &mut plans)?;
        let _ = graph.join().await;
        let _ = graph.close().await;

        let reports: Vec<GroupReport> = plans
            .into_iter()
            .map(|plan| {
                let failure = plan
                    .task_ids
                    .iter()
                    .chain(plan.finalize_task.iter())
                    .find_map(|id| graph.task_failure(*id))
                    .or_else(|| {
                        plan.finalize_task
                            .is_none()
                            .then(|| "merge chain did not complete".to_string())
                    });
                GroupReport {
                    key: plan.key,
                    raster_path: plan.raster_path,
                    finalized_path: plan.finalized_path,
                    tiles: plan.chain.len(),
                    failure,
                }
            })
            .collect();

        if reports.iter().all(GroupReport::succeeded) {
            Ok(reports)
        } else {
            Err(PipelineError::GroupsFailed { reports })
        }
    }

    /// Fails fast on precondition violations, before any task is scheduled.
    fn validate(&self, groups: &[GroupInput]) -> Result<(), PipelineError> {
        if groups.is_empty() {
            return Err(PipelineError::Configuration("no output groups".into()));
        }
        if !(self.config.cell_size > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "invalid cell size {}",
                self.config.cell_size
            )));
        }
        for group in groups {
            if group.tile_paths.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "no tiles for group '{}'",
                    group.key
                )));
            }
            if !group.sample_path.is_file() {
                return Err(PipelineError::Configuration(format!(
                    "expected sample tile for '{}' at {} but not found",
                    group.key,
                    group.sample_path.display()
                )));
            }
            for tile in &group.tile_paths {
                if !tile.is_file() {
                    return Err(PipelineError::Configuration(format!(
                        "expected tile for '{}' at {} but not found",
                        group.key,
                        tile.display()
                    )));
                }
            }
            // An unreadable sample is a precondition violation too; fail
            // here rather than after sibling groups have been scheduled.
            self.store.describe(&group.sample_path).map_err(|e| {
                PipelineError::Configuration(format!(
                    "cannot read sample tile for '{}': {e}",
                    group.key
                ))
            })?;
        }
        Ok(())
    }

    fn submit_mosaic_phase(
        &self,
        graph: &TaskGraph,
        groups: Vec<GroupInput>,
    ) -> Result<Vec<GroupPlan>, PipelineError> {
        let mut plans = Vec::with_capacity(groups.len());
        for group in groups {
            let sample = self.store.describe(&group.sample_path).map_err(|e| {
                PipelineError::Configuration(format!(
                    "cannot read sample tile for '{}': {e}",
                    group.key
                ))
            })?;
            let raster_path = self.config.workspace_dir.join(&group.key);
            let init_token = init_token_path(&raster_path, self.config.cell_size);
            debug!(target = %raster_path.display(), "planning output group");

            let init_id = {
                let store = Arc::clone(&self.store);
                let cell_size = self.config.cell_size;
                let (nodata, data_type) = (sample.nodata, sample.data_type);
                let (raster, token) = (raster_path.clone(), init_token.clone());
                graph.submit(
                    TaskSpec::new(
                        format!("create empty global {}", group.key),
                        Box::new(move || {
                            init::create_empty_global_raster(
                                store.as_ref(),
                                cell_size,
                                nodata,
                                data_type,
                                &raster,
                                &token,
                            )
                            .map_err(TaskError::from_error)
                        }),
                    )
                    .with_targets([init_token])
                    .with_ignored([raster_path.clone()]),
                )?
            };

            let mut plan = GroupPlan {
                chain: MergeChain::new(group.key.clone(), init_id),
                finalized_path: compressed_path(&raster_path),
                key: group.key,
                raster_path: raster_path.clone(),
                task_ids: vec![init_id],
                finalize_task: None,
            };

            for tile in &group.tile_paths {
                let warped_path = sibling_with_stem_suffix(tile, "_wgs84");
                let warp_id = {
                    let warper = Arc::clone(&self.warper);
                    let (source, target) = (tile.clone(), warped_path.clone());
                    let cell_size = self.config.cell_size;
                    let resample = self.config.resample;
                    graph.submit(
                        TaskSpec::new(
                            format!("wgs84 project {}", file_name(tile)),
                            Box::new(move || {
                                warper
                                    .warp(&source, (cell_size, cell_size), &target, resample, WGS84_WKT)
                                    .map_err(TaskError::from_error)
                            }),
                        )
                        .with_targets([warped_path.clone()])
                        .after([init_id]),
                    )?
                };

                let merge_token = merge_token_path(&warped_path);
                let merge_id = {
                    let store = Arc::clone(&self.store);
                    let (source, target, token) =
                        (warped_path.clone(), raster_path.clone(), merge_token.clone());
                    let spec = TaskSpec::new(
                        format!("mosaic {}", file_name(&warped_path)),
                        Box::new(move || {
                            mosaic::merge(store.as_ref(), &source, &target, &token)
                                .map_err(TaskError::from_error)
                        }),
                    )
                    .with_targets([merge_token])
                    .with_ignored([raster_path.clone()])
                    .after([warp_id]);
                    // Chain edge: one in-flight writer per output raster.
                    graph.submit(plan.chain.link(spec))?
                };
                plan.chain.advance(merge_id);
                plan.task_ids.push(warp_id);
                plan.task_ids.push(merge_id);
            }
            plans.push(plan);
        }
        info!(groups = plans.len(), "mosaic phase submitted");
        Ok(plans)
    }

    fn submit_finalize_phase(
        &self,
        graph: &TaskGraph,
        plans: &mut [GroupPlan],
    ) -> Result<(), PipelineError> {
        for plan in plans.iter_mut() {
            let chain_done = graph
                .task_state(plan.chain.final_task())
                .is_some_and(|s| s.is_satisfied());
            if !chain_done {
                info!(group = %plan.key, "skipping finalize: merge chain incomplete");
                continue;
            }
            info!(group = %plan.key, target = %plan.finalized_path.display(), "starting compression");
            let store = Arc::clone(&self.store);
            let resample = self.config.resample;
            let (source, target) = (plan.raster_path.clone(), plan.finalized_path.clone());
            let id = graph.submit(
                TaskSpec::new(
                    format!("compress {}", plan.key),
                    Box::new(move || {
                        pyramid::finalize(store.as_ref(), &source, resample, &target)
                            .map_err(TaskError::from_error)
                    }),
                )
                .with_targets([plan.finalized_path.clone()]),
            )?;
            plan.finalize_task = Some(id);
        }
        Ok(())
    }
}

/// `mosaic.ras` -> `mosaic_<cell_size>.TOKEN`; the cell size in the name
/// invalidates stale tokens when the configuration changes.
fn init_token_path(raster_path: &Path, cell_size: f64) -> PathBuf {
    raster_path.with_file_name(format!("{}_{}.TOKEN", stem(raster_path), cell_size))
}

/// `tile_wgs84.ras` -> `tile_wgs84.MOSAICKED`.
fn merge_token_path(warped_path: &Path) -> PathBuf {
    warped_path.with_file_name(format!("{}.MOSAICKED", stem(warped_path)))
}

/// `mosaic.ras` -> `mosaic_compressed.ras`.
fn compressed_path(raster_path: &Path) -> PathBuf {
    sibling_with_stem_suffix(raster_path, "_compressed")
}

/// Inserts a suffix between a path's stem and extension, keeping it in the
/// same directory.
fn sibling_with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{}{}{}", stem(path), suffix, extension))
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
