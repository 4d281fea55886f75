//! Dependency-DAG task executor with file-token memoization.
//!
//! [`TaskGraph`] runs blocking operations on a bounded worker pool, in
//! dependency order, and skips any task whose declared outputs are already
//! up to date on disk (skip-on-resume). It is the concurrency core of the
//! pipeline: everything that can run in parallel does, while explicit
//! dependency edges serialize whatever must not.
//!
//! # Execution model
//!
//! ```text
//! submit() ──► Pending ──reconcile──► Ready ──permit──► Running ──► Complete
//!                 │                      └──► Skipped (targets fresh)
//!                 └──► Failed (upstream failure, never runs)
//! ```
//!
//! A reconciler loop promotes pending tasks whenever a task settles and on a
//! fixed interval besides, so dependents become eligible promptly rather
//! than only at join barriers. Worker concurrency is capped by a semaphore
//! sized `min(configured, available_parallelism)`.
//!
//! # Acyclicity
//!
//! Dependencies must name already-submitted tasks, so the dependency
//! relation is acyclic by construction.
//!
//! # Example
//!
//! ```ignore
//! let graph = TaskGraph::new(8, Duration::from_secs(5));
//! let init = graph.submit(
//!     TaskSpec::new("create raster", Box::new(op)).with_targets([token]),
//! )?;
//! let merge = graph.submit(
//!     TaskSpec::new("merge tile", Box::new(op2))
//!         .with_targets([merge_token])
//!         .after([init]),
//! )?;
//! graph.join().await?;
//! graph.close().await?;
//! ```

mod task;

pub use task::{targets_up_to_date, TaskError, TaskFailure, TaskId, TaskOp, TaskSpec, TaskState};

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A task that ended in failure, as reported at a join barrier.
#[derive(Debug, Clone)]
pub struct FailedTask {
    pub name: String,
    pub reason: String,
}

/// Errors from the task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// One or more tasks failed before the join barrier.
    #[error("{} task(s) failed; first: {}: {}", failures.len(), failures[0].name, failures[0].reason)]
    TasksFailed { failures: Vec<FailedTask> },

    /// The graph has been closed; no further submissions accepted.
    #[error("task graph is closed")]
    Closed,

    /// A dependency id does not refer to a submitted task.
    #[error("unknown dependency {0}")]
    UnknownDependency(TaskId),
}

struct TaskRecord {
    name: String,
    op: Option<TaskOp>,
    target_paths: Vec<PathBuf>,
    ignore_paths: Vec<PathBuf>,
    dependencies: Vec<TaskId>,
    state: TaskState,
    failure: Option<TaskFailure>,
}

struct GraphState {
    records: Vec<TaskRecord>,
    closed: bool,
}

struct GraphInner {
    state: Mutex<GraphState>,
    workers: Arc<Semaphore>,
    /// Kicks the reconciler ahead of its next interval tick.
    wakeup: Notify,
    /// Wakes join waiters whenever any task settles.
    settled: Notify,
    shutdown: CancellationToken,
}

/// Dependency-DAG executor with a bounded worker pool.
pub struct TaskGraph {
    inner: Arc<GraphInner>,
}

impl TaskGraph {
    /// Creates a graph and starts its reconciler loop.
    ///
    /// `n_workers` is clamped to the machine's available parallelism.
    /// `update_interval` bounds how long a ready task can sit unpromoted
    /// when no completion event arrives.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(n_workers: usize, update_interval: Duration) -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool_size = n_workers.clamp(1, available);
        info!(
            requested = n_workers,
            available, pool_size, "starting task graph worker pool"
        );

        let inner = Arc::new(GraphInner {
            state: Mutex::new(GraphState {
                records: Vec::new(),
                closed: false,
            }),
            workers: Arc::new(Semaphore::new(pool_size)),
            wakeup: Notify::new(),
            settled: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let loop_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(update_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_inner.shutdown.cancelled() => break,
                    _ = loop_inner.wakeup.notified() => {}
                    _ = tick.tick() => {}
                }
                Self::reconcile(&loop_inner);
            }
            debug!("task graph reconciler stopped");
        });

        Self { inner }
    }

    /// Registers a task.
    ///
    /// The task runs once all dependencies are satisfied, unless the
    /// memoization rule finds its targets already up to date, in which case
    /// it settles as [`TaskState::Skipped`] without executing.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, GraphError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(GraphError::Closed);
        }
        for dep in &spec.dependencies {
            if dep.0 as usize >= state.records.len() {
                return Err(GraphError::UnknownDependency(*dep));
            }
        }
        let id = TaskId(state.records.len() as u64);
        debug!(task = %id, name = %spec.name, deps = spec.dependencies.len(), "submitted");
        state.records.push(TaskRecord {
            name: spec.name,
            op: Some(spec.op),
            target_paths: spec.target_paths,
            ignore_paths: spec.ignore_paths,
            dependencies: spec.dependencies,
            state: TaskState::Pending,
            failure: None,
        });
        drop(state);
        self.inner.wakeup.notify_one();
        Ok(id)
    }

    /// Blocks until every task submitted so far has settled.
    ///
    /// Returns the aggregate of all failures recorded so far, if any.
    pub async fn join(&self) -> Result<(), GraphError> {
        self.inner.wakeup.notify_one();
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let all_settled = {
                let state = self.inner.state.lock();
                state.records.iter().all(|r| r.state.is_terminal())
            };
            if all_settled {
                break;
            }
            notified.await;
        }

        let failures: Vec<FailedTask> = {
            let state = self.inner.state.lock();
            state
                .records
                .iter()
                .filter(|r| r.state == TaskState::Failed)
                .map(|r| FailedTask {
                    name: r.name.clone(),
                    reason: r
                        .failure
                        .as_ref()
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                })
                .collect()
        };
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GraphError::TasksFailed { failures })
        }
    }

    /// Final join, then terminates the worker pool. No further submissions
    /// are accepted.
    pub async fn close(&self) -> Result<(), GraphError> {
        let result = self.join().await;
        self.inner.state.lock().closed = true;
        self.inner.shutdown.cancel();
        result
    }

    /// Current state of a task.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.inner
            .state
            .lock()
            .records
            .get(id.0 as usize)
            .map(|r| r.state)
    }

    /// Failure description of a task, if it failed.
    pub fn task_failure(&self, id: TaskId) -> Option<String> {
        self.inner
            .state
            .lock()
            .records
            .get(id.0 as usize)
            .and_then(|r| r.failure.as_ref())
            .map(|f| f.to_string())
    }

    /// Promotes pending tasks whose dependencies have settled.
    fn reconcile(inner: &Arc<GraphInner>) {
        let mut to_run: Vec<(TaskId, String, TaskOp)> = Vec::new();
        let mut settled_any = false;
        {
            let mut state = inner.state.lock();
            let n = state.records.len();
            for idx in 0..n {
                if state.records[idx].state != TaskState::Pending {
                    continue;
                }
                // Failed dependency cancels the whole downstream subtree.
                let failed_dep = state.records[idx]
                    .dependencies
                    .iter()
                    .find(|d| state.records[d.0 as usize].state == TaskState::Failed)
                    .copied();
                if let Some(dep) = failed_dep {
                    let dep_name = state.records[dep.0 as usize].name.clone();
                    let record = &mut state.records[idx];
                    warn!(task = %record.name, dependency = %dep_name, "cancelled by upstream failure");
                    record.state = TaskState::Failed;
                    record.failure = Some(TaskFailure::Upstream {
                        dependency: dep_name,
                    });
                    settled_any = true;
                    continue;
                }

                let deps_satisfied = state.records[idx]
                    .dependencies
                    .iter()
                    .all(|d| state.records[d.0 as usize].state.is_satisfied());
                if !deps_satisfied {
                    continue;
                }

                let dependency_targets: Vec<PathBuf> = state.records[idx]
                    .dependencies
                    .iter()
                    .flat_map(|d| state.records[d.0 as usize].target_paths.iter().cloned())
                    .collect();
                let record = &mut state.records[idx];
                if targets_up_to_date(
                    &record.target_paths,
                    &record.ignore_paths,
                    &dependency_targets,
                ) {
                    info!(task = %record.name, "targets up to date, skipping");
                    record.state = TaskState::Skipped;
                    record.op = None;
                    settled_any = true;
                    continue;
                }

                record.state = TaskState::Ready;
                let op = record.op.take().expect("pending task retains its op");
                to_run.push((TaskId(idx as u64), record.name.clone(), op));
            }
        }

        if settled_any {
            inner.settled.notify_waiters();
        }
        for (id, name, op) in to_run {
            let runner_inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::run_task(runner_inner, id, name, op).await;
            });
        }
    }

    async fn run_task(inner: Arc<GraphInner>, id: TaskId, name: String, op: TaskOp) {
        let permit = Arc::clone(&inner.workers)
            .acquire_owned()
            .await
            .expect("worker semaphore never closed");
        {
            let mut state = inner.state.lock();
            state.records[id.0 as usize].state = TaskState::Running;
        }
        debug!(task = %id, name = %name, "running");

        let outcome = tokio::task::spawn_blocking(op).await;
        drop(permit);

        {
            let mut state = inner.state.lock();
            let record = &mut state.records[id.0 as usize];
            match outcome {
                Ok(Ok(())) => {
                    debug!(task = %id, name = %name, "complete");
                    record.state = TaskState::Complete;
                }
                Ok(Err(err)) => {
                    warn!(task = %id, name = %name, error = %err, "failed");
                    record.state = TaskState::Failed;
                    record.failure = Some(TaskFailure::Execution(err));
                }
                Err(join_err) => {
                    warn!(task = %id, name = %name, error = %join_err, "worker panicked");
                    record.state = TaskState::Failed;
                    record.failure = Some(TaskFailure::Panicked);
                }
            }
        }
        inner.wakeup.notify_one();
        inner.settled.notify_waiters();
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
