//! Task types and the file-token memoization rule.
//!
//! A task declares the paths it produces (`target_paths`), the shared paths
//! it mutates without owning (`ignore_paths`), and the tasks it depends on.
//! Target paths double as durable completion markers: a task whose targets
//! all exist and are no older than any dependency output is satisfied and
//! never re-executed. `ignore_paths` is what lets many merge tasks share one
//! output raster while each is tracked by its own zero-byte token.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Identity of a submitted task within one [`TaskGraph`](super::TaskGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// The blocking operation a task runs on a worker thread.
pub type TaskOp = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Lifecycle state of a task.
///
/// ```text
/// Pending ──► Ready ──► Running ──► Complete
///    │          │
///    │          └────────────────► Skipped   (targets already up to date)
///    └───────────────────────────► Failed    (own error or upstream failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies satisfied, queued for a worker.
    Ready,
    /// Executing on a worker.
    Running,
    /// Operation ran and succeeded.
    Complete,
    /// Satisfied by the memoization rule without executing.
    Skipped,
    /// Operation failed, or an upstream dependency failed.
    Failed,
}

impl TaskState {
    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Failed)
    }

    /// Whether dependents of this task may proceed.
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }
}

/// Why a task ended up [`TaskState::Failed`].
#[derive(Debug)]
pub enum TaskFailure {
    /// The task's own operation returned an error.
    Execution(TaskError),
    /// A transitive dependency failed; the task never ran.
    Upstream { dependency: String },
    /// The worker running the task panicked.
    Panicked,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution(err) => write!(f, "{err}"),
            Self::Upstream { dependency } => {
                write!(f, "not run: dependency '{dependency}' failed")
            }
            Self::Panicked => write!(f, "worker panicked"),
        }
    }
}

/// Error type for task operations.
#[derive(Debug)]
pub struct TaskError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// Creates a new task error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error, keeping it as the source.
    pub fn from_error(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Attaches a source error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &_)
    }
}

/// Specification of a task to submit.
pub struct TaskSpec {
    /// Human-readable name for logging and failure reports.
    pub name: String,
    /// The blocking operation to run.
    pub op: TaskOp,
    /// Paths this task produces; they double as completion markers.
    pub target_paths: Vec<PathBuf>,
    /// Shared paths this task mutates that must not gate re-execution.
    pub ignore_paths: Vec<PathBuf>,
    /// Tasks that must be satisfied before this one runs.
    pub dependencies: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, op: TaskOp) -> Self {
        Self {
            name: name.into(),
            op,
            target_paths: Vec::new(),
            ignore_paths: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = PathBuf>) -> Self {
        self.target_paths.extend(targets);
        self
    }

    pub fn with_ignored(mut self, ignored: impl IntoIterator<Item = PathBuf>) -> Self {
        self.ignore_paths.extend(ignored);
        self
    }

    pub fn after(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("target_paths", &self.target_paths)
            .field("ignore_paths", &self.ignore_paths)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// The memoization rule (skip-on-resume).
///
/// A task is satisfied without executing iff every effective target path
/// (targets minus ignored) exists and none is older than the newest
/// dependency output. Dependency outputs that do not exist on disk are not
/// considered; a dependency that just ran always leaves its targets behind.
pub fn targets_up_to_date(
    target_paths: &[PathBuf],
    ignore_paths: &[PathBuf],
    dependency_targets: &[PathBuf],
) -> bool {
    let ignored: HashSet<&PathBuf> = ignore_paths.iter().collect();
    let effective: Vec<&PathBuf> = target_paths
        .iter()
        .filter(|p| !ignored.contains(p))
        .collect();
    if effective.is_empty() {
        // Nothing durable to check against; the task must run.
        return false;
    }

    let mut oldest_target: Option<SystemTime> = None;
    for path in &effective {
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                oldest_target = Some(match oldest_target {
                    Some(t) => t.min(mtime),
                    None => mtime,
                });
            }
            Err(_) => return false,
        }
    }
    let oldest_target = oldest_target.expect("effective targets non-empty");

    for path in dependency_targets {
        if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
            if mtime > oldest_target {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &PathBuf) {
        std::fs::write(path, b"x").expect("write");
    }

    fn backdate(path: &PathBuf, seconds: u64) {
        let mtime = SystemTime::now() - Duration::from_secs(seconds);
        set_file_mtime(path, FileTime::from_system_time(mtime)).expect("set mtime");
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(TaskState::Complete.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_task_state_satisfied() {
        assert!(TaskState::Complete.is_satisfied());
        assert!(TaskState::Skipped.is_satisfied());
        assert!(!TaskState::Failed.is_satisfied());
    }

    #[test]
    fn test_missing_target_not_up_to_date() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.TOKEN");
        assert!(!targets_up_to_date(&[target], &[], &[]));
    }

    #[test]
    fn test_existing_target_no_deps_up_to_date() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.TOKEN");
        touch(&target);
        assert!(targets_up_to_date(&[target], &[], &[]));
    }

    #[test]
    fn test_stale_target_older_than_dependency() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.TOKEN");
        let dep = dir.path().join("dep.TOKEN");
        touch(&target);
        touch(&dep);
        backdate(&target, 3600);
        assert!(!targets_up_to_date(&[target], &[], &[dep]));
    }

    #[test]
    fn test_fresh_target_newer_than_dependency() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.TOKEN");
        let dep = dir.path().join("dep.TOKEN");
        touch(&dep);
        touch(&target);
        backdate(&dep, 3600);
        assert!(targets_up_to_date(&[target], &[], &[dep]));
    }

    #[test]
    fn test_ignored_paths_excluded_from_check() {
        let dir = TempDir::new().unwrap();
        let token = dir.path().join("out.TOKEN");
        let shared = dir.path().join("mosaic.ras");
        touch(&token);
        // Shared raster missing entirely; the token alone decides.
        assert!(targets_up_to_date(
            &[token, shared.clone()],
            &[shared],
            &[]
        ));
    }

    #[test]
    fn test_no_effective_targets_always_runs() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("mosaic.ras");
        touch(&shared);
        assert!(!targets_up_to_date(&[shared.clone()], &[shared], &[]));
    }

    #[test]
    fn test_missing_dependency_output_ignored() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.TOKEN");
        let dep = dir.path().join("never_written.TOKEN");
        touch(&target);
        assert!(targets_up_to_date(&[target], &[], &[dep]));
    }

    #[test]
    fn test_task_error_display_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = TaskError::new("merge failed").with_source(io);
        assert_eq!(format!("{err}"), "merge failed");
        assert!(std::error::Error::source(&err).is_some());

        let wrapped = TaskError::from_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert_eq!(wrapped.message(), "missing");
    }

    #[test]
    fn test_task_spec_builder() {
        let spec = TaskSpec::new("merge tile", Box::new(|| Ok(())))
            .with_targets([PathBuf::from("/tmp/a.TOKEN")])
            .with_ignored([PathBuf::from("/tmp/mosaic.ras")])
            .after([TaskId(3), TaskId(7)]);
        assert_eq!(spec.name, "merge tile");
        assert_eq!(spec.target_paths.len(), 1);
        assert_eq!(spec.ignore_paths.len(), 1);
        assert_eq!(spec.dependencies, vec![TaskId(3), TaskId(7)]);
    }
}
