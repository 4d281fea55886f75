//! Logging setup for the CLI.
//!
//! Structured logs go to a session log file inside the workspace and, at
//! the same time, to stdout for tailing. The file is truncated at session
//! start. Verbosity is controlled through `RUST_LOG`, defaulting to `info`.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "geomosaic.log";

/// Keeps the non-blocking file writer alive; dropping it flushes and
/// closes the log file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes the global subscriber with file and stdout outputs.
pub fn init(log_dir: &Path) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(log_dir.join(LOG_FILE), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(false);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
