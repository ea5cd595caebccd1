//! Logging infrastructure for PgFuse.
//!
//! Structured logging with file output and optional console output:
//! - Writes to `~/.pgfuse/logs/pgfuse.log` by default
//! - Also prints to stdout when running in the foreground
//! - Configurable via the RUST_LOG environment variable; `-v` raises the
//!   level to debug

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard will flush and close the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the logging system.
///
/// Creates the log directory if needed and sets up a non-blocking file
/// writer plus, when `stdout_enabled` is set, a console layer. A daemonized
/// process has no terminal, so the console layer is skipped there.
///
/// # Arguments
///
/// * `log_dir` - Directory for log files
/// * `log_file` - Log file name
/// * `stdout_enabled` - Whether to also log to stdout
/// * `verbose` - Raise the default level from info to debug
pub fn init_logging(
    log_dir: &Path,
    log_file: &str,
    stdout_enabled: bool,
    verbose: bool,
) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    let stdout_layer = if stdout_enabled {
        Some(tracing_subscriber::fmt::layer().with_writer(io::stdout))
    } else {
        None
    };

    let default_filter = if verbose { "pgfuse=debug,info" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Default log directory, `~/.pgfuse/logs` or `./logs` without a home.
pub fn default_log_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".pgfuse").join("logs"),
        None => PathBuf::from("logs"),
    }
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "pgfuse.log"
}
