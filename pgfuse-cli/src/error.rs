//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and the exit-code contract: 1 for argument and database-check failures,
//! the bridge's own error code passed through for mount failures.

use pgfuse::schema::SetupError;
use std::fmt;
use std::io;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Bad command-line usage
    Usage(String),
    /// A database precondition failed
    DatabaseCheck(SetupError),
    /// Failed to initialize logging
    LoggingInit(String),
    /// Failed to build the async runtime
    Runtime(io::Error),
    /// Failed to detach from the terminal
    Daemonize(io::Error),
    /// Failed to mount the filesystem
    Mount(io::Error),
    /// The FUSE bridge reported an error while serving
    Bridge(io::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        // Print additional help for specific errors
        match self {
            CliError::Usage(_) => {
                eprintln!();
                eprintln!("See 'pgfuse --help' for usage");
            }
            CliError::Mount(_) => {
                eprintln!();
                eprintln!("Common issues:");
                eprintln!("  1. FUSE not installed: sudo apt install fuse3 (Linux)");
                eprintln!("  2. Mountpoint missing or not empty");
                eprintln!(
                    "  3. Mountpoint in use: try unmounting with: fusermount3 -u <mountpoint>"
                );
            }
            CliError::DatabaseCheck(SetupError::SchemaMissing) => {
                eprintln!();
                eprintln!("Load the schema with:");
                eprintln!("  pgfuse --print-schema | psql <database>");
            }
            _ => {}
        }

        process::exit(self.code())
    }

    fn code(&self) -> i32 {
        match self {
            CliError::Mount(err) | CliError::Bridge(err) => err.raw_os_error().unwrap_or(1),
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Usage(msg) => write!(f, "{}", msg),
            CliError::DatabaseCheck(e) => write!(f, "database check failed: {}", e),
            CliError::LoggingInit(msg) => write!(f, "failed to initialize logging: {}", msg),
            CliError::Runtime(e) => write!(f, "failed to start the runtime: {}", e),
            CliError::Daemonize(e) => write!(f, "failed to detach from the terminal: {}", e),
            CliError::Mount(e) => write!(f, "failed to mount the filesystem: {}", e),
            CliError::Bridge(e) => write!(f, "filesystem error: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::DatabaseCheck(e) => Some(e),
            CliError::Runtime(e)
            | CliError::Daemonize(e)
            | CliError::Mount(e)
            | CliError::Bridge(e) => Some(e),
            _ => None,
        }
    }
}
