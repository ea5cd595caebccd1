//! PgFuse - a FUSE filesystem stored in PostgreSQL
//!
//! The whole persistent state of the filesystem - directory tree, file
//! content, symbolic links and POSIX metadata - lives in two relations of a
//! PostgreSQL database. Every filesystem request coming in through the FUSE
//! bridge is translated into one database transaction.
//!
//! # Architecture
//!
//! - [`dal`]: typed operations over the schema (metadata, directory
//!   listings, block reads/writes, truncation, rename, introspection).
//! - [`pool`]: fixed-capacity pool of database sessions.
//! - [`envelope`]: the acquire/begin/commit/release scaffold wrapped around
//!   every filesystem operation.
//! - [`fs`]: the FUSE operation handlers and mount helpers.
//! - [`statfs`]: free-space reporting against the tablespaces backing the
//!   PgFuse tables.
//! - [`schema`]: embedded schema and the database checks run before a mount
//!   is allowed to proceed.
//!
//! # Example
//!
//! ```ignore
//! use pgfuse::config::PgFuseConfig;
//! use pgfuse::fs::{mount, PgFuseFs};
//! use pgfuse::pool::ConnectionPool;
//!
//! let config = PgFuseConfig::new("postgres://localhost/fs", "/mnt/pg");
//! let pool = ConnectionPool::new(&config.conninfo, config.pool_capacity());
//! let handle = mount(PgFuseFs::new(config.clone(), pool), &config).await?;
//! handle.await?;
//! ```

pub mod config;
pub mod dal;
pub mod envelope;
pub mod error;
pub mod fs;
pub mod logging;
pub mod pool;
pub mod schema;
pub mod statfs;

/// Version of the PgFuse library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
