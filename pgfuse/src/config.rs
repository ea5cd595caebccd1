//! Mount configuration.
//!
//! Everything the process needs to run comes from the command line; there is
//! no configuration file. The options mirror the mount semantics: connection
//! string and mountpoint are mandatory, the rest are flags.

/// Default size of a content block in bytes.
///
/// Must match the block size recorded in the database schema; the check in
/// [`crate::schema::verify_database`] refuses the mount otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Capacity of the database connection pool in multi-threaded mode.
pub const MAX_DB_CONNECTIONS: usize = 8;

/// Longest file name reported through `statfs` (`f_namemax`).
pub const MAX_FILENAME_LENGTH: u32 = 255;

/// Options of one PgFuse mount.
#[derive(Debug, Clone)]
pub struct PgFuseConfig {
    /// Connection string, forwarded verbatim to the database driver.
    pub conninfo: String,
    /// Directory the filesystem is mounted on.
    pub mountpoint: String,
    /// Size of one content block in bytes.
    pub block_size: usize,
    /// Reject every modifying operation with EROFS.
    pub read_only: bool,
    /// One shared database session instead of a pool.
    pub single_threaded: bool,
    /// Log at debug level.
    pub verbose: bool,
    /// Stay attached to the terminal instead of daemonizing.
    pub foreground: bool,
}

impl PgFuseConfig {
    /// Create a configuration with default options.
    pub fn new(conninfo: impl Into<String>, mountpoint: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
            mountpoint: mountpoint.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            read_only: false,
            single_threaded: false,
            verbose: false,
            foreground: false,
        }
    }

    /// Pool capacity implied by the threading mode.
    ///
    /// Single-threaded mode runs on one shared session, which a capacity-1
    /// pool provides without a separate code path.
    pub fn pool_capacity(&self) -> usize {
        if self.single_threaded {
            1
        } else {
            MAX_DB_CONNECTIONS
        }
    }
}
