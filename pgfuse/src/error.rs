//! Error taxonomy of the filesystem layer.
//!
//! Every failure a handler can produce is one of the kinds below; the FUSE
//! bridge receives it as the corresponding negative errno. Unexpected
//! database failures collapse into [`FsError::Database`] and surface as EIO.

use fuse3::Errno;
use thiserror::Error;

/// Result alias used throughout the DAL and the handlers.
pub type FsResult<T> = Result<T, FsError>;

/// Errors of filesystem operations, mapped to errno values at the bridge.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path or inode does not exist (ENOENT).
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Sibling with the same name already exists (EEXIST).
    #[error("file exists: {0}")]
    AlreadyExists(String),

    /// Operation on a directory that expects a non-directory (EISDIR).
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// Operation on a non-directory that expects a directory (ENOTDIR).
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Directory still has children (ENOTEMPTY).
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Null or stale file handle (EBADF).
    #[error("invalid file handle")]
    InvalidHandle,

    /// Write access on a read-only mount (EROFS).
    #[error("read-only file system")]
    ReadOnly,

    /// Operation is never allowed on this inode, such as unlinking a
    /// directory (EPERM).
    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// Caller-supplied argument is not usable (EINVAL).
    #[error("invalid argument: {0}")]
    BadArgument(String),

    /// Data moved between the process and the database came out short, or
    /// another non-database I/O failure (EIO).
    #[error("i/o error: {0}")]
    Io(String),

    /// The session to the database broke mid-operation (EIO). The pool
    /// discards such a session instead of returning it.
    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    /// Any other database failure (EIO).
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl FsError {
    /// The errno the FUSE bridge reports for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidHandle => libc::EBADF,
            FsError::ReadOnly => libc::EROFS,
            FsError::NotPermitted(_) => libc::EPERM,
            FsError::BadArgument(_) => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
            FsError::ConnectionLost(_) => libc::EIO,
            FsError::Database(_) => libc::EIO,
        }
    }

    /// Whether the underlying session must not be reused.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, FsError::ConnectionLost(_))
    }
}

impl From<sqlx::Error> for FsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => FsError::NotFound(String::new()),
            sqlx::Error::Io(e) => FsError::ConnectionLost(e.to_string()),
            sqlx::Error::Tls(e) => FsError::ConnectionLost(e.to_string()),
            sqlx::Error::Protocol(e) => FsError::ConnectionLost(e),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                // unique_violation: sibling name or path collision
                FsError::AlreadyExists(db.message().to_string())
            }
            other => FsError::Database(other),
        }
    }
}

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        Errno::from(err.errno())
    }
}
