//! Fixed-capacity pool of database sessions.
//!
//! Every filesystem operation borrows one session for the duration of its
//! transaction. `acquire` waits when all sessions are in use; the guard
//! returns the session on drop. Sessions are established lazily, so an idle
//! filesystem holds no more connections than it ever needed at once.
//!
//! A session observed broken is marked and discarded instead of returned;
//! the slot it occupied is refilled by a later `acquire`. Sessions are
//! always handed back outside a transaction - the envelope commits or rolls
//! back before the guard drops.

use crate::error::{FsError, FsResult};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

struct PoolInner {
    conninfo: String,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PgConnection>>,
}

/// Pool of at most `capacity` concurrent database sessions.
///
/// Cloning is cheap; all clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool for the given connection string.
    ///
    /// No connection is opened yet; sessions appear on first use.
    pub fn new(conninfo: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be > 0");

        Self {
            inner: Arc::new(PoolInner {
                conninfo: conninfo.into(),
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    /// Borrow a session, waiting until one is available.
    ///
    /// When the pool has a free slot but no idle session (first use, or a
    /// broken session was discarded), a new connection is established here.
    pub async fn acquire(&self) -> FsResult<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| FsError::ConnectionLost(e.to_string()))?;

        let idle = self.inner.idle.lock().expect("pool mutex poisoned").pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!(conninfo = %self.inner.conninfo, "establishing database session");
                PgConnection::connect(&self.inner.conninfo).await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            broken: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Number of sessions currently idle in the pool.
    pub fn idle_sessions(&self) -> usize {
        self.inner.idle.lock().expect("pool mutex poisoned").len()
    }
}

/// A session borrowed from the pool.
///
/// Dereferences to the underlying [`PgConnection`]; dropping the guard
/// returns the session, or discards it when it was marked broken.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Mark the session as unusable; it will not be returned to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Feed an operation outcome through the guard, marking the session
    /// broken when the error indicates a lost connection.
    pub fn observe<T>(&mut self, result: FsResult<T>) -> FsResult<T> {
        if let Err(err) = &result {
            if err.is_connection_lost() {
                warn!(error = %err, "discarding broken database session");
                self.mark_broken();
            }
        }
        result
    }
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        self.conn.as_ref().expect("session already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("session already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken {
                // Dropped on the floor; the slot refills lazily.
                return;
            }
            self.pool
                .idle
                .lock()
                .expect("pool mutex poisoned")
                .push(conn);
        }
    }
}
