//! Per-operation transaction envelope.
//!
//! Every filesystem operation is one database transaction on one pooled
//! session: acquire, begin, run the body, commit on success or roll back on
//! any error, release. Nothing is retried; a failed operation has happened
//! at most once. A rollback is also issued when the body panics or is
//! cancelled, because dropping the transaction guard undoes it.

use crate::error::FsResult;
use crate::pool::{ConnectionPool, PooledConnection};
use futures::future::BoxFuture;
use sqlx::postgres::PgConnection;
use sqlx::Connection;

/// Run one operation body inside the envelope.
///
/// The body receives the transaction's connection and must not commit or
/// roll back itself. A session that broke mid-operation is discarded on
/// release instead of being returned to the pool.
pub async fn with_transaction<T, F>(pool: &ConnectionPool, body: F) -> FsResult<T>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, FsResult<T>>,
{
    let mut session: PooledConnection = pool.acquire().await?;

    let outcome = async {
        let mut tx = Connection::begin(&mut *session).await?;
        let value = body(&mut *tx).await?;
        tx.commit().await?;
        Ok(value)
    }
    .await;

    session.observe(outcome)
}
