//! Catalog introspection and aggregate counters.

use crate::error::FsResult;
use sqlx::postgres::types::Oid;
use sqlx::postgres::PgConnection;
use std::path::PathBuf;
use tracing::warn;

/// Relations whose storage location matters for free-space reporting.
const PGFUSE_RELATIONS: &str =
    "('dir', 'data', 'dir_parent_id_idx', 'data_dir_id_idx', 'data_block_no_idx')";

/// On-disk directories of the tablespaces hosting the PgFuse relations.
///
/// OID 0 stands for the database's default tablespace and resolves to
/// `<data_directory>/base`. Locations that cannot be resolved (usually a
/// permission problem) are skipped with a warning; `statfs` degrades to
/// whatever remains.
pub async fn get_tablespace_locations(conn: &mut PgConnection) -> FsResult<Vec<PathBuf>> {
    let sql = format!(
        "SELECT DISTINCT reltablespace FROM pg_catalog.pg_class WHERE relname IN {PGFUSE_RELATIONS}"
    );
    let oids: Vec<Oid> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;

    let mut locations = Vec::with_capacity(oids.len());
    for oid in oids {
        let location = if oid.0 == 0 {
            default_tablespace_location(conn).await
        } else {
            tablespace_location(conn, oid).await
        };
        match location {
            Some(path) => locations.push(path),
            None => warn!(oid = oid.0, "could not resolve tablespace location"),
        }
    }
    Ok(locations)
}

async fn default_tablespace_location(conn: &mut PgConnection) -> Option<PathBuf> {
    let data_directory: Result<String, _> =
        sqlx::query_scalar("SELECT current_setting('data_directory')")
            .fetch_one(&mut *conn)
            .await;
    match data_directory {
        Ok(dir) => Some(PathBuf::from(dir).join("base")),
        Err(err) => {
            warn!(error = %err, "data_directory is not readable");
            None
        }
    }
}

async fn tablespace_location(conn: &mut PgConnection, oid: Oid) -> Option<PathBuf> {
    let location: Result<String, _> = sqlx::query_scalar("SELECT pg_tablespace_location($1)")
        .bind(oid)
        .fetch_one(&mut *conn)
        .await;
    match location {
        // Built-in tablespaces report an empty location; they live in the
        // data directory.
        Ok(path) if path.is_empty() => default_tablespace_location(conn).await,
        Ok(path) => Some(PathBuf::from(path)),
        Err(err) => {
            warn!(oid = oid.0, error = %err, "pg_tablespace_location failed");
            None
        }
    }
}

/// Number of content blocks stored in the filesystem.
pub async fn get_fs_blocks_used(conn: &mut PgConnection) -> FsResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM data")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Number of inodes stored in the filesystem.
pub async fn get_fs_files_used(conn: &mut PgConnection) -> FsResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM dir")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// The block size recorded at schema initialization.
///
/// Read from the sentinel block of the root inode; `None` means the schema
/// has not been loaded into this database.
pub async fn get_block_size(conn: &mut PgConnection) -> FsResult<Option<i64>> {
    let size: Option<i32> = sqlx::query_scalar(
        "SELECT octet_length(data) FROM data WHERE dir_id = 0 AND block_no = 0",
    )
    .fetch_optional(&mut *conn)
    .await?;
    Ok(size.map(i64::from))
}
