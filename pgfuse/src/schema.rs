//! Schema bootstrap and the database checks run before mounting.
//!
//! The schema itself ships as `schema/pgfuse.sql`; mounting never creates
//! it implicitly. What is checked here before a mount may proceed:
//!
//! 1. `integer_datetimes` is enabled, so timestamps travel as 64-bit
//!    microseconds.
//! 2. The block size recorded in the schema equals the configured one.

use crate::dal;
use crate::error::FsError;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use thiserror::Error;

/// The filesystem schema, for `pgfuse --print-schema` and the tests.
pub const SCHEMA_SQL: &str = include_str!("../schema/pgfuse.sql");

/// A database precondition failed; mounting must not proceed.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not connect to the database: {0}")]
    Connect(sqlx::Error),

    #[error(
        "the database does not use 64-bit integer timestamps \
         (integer_datetimes = '{0}'); PostgreSQL 8.4 or newer built without \
         --disable-integer-datetimes is required"
    )]
    IntegerDatetimes(String),

    #[error(
        "the PgFuse schema is not loaded in this database; \
         apply schema/pgfuse.sql first"
    )]
    SchemaMissing,

    #[error(
        "block size mismatch: configured {configured} bytes, but the schema \
         records {recorded} bytes"
    )]
    BlockSizeMismatch { configured: usize, recorded: i64 },

    #[error("database check failed: {0}")]
    Check(FsError),
}

/// Split the schema file into executable statements.
///
/// Statements contain no literal semicolons, so splitting on `;` after
/// stripping comment lines is exact.
pub fn schema_statements() -> Vec<String> {
    SCHEMA_SQL
        .split(';')
        .map(|statement| {
            statement
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("--")
                })
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Connect once and verify every mount precondition.
///
/// This runs before daemonizing so failures reach the terminal; the
/// connection is dropped afterwards and the pool starts fresh.
pub async fn verify_database(conninfo: &str, block_size: usize) -> Result<(), SetupError> {
    let mut conn = PgConnection::connect(conninfo)
        .await
        .map_err(SetupError::Connect)?;

    let integer_datetimes: String = sqlx::query_scalar("SHOW integer_datetimes")
        .fetch_one(&mut conn)
        .await
        .map_err(|err| SetupError::Check(err.into()))?;
    if integer_datetimes != "on" {
        return Err(SetupError::IntegerDatetimes(integer_datetimes));
    }

    let recorded = dal::get_block_size(&mut conn).await.map_err(|err| {
        if is_missing_relation(&err) {
            SetupError::SchemaMissing
        } else {
            SetupError::Check(err)
        }
    })?;

    match recorded {
        None => Err(SetupError::SchemaMissing),
        Some(recorded) if recorded != block_size as i64 => Err(SetupError::BlockSizeMismatch {
            configured: block_size,
            recorded,
        }),
        Some(_) => Ok(()),
    }
}

/// `undefined_table`: the schema was never applied.
fn is_missing_relation(err: &FsError) -> bool {
    match err {
        FsError::Database(sqlx::Error::Database(db)) => db.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements();
        // sequence, two tables, three indices, two rules, two inserts
        assert_eq!(statements.len(), 10);
        assert!(statements[0].starts_with("CREATE SEQUENCE"));
        assert!(statements.iter().all(|s| !s.contains("--")));
    }

    #[test]
    fn schema_records_default_block_size() {
        // The sentinel and the column default must agree with
        // DEFAULT_BLOCK_SIZE.
        let occurrences = SCHEMA_SQL.matches("repeat('00', 4096)").count();
        assert_eq!(occurrences, 1);
        assert_eq!(crate::config::DEFAULT_BLOCK_SIZE, 4096);
    }

    #[test]
    fn schema_creates_root_inode() {
        assert!(SCHEMA_SQL.contains("VALUES (0, 0, '/', '/', 0, 16895, 0, 0)"));
    }
}
