//! Database-backed integration tests.
//!
//! These exercise the DAL, the pool and the transaction envelope against a
//! real PostgreSQL server. They are skipped unless `PGFUSE_TEST_DSN` points
//! at a scratch database, e.g.:
//!
//! ```text
//! PGFUSE_TEST_DSN=postgres://localhost/pgfuse_test cargo test
//! ```
//!
//! The schema of that database is dropped and recreated by every test.

use pgfuse::dal::{self, Meta, ROOT_INO};
use pgfuse::envelope::with_transaction;
use pgfuse::error::FsError;
use pgfuse::pool::ConnectionPool;
use pgfuse::schema;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::sync::Mutex;

const BS: usize = 4096;

/// Tests share one scratch database; they take turns.
static DB_LOCK: Mutex<()> = Mutex::new(());

fn test_dsn() -> Option<String> {
    let dsn = std::env::var("PGFUSE_TEST_DSN").ok();
    if dsn.is_none() {
        eprintln!("PGFUSE_TEST_DSN not set, skipping");
    }
    dsn
}

async fn fresh_database(dsn: &str) -> PgConnection {
    let mut conn = PgConnection::connect(dsn).await.expect("connect");
    for drop in [
        "DROP TABLE IF EXISTS data CASCADE",
        "DROP TABLE IF EXISTS dir CASCADE",
        "DROP SEQUENCE IF EXISTS dir_id_seq",
    ] {
        sqlx::query(drop).execute(&mut conn).await.expect("drop");
    }
    for statement in schema::schema_statements() {
        sqlx::query(&statement)
            .execute(&mut conn)
            .await
            .expect("apply schema");
    }
    conn
}

async fn make_file(conn: &mut PgConnection, parent: i64, path: &str, name: &str) -> i64 {
    let meta = Meta::new(parent, libc::S_IFREG | 0o644, 1000, 1000);
    dal::create_file(conn, parent, path, name, &meta)
        .await
        .expect("create file")
}

async fn make_dir(conn: &mut PgConnection, parent: i64, path: &str, name: &str) -> i64 {
    let meta = Meta::new(parent, libc::S_IFDIR | 0o755, 1000, 1000);
    dal::create_dir(conn, parent, path, name, &meta)
        .await
        .expect("create dir")
}

#[tokio::test]
async fn directory_tree_and_listing() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let a = make_dir(&mut conn, ROOT_INO, "/a", "a").await;
    make_dir(&mut conn, a, "/a/b", "b").await;
    make_dir(&mut conn, a, "/a/c", "c").await;

    let listing = dal::readdir(&mut conn, a).await.unwrap();
    let names: Vec<&str> = listing.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);

    // The root's self-reference never shows up in its own listing.
    let root_listing = dal::readdir(&mut conn, ROOT_INO).await.unwrap();
    let names: Vec<&str> = root_listing.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["a"]);

    let (id, meta) = dal::read_meta_from_path(&mut conn, "/a/b").await.unwrap();
    assert!(meta.is_dir());
    let (by_step, _) = dal::lookup_entry(&mut conn, a, "b").await.unwrap();
    assert_eq!(by_step, id);
}

#[tokio::test]
async fn write_then_read_round_trip() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let f = make_file(&mut conn, ROOT_INO, "/f", "f").await;
    let payload = b"hello\n";

    let written = dal::write_buf(&mut conn, BS, f, payload, 0).await.unwrap();
    assert_eq!(written, payload.len());

    let mut meta = dal::read_meta(&mut conn, f, "/f").await.unwrap();
    meta.size = payload.len() as i64;
    dal::write_meta(&mut conn, f, &meta).await.unwrap();

    assert_eq!(
        dal::read_meta_from_path(&mut conn, "/f").await.unwrap().1.size,
        6
    );
    let read = dal::read_buf(&mut conn, BS, f, 0, 6).await.unwrap();
    assert_eq!(read, payload);

    // Reads past the end return nothing.
    let read = dal::read_buf(&mut conn, BS, f, 6, 10).await.unwrap();
    assert!(read.is_empty());
    let read = dal::read_buf(&mut conn, BS, f, 100, 10).await.unwrap();
    assert!(read.is_empty());
}

#[tokio::test]
async fn write_spanning_multiple_blocks() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let f = make_file(&mut conn, ROOT_INO, "/f", "f").await;

    // Mid-block start, crossing two block boundaries.
    let payload: Vec<u8> = (0..2 * BS + 100).map(|i| (i % 251) as u8).collect();
    let offset = 3000u64;
    let written = dal::write_buf(&mut conn, BS, f, &payload, offset).await.unwrap();
    assert_eq!(written, payload.len());

    let mut meta = dal::read_meta(&mut conn, f, "/f").await.unwrap();
    meta.size = offset as i64 + payload.len() as i64;
    dal::write_meta(&mut conn, f, &meta).await.unwrap();

    let read = dal::read_buf(&mut conn, BS, f, offset, payload.len()).await.unwrap();
    assert_eq!(read, payload);

    // The gap before the write reads as zeros.
    let gap = dal::read_buf(&mut conn, BS, f, 0, 3000).await.unwrap();
    assert_eq!(gap, vec![0u8; 3000]);
}

#[tokio::test]
async fn truncate_grow_reads_zeros() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let g = make_file(&mut conn, ROOT_INO, "/g", "g").await;
    dal::truncate(&mut conn, BS, g, 2049).await.unwrap();
    let mut meta = dal::read_meta(&mut conn, g, "/g").await.unwrap();
    meta.size = 2049;
    dal::write_meta(&mut conn, g, &meta).await.unwrap();

    let read = dal::read_buf(&mut conn, BS, g, 0, 2049).await.unwrap();
    assert_eq!(read, vec![0u8; 2049]);
}

#[tokio::test]
async fn truncate_shrink_discards_content() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let f = make_file(&mut conn, ROOT_INO, "/f", "f").await;
    let payload = vec![0xABu8; 2 * BS];
    dal::write_buf(&mut conn, BS, f, &payload, 0).await.unwrap();
    let mut meta = dal::read_meta(&mut conn, f, "/f").await.unwrap();
    meta.size = payload.len() as i64;
    dal::write_meta(&mut conn, f, &meta).await.unwrap();

    // Shrink to one byte less than a block, then grow again: the cut-off
    // tail must not resurrect.
    for new_size in [BS as u64 - 1, BS as u64, BS as u64 + 1] {
        dal::truncate(&mut conn, BS, f, new_size).await.unwrap();
        let mut meta = dal::read_meta(&mut conn, f, "/f").await.unwrap();
        meta.size = new_size as i64;
        dal::write_meta(&mut conn, f, &meta).await.unwrap();
    }

    // Content: 0xAB up to byte BS-2, zeros from the first shrink onwards.
    let read = dal::read_buf(&mut conn, BS, f, BS as u64 - 2, 3).await.unwrap();
    assert_eq!(read, vec![0xAB, 0x00, 0x00]);
}

#[tokio::test]
async fn sparse_write_far_past_the_end() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let big = make_file(&mut conn, ROOT_INO, "/big", "big").await;
    let offset = 1_000_000u64;
    dal::write_buf(&mut conn, BS, big, b"X", offset).await.unwrap();
    let mut meta = dal::read_meta(&mut conn, big, "/big").await.unwrap();
    meta.size = offset as i64 + 1;
    dal::write_meta(&mut conn, big, &meta).await.unwrap();

    assert_eq!(
        dal::read_meta_from_path(&mut conn, "/big").await.unwrap().1.size,
        1_000_001
    );
    let head = dal::read_buf(&mut conn, BS, big, 0, 10).await.unwrap();
    assert_eq!(head, vec![0u8; 10]);
    let tail = dal::read_buf(&mut conn, BS, big, offset, 1).await.unwrap();
    assert_eq!(tail, b"X");
}

#[tokio::test]
async fn symlink_content_round_trip() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let target = "target";
    let mut meta = Meta::new(ROOT_INO, libc::S_IFLNK | 0o777, 1000, 1000);
    meta.size = target.len() as i64;
    let link = dal::create_file(&mut conn, ROOT_INO, "/link", "link", &meta)
        .await
        .unwrap();
    dal::write_buf(&mut conn, BS, link, target.as_bytes(), 0)
        .await
        .unwrap();

    let (_, meta) = dal::read_meta_from_path(&mut conn, "/link").await.unwrap();
    assert!(meta.is_symlink());
    assert_eq!(meta.size, 6);

    let read = dal::read_buf(&mut conn, BS, link, 0, meta.size as usize)
        .await
        .unwrap();
    assert_eq!(read, target.as_bytes());
}

#[tokio::test]
async fn rename_preserves_the_inode() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let x = make_file(&mut conn, ROOT_INO, "/x", "x").await;
    dal::rename(&mut conn, x, ROOT_INO, ROOT_INO, "y", "/x", "/y")
        .await
        .unwrap();

    assert!(matches!(
        dal::read_meta_from_path(&mut conn, "/x").await,
        Err(FsError::NotFound(_))
    ));
    let (id, meta) = dal::read_meta_from_path(&mut conn, "/y").await.unwrap();
    assert_eq!(id, x);
    assert_eq!(meta.size, 0);
}

#[tokio::test]
async fn rename_directory_rewrites_descendant_paths() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let a = make_dir(&mut conn, ROOT_INO, "/a", "a").await;
    let b = make_dir(&mut conn, a, "/a/b", "b").await;
    let f = make_file(&mut conn, b, "/a/b/f", "f").await;

    dal::rename(&mut conn, a, ROOT_INO, ROOT_INO, "z", "/a", "/z")
        .await
        .unwrap();

    let (id, _) = dal::read_meta_from_path(&mut conn, "/z/b/f").await.unwrap();
    assert_eq!(id, f);
    assert!(dal::read_meta_from_path(&mut conn, "/a/b/f").await.is_err());
}

#[tokio::test]
async fn unique_sibling_names() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    make_file(&mut conn, ROOT_INO, "/f", "f").await;
    let meta = Meta::new(ROOT_INO, libc::S_IFREG | 0o644, 1000, 1000);
    let err = dal::create_file(&mut conn, ROOT_INO, "/f", "f", &meta)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));
}

#[tokio::test]
async fn rmdir_semantics() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let d = make_dir(&mut conn, ROOT_INO, "/d", "d").await;
    make_file(&mut conn, d, "/d/f", "f").await;

    let err = dal::delete_dir(&mut conn, d).await.unwrap_err();
    assert!(matches!(err, FsError::NotEmpty(_)));

    let (f, _) = dal::read_meta_from_path(&mut conn, "/d/f").await.unwrap();
    dal::delete_file(&mut conn, f).await.unwrap();
    dal::delete_dir(&mut conn, d).await.unwrap();

    // mkdir; rmdir leaves no trace.
    assert!(dal::read_meta_from_path(&mut conn, "/d").await.is_err());
}

#[tokio::test]
async fn delete_file_drops_blocks() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    let blocks_before = dal::get_fs_blocks_used(&mut conn).await.unwrap();
    let f = make_file(&mut conn, ROOT_INO, "/f", "f").await;
    dal::write_buf(&mut conn, BS, f, &vec![1u8; 3 * BS], 0)
        .await
        .unwrap();
    assert!(dal::get_fs_blocks_used(&mut conn).await.unwrap() > blocks_before);

    dal::delete_file(&mut conn, f).await.unwrap();
    assert_eq!(
        dal::get_fs_blocks_used(&mut conn).await.unwrap(),
        blocks_before
    );
}

#[tokio::test]
async fn block_size_is_recorded() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    let mut conn = fresh_database(&dsn).await;

    assert_eq!(
        dal::get_block_size(&mut conn).await.unwrap(),
        Some(BS as i64)
    );
    drop(conn);

    schema::verify_database(&dsn, BS).await.unwrap();
    let err = schema::verify_database(&dsn, BS * 2).await.unwrap_err();
    assert!(matches!(
        err,
        schema::SetupError::BlockSizeMismatch { .. }
    ));
}

#[tokio::test]
async fn envelope_rolls_back_on_error() {
    let Some(dsn) = test_dsn() else { return };
    let _guard = DB_LOCK.lock().unwrap();
    drop(fresh_database(&dsn).await);

    let pool = ConnectionPool::new(&dsn, 2);

    let result: Result<(), FsError> = with_transaction(&pool, |conn| {
        Box::pin(async move {
            let meta = Meta::new(ROOT_INO, libc::S_IFREG | 0o644, 0, 0);
            dal::create_file(conn, ROOT_INO, "/doomed", "doomed", &meta).await?;
            Err(FsError::Io("forced failure".into()))
        })
    })
    .await;
    assert!(result.is_err());

    // The insert must have been rolled back.
    let seen = with_transaction(&pool, |conn| {
        Box::pin(async move { Ok(dal::read_meta_from_path(conn, "/doomed").await.is_ok()) })
    })
    .await
    .unwrap();
    assert!(!seen);

    // The session survived and was returned to the pool.
    assert_eq!(pool.idle_sessions(), 1);
}
