//! Inode metadata operations.

use crate::error::{FsError, FsResult};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::Row;
use tracing::debug;

/// POSIX metadata of one inode.
///
/// `size` is the logical file length for regular files and the length of
/// the target string for symlinks; directories keep it at 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    pub parent_id: i64,
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

impl Meta {
    /// Metadata of a freshly created inode, all timestamps set to `now`.
    pub fn new(parent_id: i64, mode: u32, uid: u32, gid: u32) -> Self {
        let now = Utc::now();
        Self {
            parent_id,
            size: 0,
            mode,
            uid,
            gid,
            ctime: now,
            mtime: now,
            atime: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

const META_COLUMNS: &str = "id, parent_id, size, mode, uid, gid, ctime, mtime, atime";

fn meta_from_row(row: &PgRow) -> (i64, Meta) {
    let id: i64 = row.get("id");
    let meta = Meta {
        parent_id: row.get("parent_id"),
        size: row.get("size"),
        mode: row.get::<i32, _>("mode") as u32,
        uid: row.get::<i32, _>("uid") as u32,
        gid: row.get::<i32, _>("gid") as u32,
        ctime: row.get("ctime"),
        mtime: row.get("mtime"),
        atime: row.get("atime"),
    };
    (id, meta)
}

/// Resolve an absolute path to its inode.
///
/// Uses the denormalized `path` column, which every rename keeps in
/// agreement with the tree structure.
pub async fn read_meta_from_path(
    conn: &mut PgConnection,
    path: &str,
) -> FsResult<(i64, Meta)> {
    let sql = format!("SELECT {META_COLUMNS} FROM dir WHERE path = $1");
    let row = sqlx::query(&sql)
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => Ok(meta_from_row(&row)),
        None => Err(FsError::NotFound(path.to_string())),
    }
}

/// Resolve one directory entry, a single step of tree descent.
pub async fn lookup_entry(
    conn: &mut PgConnection,
    parent_id: i64,
    name: &str,
) -> FsResult<(i64, Meta)> {
    let sql = format!("SELECT {META_COLUMNS} FROM dir WHERE parent_id = $1 AND name = $2");
    let row = sqlx::query(&sql)
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => Ok(meta_from_row(&row)),
        None => Err(FsError::NotFound(name.to_string())),
    }
}

/// Metadata by inode id. `path` only serves diagnostics.
pub async fn read_meta(conn: &mut PgConnection, id: i64, path: &str) -> FsResult<Meta> {
    let sql = format!("SELECT {META_COLUMNS} FROM dir WHERE id = $1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;

    match row {
        Some(row) => Ok(meta_from_row(&row).1),
        None => Err(FsError::NotFound(path.to_string())),
    }
}

/// Update all mutable metadata fields of an inode atomically.
pub async fn write_meta(conn: &mut PgConnection, id: i64, meta: &Meta) -> FsResult<()> {
    let result = sqlx::query(
        "UPDATE dir SET size = $2, mode = $3, uid = $4, gid = $5, \
         ctime = $6, mtime = $7, atime = $8 WHERE id = $1",
    )
    .bind(id)
    .bind(meta.size)
    .bind(meta.mode as i32)
    .bind(meta.uid as i32)
    .bind(meta.gid as i32)
    .bind(meta.ctime)
    .bind(meta.mtime)
    .bind(meta.atime)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(FsError::NotFound(format!("inode {id}")));
    }
    Ok(())
}

/// All children of a directory as `(name, mode)` pairs.
///
/// The root's self-reference is excluded; `.` and `..` are the handler's
/// business.
pub async fn readdir(conn: &mut PgConnection, id: i64) -> FsResult<Vec<(String, u32)>> {
    let rows = sqlx::query("SELECT name, mode FROM dir WHERE parent_id = $1 AND id <> $1 ORDER BY name")
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("name"), row.get::<i32, _>("mode") as u32))
        .collect())
}

async fn create_inode(
    conn: &mut PgConnection,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
) -> FsResult<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO dir (parent_id, name, path, size, mode, uid, gid, ctime, mtime, atime) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
    )
    .bind(parent_id)
    .bind(name)
    .bind(path)
    .bind(meta.size)
    .bind(meta.mode as i32)
    .bind(meta.uid as i32)
    .bind(meta.gid as i32)
    .bind(meta.ctime)
    .bind(meta.mtime)
    .bind(meta.atime)
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| match FsError::from(err) {
        FsError::AlreadyExists(_) => FsError::AlreadyExists(path.to_string()),
        other => other,
    })?;

    debug!(path, id, "created inode");
    Ok(id)
}

/// Insert a regular-file or symlink inode. The schema materializes its
/// first content block.
pub async fn create_file(
    conn: &mut PgConnection,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
) -> FsResult<i64> {
    create_inode(conn, parent_id, path, name, meta).await
}

/// Insert a directory inode.
pub async fn create_dir(
    conn: &mut PgConnection,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
) -> FsResult<i64> {
    create_inode(conn, parent_id, path, name, meta).await
}

/// Remove a non-directory inode together with all of its blocks.
pub async fn delete_file(conn: &mut PgConnection, id: i64) -> FsResult<()> {
    let meta = read_meta(conn, id, "").await?;
    if meta.is_dir() {
        return Err(FsError::IsDirectory(format!("inode {id}")));
    }

    // The schema's delete rule removes the data rows.
    sqlx::query("DELETE FROM dir WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Remove an empty directory inode.
pub async fn delete_dir(conn: &mut PgConnection, id: i64) -> FsResult<()> {
    let meta = read_meta(conn, id, "").await?;
    if !meta.is_dir() {
        return Err(FsError::NotDirectory(format!("inode {id}")));
    }

    let has_children: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM dir WHERE parent_id = $1 AND id <> $1)",
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    if has_children {
        return Err(FsError::NotEmpty(format!("inode {id}")));
    }

    sqlx::query("DELETE FROM dir WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Relink an inode under a new parent and name.
///
/// For directories the denormalized `path` of every descendant is rewritten
/// in the same transaction, keeping path lookup and tree structure in
/// agreement. The root's self-reference never matches the prefix rewrite.
pub async fn rename(
    conn: &mut PgConnection,
    from_id: i64,
    from_parent_id: i64,
    to_parent_id: i64,
    new_name: &str,
    from_path: &str,
    to_path: &str,
) -> FsResult<()> {
    let meta = read_meta(conn, from_id, from_path).await?;

    let result = sqlx::query(
        "UPDATE dir SET parent_id = $2, name = $3, path = $4 \
         WHERE id = $1 AND parent_id = $5",
    )
    .bind(from_id)
    .bind(to_parent_id)
    .bind(new_name)
    .bind(to_path)
    .bind(from_parent_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(FsError::NotFound(from_path.to_string()));
    }

    if meta.is_dir() {
        // left() comparison instead of LIKE: paths may contain pattern
        // metacharacters.
        sqlx::query(
            "UPDATE dir SET path = $2 || substr(path, char_length($1) + 1) \
             WHERE left(path, char_length($1) + 1) = $1 || '/'",
        )
        .bind(from_path)
        .bind(to_path)
        .execute(&mut *conn)
        .await?;
    }

    debug!(from_path, to_path, "renamed inode");
    Ok(())
}
