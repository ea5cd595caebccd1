//! The FUSE operation handlers.
//!
//! Each handler validates its inputs, runs its DAL calls inside the
//! transaction envelope and translates the outcome for the bridge. The
//! bridge hands paths in; the file handle returned by `open` and `create`
//! is the inode id, and a null handle is always invalid.

use crate::config::{PgFuseConfig, MAX_FILENAME_LENGTH};
use crate::dal::{self, Meta};
use crate::envelope::with_transaction;
use crate::error::FsError;
use crate::pool::ConnectionPool;
use crate::statfs;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fuse3::path::prelude::*;
use fuse3::path::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use fuse3::{Errno, FileType, Result as FuseResult, SetAttr, Timestamp};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::postgres::PgConnection;
use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, trace};

/// Time-to-live for attribute caching.
const TTL: Duration = Duration::from_secs(1);

/// The PgFuse filesystem.
///
/// Shared immutably between all handler invocations; the pool carries the
/// only mutable state of the process.
pub struct PgFuseFs {
    pool: ConnectionPool,
    mountpoint: String,
    block_size: usize,
    read_only: bool,
}

impl PgFuseFs {
    /// Create a filesystem over an existing pool.
    pub fn new(config: &PgFuseConfig, pool: ConnectionPool) -> Self {
        Self {
            pool,
            mountpoint: config.mountpoint.clone(),
            block_size: config.block_size,
            read_only: config.read_only,
        }
    }

    fn attr_from_meta(&self, meta: &Meta) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };

        FileAttr {
            size: meta.size as u64,
            blocks: (meta.size as u64).div_ceil(self.block_size as u64),
            atime: to_system_time(meta.atime),
            mtime: to_system_time(meta.mtime),
            ctime: to_system_time(meta.ctime),
            kind,
            perm: (meta.mode & 0o7777) as u16,
            nlink: 1,
            uid: meta.uid,
            gid: meta.gid,
            rdev: 0,
            blksize: self.block_size as u32,
        }
    }

    /// Reject modifications early on a read-only mount.
    fn check_writable(&self) -> FuseResult<()> {
        if self.read_only {
            return Err(Errno::from(libc::EROFS));
        }
        Ok(())
    }

    /// One transaction through the envelope, mapped for the bridge.
    async fn transaction<T, F>(&self, body: F) -> FuseResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, FsError>>,
    {
        with_transaction(&self.pool, body).await.map_err(Errno::from)
    }
}

fn to_timestamp(time: DateTime<Utc>) -> Timestamp {
    Timestamp::new(time.timestamp(), time.timestamp_subsec_nanos())
}

fn to_system_time(time: DateTime<Utc>) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::new(time.timestamp().max(0) as u64, time.timestamp_subsec_nanos())
}

fn from_timestamp(time: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(time.sec, time.nsec).unwrap_or_else(Utc::now)
}

/// The bridge speaks UTF-8 paths; anything else cannot exist in the store.
fn path_str(path: &OsStr) -> FuseResult<&str> {
    path.to_str().ok_or_else(|| Errno::from(libc::EINVAL))
}

/// Join a parent path and an entry name into an absolute path.
fn join_path(parent: &OsStr, name: &OsStr) -> FuseResult<String> {
    let parent = path_str(parent)?;
    let name = path_str(name)?;
    if parent == "/" {
        Ok(format!("/{name}"))
    } else {
        Ok(format!("{parent}/{name}"))
    }
}

impl PathFilesystem for PgFuseFs {
    type DirEntryStream<'a>
        = BoxStream<'a, FuseResult<DirectoryEntry>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = BoxStream<'a, FuseResult<DirectoryEntryPlus>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!(
            mountpoint = %self.mountpoint,
            block_size = self.block_size,
            read_only = self.read_only,
            "mounting filesystem"
        );
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!(mountpoint = %self.mountpoint, "unmounting filesystem");
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = join_path(parent, name)?;
        trace!(path, "lookup");

        let meta = self
            .transaction(|conn| {
                let path = path.clone();
                Box::pin(async move { Ok(dal::read_meta_from_path(conn, &path).await?.1) })
            })
            .await?;

        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_from_meta(&meta),
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        trace!(path = ?path, fh, "getattr");

        let meta = match (path, fh) {
            (Some(path), _) => {
                let path = path_str(path)?.to_string();
                self.transaction(|conn| {
                    Box::pin(async move { Ok(dal::read_meta_from_path(conn, &path).await?.1) })
                })
                .await?
            }
            (None, Some(fh)) if fh != 0 => {
                self.transaction(move |conn| {
                    Box::pin(async move { dal::read_meta(conn, fh as i64, "").await })
                })
                .await?
            }
            _ => return Err(Errno::from(libc::EBADF)),
        };

        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_from_meta(&meta),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        trace!(path = ?path, fh, "setattr");
        self.check_writable()?;

        let path = match path {
            Some(path) => Some(path_str(path)?.to_string()),
            None => None,
        };
        let block_size = self.block_size;

        let meta = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let (id, mut meta) = match (path, fh) {
                        (Some(path), _) => dal::read_meta_from_path(conn, &path).await?,
                        (None, Some(fh)) if fh != 0 => {
                            let meta = dal::read_meta(conn, fh as i64, "").await?;
                            (fh as i64, meta)
                        }
                        _ => return Err(FsError::InvalidHandle),
                    };

                    if let Some(size) = set_attr.size {
                        if meta.is_dir() {
                            return Err(FsError::IsDirectory(format!("inode {id}")));
                        }
                        dal::truncate(conn, block_size, id, size).await?;
                        meta.size = size as i64;
                    }
                    if let Some(mode) = set_attr.mode {
                        // Permission bits change, file-type bits stay.
                        meta.mode = (meta.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
                    }
                    if let Some(uid) = set_attr.uid {
                        meta.uid = uid;
                    }
                    if let Some(gid) = set_attr.gid {
                        meta.gid = gid;
                    }
                    if let Some(atime) = set_attr.atime {
                        meta.atime = from_timestamp(atime);
                    }
                    if let Some(mtime) = set_attr.mtime {
                        meta.mtime = from_timestamp(mtime);
                    }
                    if let Some(ctime) = set_attr.ctime {
                        meta.ctime = from_timestamp(ctime);
                    }

                    dal::write_meta(conn, id, &meta).await?;
                    Ok(meta)
                })
            })
            .await?;

        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_from_meta(&meta),
        })
    }

    async fn create(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = join_path(parent, name)?;
        let parent_path = path_str(parent)?.to_string();
        let name = path_str(name)?.to_string();
        debug!(path, mode, "create");
        self.check_writable()?;

        let (id, meta) = self
            .transaction(move |conn| {
                Box::pin(async move {
                    match dal::read_meta_from_path(conn, &path).await {
                        Ok((_, existing)) if existing.is_dir() => {
                            return Err(FsError::IsDirectory(path))
                        }
                        Ok(_) => return Err(FsError::AlreadyExists(path)),
                        Err(FsError::NotFound(_)) => {}
                        Err(err) => return Err(err),
                    }

                    let (parent_id, parent_meta) =
                        dal::read_meta_from_path(conn, &parent_path).await?;
                    if !parent_meta.is_dir() {
                        return Err(FsError::NotFound(parent_path));
                    }

                    let meta = Meta::new(parent_id, mode, req.uid, req.gid);
                    let id = dal::create_file(conn, parent_id, &path, &name, &meta).await?;
                    Ok((id, meta))
                })
            })
            .await?;

        Ok(ReplyCreated {
            ttl: TTL,
            attr: self.attr_from_meta(&meta),
            generation: 0,
            fh: id as u64,
            flags,
        })
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> FuseResult<ReplyOpen> {
        let path = path_str(path)?.to_string();
        debug!(path, flags, "open");

        if self.read_only && flags & libc::O_ACCMODE as u32 != libc::O_RDONLY as u32 {
            return Err(Errno::from(libc::EROFS));
        }

        let id = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let (id, mut meta) = dal::read_meta_from_path(conn, &path).await?;
                    if meta.is_dir() {
                        return Err(FsError::IsDirectory(path));
                    }
                    meta.atime = Utc::now();
                    dal::write_meta(conn, id, &meta).await?;
                    Ok(id)
                })
            })
            .await?;

        Ok(ReplyOpen {
            fh: id as u64,
            flags,
        })
    }

    async fn read(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        trace!(path = ?path, fh, offset, size, "read");
        if fh == 0 {
            return Err(Errno::from(libc::EBADF));
        }

        let block_size = self.block_size;
        let data = self
            .transaction(move |conn| {
                Box::pin(async move {
                    dal::read_buf(conn, block_size, fh as i64, offset, size as usize).await
                })
            })
            .await?;

        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        trace!(path = ?path, fh, offset, size = data.len(), "write");
        if fh == 0 {
            return Err(Errno::from(libc::EBADF));
        }
        self.check_writable()?;

        let block_size = self.block_size;
        let buf = data.to_vec();
        let written = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let id = fh as i64;
                    let mut meta = dal::read_meta(conn, id, "").await?;
                    if offset + buf.len() as u64 > meta.size as u64 {
                        meta.size = (offset + buf.len() as u64) as i64;
                    }

                    let written = dal::write_buf(conn, block_size, id, &buf, offset).await?;
                    if written != buf.len() {
                        error!(
                            id,
                            expected = buf.len(),
                            written,
                            "write size mismatch, rolling back"
                        );
                        return Err(FsError::Io(format!(
                            "wrote {written} of {} bytes",
                            buf.len()
                        )));
                    }

                    dal::write_meta(conn, id, &meta).await?;
                    Ok(written)
                })
            })
            .await?;

        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = join_path(parent, name)?;
        let parent_path = path_str(parent)?.to_string();
        let name = path_str(name)?.to_string();
        debug!(path, mode, "mkdir");
        self.check_writable()?;

        let meta = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let (parent_id, parent_meta) =
                        dal::read_meta_from_path(conn, &parent_path).await?;
                    if !parent_meta.is_dir() {
                        return Err(FsError::NotFound(parent_path));
                    }

                    // The bridge passes permission bits only.
                    let meta = Meta::new(parent_id, mode | libc::S_IFDIR, req.uid, req.gid);
                    dal::create_dir(conn, parent_id, &path, &name, &meta).await?;
                    Ok(meta)
                })
            })
            .await?;

        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_from_meta(&meta),
        })
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FuseResult<()> {
        let path = join_path(parent, name)?;
        debug!(path, "rmdir");

        let read_only = self.read_only;
        self.transaction(move |conn| {
            Box::pin(async move {
                let (id, meta) = dal::read_meta_from_path(conn, &path).await?;
                if !meta.is_dir() {
                    return Err(FsError::NotDirectory(path));
                }
                if read_only {
                    return Err(FsError::ReadOnly);
                }
                dal::delete_dir(conn, id).await
            })
        })
        .await
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FuseResult<()> {
        let path = join_path(parent, name)?;
        debug!(path, "unlink");

        let read_only = self.read_only;
        self.transaction(move |conn| {
            Box::pin(async move {
                let (id, meta) = dal::read_meta_from_path(conn, &path).await?;
                if meta.is_dir() {
                    // Directories go through rmdir.
                    return Err(FsError::NotPermitted(path));
                }
                if read_only {
                    return Err(FsError::ReadOnly);
                }
                dal::delete_file(conn, id).await
            })
        })
        .await
    }

    async fn symlink(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = join_path(parent, name)?;
        let parent_path = path_str(parent)?.to_string();
        let name = path_str(name)?.to_string();
        let target = path_str(link_path)?.to_string();
        debug!(path, target, "symlink");
        self.check_writable()?;

        let block_size = self.block_size;
        let meta = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let (parent_id, parent_meta) =
                        dal::read_meta_from_path(conn, &parent_path).await?;
                    if !parent_meta.is_dir() {
                        return Err(FsError::NotFound(parent_path));
                    }

                    // Symlinks have no modes of their own; the size is the
                    // length of the target string, stored as content.
                    let mut meta = Meta::new(parent_id, libc::S_IFLNK | 0o777, req.uid, req.gid);
                    meta.size = target.len() as i64;

                    let id = dal::create_file(conn, parent_id, &path, &name, &meta).await?;
                    let written =
                        dal::write_buf(conn, block_size, id, target.as_bytes(), 0).await?;
                    if written != target.len() {
                        return Err(FsError::Io(format!(
                            "wrote {written} of {} link bytes",
                            target.len()
                        )));
                    }
                    Ok(meta)
                })
            })
            .await?;

        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_from_meta(&meta),
        })
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> FuseResult<ReplyData> {
        let path = path_str(path)?.to_string();
        trace!(path, "readlink");

        let block_size = self.block_size;
        let target = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let (id, meta) = dal::read_meta_from_path(conn, &path).await?;
                    if !meta.is_symlink() {
                        return Err(FsError::NotFound(path));
                    }
                    dal::read_buf(conn, block_size, id, 0, meta.size as usize).await
                })
            })
            .await?;

        Ok(ReplyData {
            data: Bytes::from(target),
        })
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> FuseResult<()> {
        let from = join_path(origin_parent, origin_name)?;
        let to = join_path(parent, name)?;
        let to_parent = path_str(parent)?.to_string();
        let new_name = path_str(name)?.to_string();
        debug!(from, to, "rename");

        let read_only = self.read_only;
        self.transaction(move |conn| {
            Box::pin(async move {
                let (from_id, from_meta) = dal::read_meta_from_path(conn, &from).await?;

                match dal::read_meta_from_path(conn, &to).await {
                    Ok((_, to_meta)) => {
                        if to_meta.is_regular() {
                            if from == to {
                                // Renaming onto itself succeeds untouched.
                                return Ok(());
                            }
                            return Err(FsError::AlreadyExists(to));
                        }
                        // Overwriting directories or crossing file types is
                        // not supported.
                        return Err(FsError::BadArgument(to));
                    }
                    Err(FsError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }

                let (to_parent_id, to_parent_meta) =
                    dal::read_meta_from_path(conn, &to_parent).await?;
                if !to_parent_meta.is_dir() {
                    return Err(FsError::Io(format!("{to_parent} is not a directory")));
                }
                if read_only {
                    return Err(FsError::ReadOnly);
                }

                dal::rename(
                    conn,
                    from_id,
                    from_meta.parent_id,
                    to_parent_id,
                    &new_name,
                    &from,
                    &to,
                )
                .await
            })
        })
        .await
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> FuseResult<ReplyStatFs> {
        trace!("statfs");

        let (locations, blocks_used, files_used) = self
            .transaction(|conn| {
                Box::pin(async move {
                    let locations = dal::get_tablespace_locations(conn).await?;
                    let blocks_used = dal::get_fs_blocks_used(conn).await?;
                    let files_used = dal::get_fs_files_used(conn).await?;
                    Ok((locations, blocks_used, files_used))
                })
            })
            .await?;

        let space = statfs::tablespace_free_space(&locations);
        let block_size = self.block_size as u64;
        let bavail = space.avail_bytes / block_size;
        let blocks = bavail.saturating_add(blocks_used as u64);

        // No inherent limit on inode count; report a large sentinel.
        let ffree = statfs::UNLIMITED_BYTES;
        let files = ffree.saturating_add(files_used as u64);

        debug!(blocks, bavail, files_used, "statfs");
        Ok(ReplyStatFs {
            blocks,
            bfree: bavail,
            bavail,
            files,
            ffree,
            bsize: self.block_size as u32,
            namelen: MAX_FILENAME_LENGTH,
            frsize: self.block_size as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        // Nothing held per handle; persistence is per operation.
        trace!(path = ?path, fh, "release");
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> FuseResult<()> {
        trace!(path = ?path, fh, datasync, "fsync");
        if self.read_only {
            return Err(Errno::from(libc::EROFS));
        }
        if fh == 0 {
            return Err(Errno::from(libc::EBADF));
        }
        // Every transaction is already durable when it commits.
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        trace!(path = ?path, fh, "flush");
        Ok(())
    }

    async fn access(&self, _req: Request, _path: &OsStr, _mask: u32) -> FuseResult<()> {
        // Access control is delegated to mount-level options.
        Ok(())
    }

    async fn opendir(&self, _req: Request, path: &OsStr, flags: u32) -> FuseResult<ReplyOpen> {
        trace!(path = ?path, "opendir");
        Ok(ReplyOpen { fh: 0, flags })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = path_str(path)?.to_string();
        trace!(path, offset, "readdir");

        let children = self
            .transaction(move |conn| {
                Box::pin(async move {
                    let (id, meta) = dal::read_meta_from_path(conn, &path).await?;
                    if !meta.is_dir() {
                        return Err(FsError::NotDirectory(path));
                    }
                    dal::readdir(conn, id).await
                })
            })
            .await?;

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirectoryEntry {
            kind: FileType::Directory,
            name: ".".into(),
            offset: 1,
        });
        entries.push(DirectoryEntry {
            kind: FileType::Directory,
            name: "..".into(),
            offset: 2,
        });
        for (index, (name, mode)) in children.into_iter().enumerate() {
            let kind = match mode & libc::S_IFMT {
                libc::S_IFDIR => FileType::Directory,
                libc::S_IFLNK => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            entries.push(DirectoryEntry {
                kind,
                name: name.into(),
                offset: index as i64 + 3,
            });
        }

        let entries: Vec<_> = entries.into_iter().skip(offset as usize).map(Ok).collect();
        Ok(ReplyDirectory {
            entries: stream::iter(entries).boxed(),
        })
    }

    async fn releasedir(&self, _req: Request, path: &OsStr, _fh: u64, _flags: u32) -> FuseResult<()> {
        trace!(path = ?path, "releasedir");
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        path: &OsStr,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        trace!(path = ?path, "fsyncdir");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_at_root() {
        let path = join_path(OsStr::new("/"), OsStr::new("etc")).unwrap();
        assert_eq!(path, "/etc");
    }

    #[test]
    fn join_nested() {
        let path = join_path(OsStr::new("/a/b"), OsStr::new("c")).unwrap();
        assert_eq!(path, "/a/b/c");
    }

    #[test]
    fn non_utf8_names_are_rejected() {
        use std::os::unix::ffi::OsStrExt;
        let bogus = OsStr::from_bytes(&[0x2f, 0xff, 0xfe]);
        assert!(join_path(OsStr::new("/"), bogus).is_err());
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let restored = from_timestamp(to_timestamp(now));
        assert_eq!(restored.timestamp(), now.timestamp());
        assert_eq!(
            restored.timestamp_subsec_nanos(),
            now.timestamp_subsec_nanos()
        );
    }
}
