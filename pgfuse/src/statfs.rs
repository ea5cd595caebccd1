//! Free-space reporting.
//!
//! The filesystem has no storage of its own; what it reports through
//! `statfs` is the free space of the host filesystems carrying the
//! database's tablespaces. For every tablespace directory the mount whose
//! directory is the longest prefix is selected from the mount table, and
//! the minimum free and available byte counts across those mounts are
//! reported: the first tablespace to fill up stops writes.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Canonical location of the host mount table.
pub const MTAB_PATH: &str = "/etc/mtab";

/// Free-space sentinel used when no tablespace maps to a known mount.
pub const UNLIMITED_BYTES: u64 = i64::MAX as u64;

/// One entry of the host mount table.
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub dir: PathBuf,
    pub fs_type: String,
}

/// Minimum free space over the mounts backing the tablespaces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeSpace {
    pub free_bytes: u64,
    pub avail_bytes: u64,
}

/// Parse the content of an fstab-format mount table.
///
/// Lines are `device dir type options dump pass`; the directory field
/// carries octal escapes for whitespace.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let dir = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                dir: PathBuf::from(decode_octal_escapes(dir)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Decode `\040`-style octal escapes of mount table fields.
fn decode_octal_escapes(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// The mount whose directory is the longest prefix of `path`.
pub fn longest_prefix_mount<'a>(
    entries: &'a [MountEntry],
    path: &Path,
) -> Option<&'a MountEntry> {
    entries
        .iter()
        .filter(|entry| path.starts_with(&entry.dir))
        .max_by_key(|entry| entry.dir.as_os_str().len())
}

/// Free and available bytes of the filesystem holding `dir`.
pub fn free_space(dir: &Path) -> io::Result<FreeSpace> {
    let c_dir = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_dir.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(FreeSpace {
        free_bytes: vfs.f_bfree as u64 * vfs.f_frsize as u64,
        avail_bytes: vfs.f_bavail as u64 * vfs.f_frsize as u64,
    })
}

/// Worst-case free space across the mounts backing `locations`.
///
/// Symlinked tablespace directories are resolved before matching. With no
/// resolvable location the result saturates at [`UNLIMITED_BYTES`]; the
/// database is then the only authority on usage.
pub fn tablespace_free_space(locations: &[PathBuf]) -> FreeSpace {
    let entries = match std::fs::read_to_string(MTAB_PATH) {
        Ok(contents) => parse_mount_table(&contents),
        Err(err) => {
            warn!(path = MTAB_PATH, error = %err, "mount table not readable");
            Vec::new()
        }
    };

    let mut mounts: BTreeSet<PathBuf> = BTreeSet::new();
    for location in locations {
        let resolved = match location.canonicalize() {
            Ok(path) => path,
            Err(err) => {
                // Usually a permission problem; keep the raw path.
                warn!(location = %location.display(), error = %err, "realpath failed");
                location.clone()
            }
        };
        if let Some(entry) = longest_prefix_mount(&entries, &resolved) {
            mounts.insert(entry.dir.clone());
        }
    }

    let mut space = FreeSpace {
        free_bytes: UNLIMITED_BYTES,
        avail_bytes: UNLIMITED_BYTES,
    };
    for mount in &mounts {
        match free_space(mount) {
            Ok(found) => {
                debug!(mount = %mount.display(), free = found.free_bytes, "mount free space");
                space.free_bytes = space.free_bytes.min(found.free_bytes);
                space.avail_bytes = space.avail_bytes.min(found.avail_bytes);
            }
            Err(err) => warn!(mount = %mount.display(), error = %err, "statvfs failed"),
        }
    }
    space
}
