//! Mount helpers for starting the FUSE session.
//!
//! Only supported on Unix-like systems. On Linux the mount is unprivileged
//! via fusermount3, so no root rights are needed.

use crate::config::PgFuseConfig;
use crate::fs::PgFuseFs;
use fuse3::path::Session;
use fuse3::raw::MountHandle;
use fuse3::MountOptions;
use std::io;
use std::path::PathBuf;

fn mount_options(config: &PgFuseConfig) -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("pgfuse");
    options.read_only(config.read_only);
    options.force_readdir_plus(false);
    options
}

/// Mount the filesystem on the configured mountpoint.
///
/// The returned handle resolves when the filesystem is unmounted; awaiting
/// it keeps the mount alive.
#[cfg(target_os = "linux")]
pub async fn mount(fs: PgFuseFs, config: &PgFuseConfig) -> io::Result<MountHandle> {
    let options = mount_options(config);
    let mountpoint = PathBuf::from(&config.mountpoint);
    Session::new(options)
        .mount_with_unprivileged(fs, mountpoint)
        .await
}

/// Fallback for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount(fs: PgFuseFs, config: &PgFuseConfig) -> io::Result<MountHandle> {
    let options = mount_options(config);
    let mountpoint = PathBuf::from(&config.mountpoint);
    Session::new(options).mount(fs, mountpoint).await
}
