//! Database access layer.
//!
//! Typed operations over the two relations holding the filesystem: `dir`
//! (one row per inode) and `data` (fixed-size content blocks). All
//! operations run on the caller's connection, inside whatever transaction
//! the envelope opened; no SQL text leaks out of this module.
//!
//! Submodules:
//! - [`meta`]: inode metadata, directory listing, create/delete, rename
//! - [`blocks`]: block-granular read, write and truncate
//! - [`stats`]: tablespace introspection, aggregate counters, block-size
//!   record

mod blocks;
mod meta;
mod stats;

pub use blocks::{read_buf, truncate, write_buf};
pub use meta::{
    create_dir, create_file, delete_dir, delete_file, lookup_entry, read_meta,
    read_meta_from_path, readdir, rename, write_meta, Meta,
};
pub use stats::{
    get_block_size, get_fs_blocks_used, get_fs_files_used, get_tablespace_locations,
};

/// Inode number of the filesystem root.
///
/// The root row is created by the schema, is its own parent and is never
/// deleted. Directory listings and rename path rewrites must not descend
/// into the self-reference.
pub const ROOT_INO: i64 = 0;
