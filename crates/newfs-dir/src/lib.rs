#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory's contents are a flat, append-only array of 136-byte
//! [`DentryRecord`](newfs_ondisk::DentryRecord)s laid out as one byte stream
//! across the directory inode's direct blocks. Entry `i` starts at byte
//! `i * 136` of that stream, so a record may straddle two blocks.
//!
//! [`DentryTree`] mirrors those arrays lazily as an arena of dentry nodes,
//! and path resolution walks the arena.

mod entries;
mod path;
mod tree;

pub use entries::{append_entry, entry_count, max_entries, read_entries, validate_name};
pub use path::split_path;
pub use tree::{Children, DentryNode, DentryTree};
