#![forbid(unsafe_code)]
//! On-disk format for newfs.
//!
//! Pure encoding crate: no I/O, no side effects. Converts byte slices to and
//! from the three fixed-size little-endian records a volume is made of: the
//! superblock geometry, inode records and directory-entry records.

pub mod records;

pub use records::{
    DENTRY_RECORD_SIZE, DentryRecord, Geometry, INODE_RECORD_SIZE, InodeRecord, Region,
    SUPERBLOCK_RECORD_SIZE,
};
