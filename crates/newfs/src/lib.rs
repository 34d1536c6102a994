#![forbid(unsafe_code)]
//! newfs public API facade.
//!
//! Re-exports the mount session and its types from `newfs-core`, plus the
//! device configuration and drivers a caller needs to mount something.

pub use newfs_block::{DeviceConfig, DiskDriver, FileDiskDriver, MemoryDiskDriver};
pub use newfs_core::*;
