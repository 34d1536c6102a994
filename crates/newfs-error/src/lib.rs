#![forbid(unsafe_code)]
//! Error types for newfs.
//!
//! # Error Taxonomy
//!
//! newfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `newfs-types` | Record decoding failures detected while reading bytes |
//! | Runtime | `FsError` | `newfs-error` (this crate) | Errors returned by every engine operation |
//!
//! `newfs-error` does not depend on `newfs-types`. Parse failures are
//! converted at the crate that decodes the record: superblock decoding during
//! mount becomes `Format`, live inode and dentry decoding becomes
//! `Corruption` with the block that held the record.
//!
//! ## errno Mapping
//!
//! Every `FsError` variant maps to exactly one POSIX errno via
//! [`FsError::to_errno`]. The match is exhaustive, so a new variant does not
//! compile until it has an errno.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Unimplemented` | `ENOSYS` |
//!
//! Translating into errnos is the dispatch layer's job. The engine itself only
//! ever returns `FsError`.

use thiserror::Error;

/// Unified error type for all newfs operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Device I/O failed (wraps `std::io::Error`).
    ///
    /// Device errors propagate immediately; nothing in the engine retries.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A live on-disk record failed to decode.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The stored image is not a usable newfs volume.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Device geometry cannot be used with this build.
    ///
    /// Raised at mount time, for example when the logical block size is not
    /// a whole multiple of the device transfer unit.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bitmap is exhausted, a directory entry table is full, or a transfer
    /// would run past the end of the device.
    #[error("no space left on device: {0}")]
    NoSpace(String),

    /// A scratch buffer could not be obtained.
    #[error("out of memory")]
    OutOfMemory,

    /// Path component or directory entry not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists.
    #[error("file exists")]
    Exists,

    /// A path component or operation target is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Entry name does not fit the fixed-length on-disk name field.
    #[error("name too long")]
    NameTooLong,

    /// Operation intentionally not provided by this engine.
    #[error("operation not implemented: {0}")]
    Unimplemented(&'static str),
}

impl FsError {
    /// Convert this error into a POSIX errno suitable for kernel replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Unimplemented(_) => libc::ENOSYS,
        }
    }
}

impl From<std::collections::TryReserveError> for FsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FsError, libc::c_int)> = vec![
            (FsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (FsError::Format("test".into()), libc::EINVAL),
            (FsError::InvalidGeometry("test".into()), libc::EINVAL),
            (FsError::InvalidArgument("test".into()), libc::EINVAL),
            (FsError::NoSpace("inode bitmap".into()), libc::ENOSPC),
            (FsError::OutOfMemory, libc::ENOMEM),
            (FsError::NotFound("test".into()), libc::ENOENT),
            (FsError::Exists, libc::EEXIST),
            (FsError::NotDirectory, libc::ENOTDIR),
            (FsError::IsDirectory, libc::EISDIR),
            (FsError::NameTooLong, libc::ENAMETOOLONG),
            (FsError::Unimplemented("rename"), libc::ENOSYS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(FsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn try_reserve_failure_is_out_of_memory() {
        let mut buf: Vec<u8> = Vec::new();
        let err = buf
            .try_reserve_exact(usize::MAX)
            .map_err(FsError::from)
            .unwrap_err();
        assert!(matches!(err, FsError::OutOfMemory));
    }

    #[test]
    fn display_formatting() {
        let err = FsError::Corruption {
            block: 42,
            detail: "short dentry record".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: short dentry record"
        );
        assert_eq!(
            FsError::NoSpace("data bitmap exhausted".into()).to_string(),
            "no space left on device: data bitmap exhausted"
        );
        assert_eq!(
            FsError::Unimplemented("unlink").to_string(),
            "operation not implemented: unlink"
        );
    }
}
