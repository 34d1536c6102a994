#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Logical block size of every newfs volume.
pub const BLOCK_SIZE: u32 = 1024;
/// Direct block pointers per inode. There is no indirect addressing.
pub const DIRECT_BLOCKS: usize = 8;
/// Width of the on-disk name field, terminating NUL included.
pub const MAX_NAME_LEN: usize = 128;
/// Superblock magic ("NEWF" read little-endian).
pub const NEWFS_MAGIC: u32 = 0x4E45_5746;
/// Smallest device that can be formatted: superblock, inode bitmap, data
/// bitmap, inode table and one data block.
pub const MIN_BLOCK_COUNT: u32 = 5;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const DEFAULT_DIR_PERM: u32 = 0o755;
pub const DEFAULT_FILE_PERM: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Stable index of a node in the in-memory dentry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DentryId(pub usize);

impl DentryId {
    /// The synthesized root dentry always occupies the first arena slot.
    pub const ROOT: Self = Self(0);
}

impl BlockNumber {
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for the given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: u32) -> u64 {
        u64::from(self.0) * u64::from(block_size)
    }
}

impl InodeNumber {
    #[must_use]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DentryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// True when `mode` carries the directory type bits.
#[must_use]
pub fn mode_is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// True when `mode` carries the regular-file type bits.
#[must_use]
pub fn mode_is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Store `value` little-endian at `offset`. The caller sizes `out`.
#[inline]
pub fn write_le_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_slice_reports_short_input() {
        let data = [0_u8; 6];
        assert_eq!(ensure_slice(&data, 2, 4).unwrap(), &data[2..6]);
        assert_eq!(
            ensure_slice(&data, 4, 4).unwrap_err(),
            ParseError::InsufficientData {
                needed: 4,
                offset: 4,
                actual: 2,
            }
        );
        assert!(matches!(
            ensure_slice(&data, usize::MAX, 2),
            Err(ParseError::InvalidField { field: "offset", .. })
        ));
    }

    #[test]
    fn le_u32_write_then_read() {
        let mut buf = [0_u8; 8];
        write_le_u32(&mut buf, 4, 0xDEAD_BEEF);
        assert_eq!(buf[4..], [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(read_le_u32(&buf, 4).unwrap(), 0xDEAD_BEEF);
        assert!(read_le_u32(&buf, 6).is_err());
    }

    #[test]
    fn magic_spells_newf() {
        assert_eq!(&NEWFS_MAGIC.to_le_bytes(), b"FWEN");
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"hello\0\0\0"), "hello");
        assert_eq!(trim_nul_padded(b"a\0b"), "a");
        assert_eq!(trim_nul_padded(b"full"), "full");
        assert_eq!(trim_nul_padded(b"\0\0"), "");
    }

    #[test]
    fn mode_type_bits() {
        assert!(mode_is_dir(S_IFDIR | DEFAULT_DIR_PERM));
        assert!(!mode_is_dir(S_IFREG | DEFAULT_FILE_PERM));
        assert!(mode_is_reg(S_IFREG));
        assert!(!mode_is_reg(0));
    }

    #[test]
    fn block_number_byte_offset() {
        assert_eq!(BlockNumber(3).to_byte_offset(BLOCK_SIZE), 3072);
        assert_eq!(BlockNumber(u32::MAX).checked_add(1), None);
        assert_eq!(BlockNumber(4).checked_add(2), Some(BlockNumber(6)));
    }

    #[test]
    fn display_newtypes() {
        assert_eq!(BlockNumber(7).to_string(), "7");
        assert_eq!(InodeNumber(0).to_string(), "0");
        assert_eq!(DentryId(3).to_string(), "#3");
    }
}
