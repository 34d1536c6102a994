#![forbid(unsafe_code)]
//! Inode and data-block allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on a bitmap byte slice.
//! 2. **BitmapAllocator**: first-fit allocation over one on-disk bitmap
//!    region, written back synchronously after every mutation.
//!
//! A volume carries two allocators, one for inodes and one for data blocks.
//! Bit `i` set means resource `i` is in use. Bits are only ever cleared by an
//! explicit [`BitmapAllocator::free`], which callers use to roll back a
//! compound operation that failed part-way.

use newfs_block::DiskIo;
use newfs_error::{FsError, Result};
use newfs_ondisk::Region;
use newfs_types::BlockNumber;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_used(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut used: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_ones())
        .sum();
    if remainder > 0 && full_bytes < bitmap.len() {
        let mask = (1_u8 << remainder) - 1;
        used += (bitmap[full_bytes] & mask).count_ones();
    }
    used
}

/// Lowest clear bit in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Which resource a bitmap tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitmapKind {
    Inode,
    Data,
}

impl fmt::Display for BitmapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode => f.write_str("inode bitmap"),
            Self::Data => f.write_str("data bitmap"),
        }
    }
}

/// First-fit allocator over one bitmap region, held wholly in memory.
#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    kind: BitmapKind,
    region: Region,
    capacity: u32,
    bits: Vec<u8>,
}

fn region_bytes(region: Region, block_size: u32) -> Result<Vec<u8>> {
    let len = usize::try_from(u64::from(region.blocks) * u64::from(block_size))
        .map_err(|_| FsError::InvalidArgument("bitmap region too large".to_owned()))?;
    let mut bits = Vec::new();
    bits.try_reserve_exact(len)?;
    bits.resize(len, 0);
    Ok(bits)
}

impl BitmapAllocator {
    /// An all-clear bitmap, as written at format time.
    pub fn zeroed(
        kind: BitmapKind,
        region: Region,
        capacity: u32,
        block_size: u32,
    ) -> Result<Self> {
        let bits = region_bytes(region, block_size)?;
        Self::check_capacity(kind, capacity, &bits)?;
        Ok(Self {
            kind,
            region,
            capacity,
            bits,
        })
    }

    /// Read the bitmap region into memory verbatim.
    pub fn load(io: &mut DiskIo, kind: BitmapKind, region: Region, capacity: u32) -> Result<Self> {
        let block_size = io.block_size() as usize;
        let mut bits = region_bytes(region, io.block_size())?;
        Self::check_capacity(kind, capacity, &bits)?;
        for (k, chunk) in bits.chunks_exact_mut(block_size).enumerate() {
            let block = io.read_block(BlockNumber(region.offset + k as u32))?;
            chunk.copy_from_slice(block.as_slice());
        }
        let allocator = Self {
            kind,
            region,
            capacity,
            bits,
        };
        tracing::debug!(
            target: "newfs::alloc",
            kind = %kind,
            capacity,
            used = allocator.used(),
            "bitmap_loaded"
        );
        Ok(allocator)
    }

    fn check_capacity(kind: BitmapKind, capacity: u32, bits: &[u8]) -> Result<()> {
        if u64::from(capacity) > bits.len() as u64 * 8 {
            return Err(FsError::InvalidArgument(format!(
                "{kind} capacity {capacity} exceeds {} bits",
                bits.len() * 8
            )));
        }
        Ok(())
    }

    /// Write the whole bitmap region back to the device.
    pub fn flush(&self, io: &mut DiskIo) -> Result<()> {
        let block_size = io.block_size() as usize;
        for (k, chunk) in self.bits.chunks_exact(block_size).enumerate() {
            io.write_block(BlockNumber(self.region.offset + k as u32), chunk)?;
        }
        Ok(())
    }

    /// Claim the lowest free index and persist the bitmap.
    ///
    /// If the flush fails the bit is cleared again, so memory never holds an
    /// allocation the device does not.
    pub fn allocate(&mut self, io: &mut DiskIo) -> Result<u32> {
        let idx = bitmap_find_free(&self.bits, self.capacity)
            .ok_or_else(|| FsError::NoSpace(format!("{} exhausted", self.kind)))?;
        bitmap_set(&mut self.bits, idx);
        if let Err(err) = self.flush(io) {
            bitmap_clear(&mut self.bits, idx);
            return Err(err);
        }
        tracing::debug!(target: "newfs::alloc", kind = %self.kind, index = idx, "bitmap_allocate");
        Ok(idx)
    }

    /// Release `idx` and persist the bitmap.
    pub fn free(&mut self, io: &mut DiskIo, idx: u32) -> Result<()> {
        if idx >= self.capacity {
            return Err(FsError::InvalidArgument(format!(
                "{} index {idx} out of range (capacity {})",
                self.kind, self.capacity
            )));
        }
        let was_set = bitmap_get(&self.bits, idx);
        bitmap_clear(&mut self.bits, idx);
        if let Err(err) = self.flush(io) {
            if was_set {
                bitmap_set(&mut self.bits, idx);
            }
            return Err(err);
        }
        tracing::debug!(target: "newfs::alloc", kind = %self.kind, index = idx, "bitmap_free");
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, idx: u32) -> bool {
        idx < self.capacity && bitmap_get(&self.bits, idx)
    }

    #[must_use]
    pub fn used(&self) -> u32 {
        bitmap_count_used(&self.bits, self.capacity)
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn kind(&self) -> BitmapKind {
        self.kind
    }

    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }
}
