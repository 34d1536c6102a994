//! Record layouts.
//!
//! ```text
//! superblock (60 bytes)
//!   0x00 magic        u32
//!   0x04 block_size   u32
//!   0x08 superblock   {offset u32, blocks u32}
//!   0x10 inode_map    {offset u32, blocks u32}
//!   0x18 data_map     {offset u32, blocks u32}
//!   0x20 inode_table  {offset u32, blocks u32}
//!   0x28 data         {offset u32, blocks u32}
//!   0x30 inode_count  u32
//!   0x34 data_count   u32
//!   0x38 root_ino     u32
//!
//! inode (44 bytes)
//!   0x00 mode u32 | 0x04 size u32 | 0x08 links u32 | 0x0C blocks[8] u32
//!
//! dentry (136 bytes)
//!   0x00 name [u8; 128] NUL-padded | 0x80 ino u32 | 0x84 mode u32
//! ```

use newfs_types::{
    BlockNumber, DIRECT_BLOCKS, InodeNumber, MAX_NAME_LEN, NEWFS_MAGIC, ParseError, ensure_slice,
    mode_is_dir, read_le_u32, trim_nul_padded, write_le_u32,
};
use serde::{Deserialize, Serialize};

pub const SUPERBLOCK_RECORD_SIZE: usize = 60;
pub const INODE_RECORD_SIZE: usize = 12 + 4 * DIRECT_BLOCKS;
pub const DENTRY_RECORD_SIZE: usize = MAX_NAME_LEN + 8;

/// A contiguous run of blocks. `offset` is a block number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub offset: u32,
    pub blocks: u32,
}

impl Region {
    #[must_use]
    pub fn start(self) -> BlockNumber {
        BlockNumber(self.offset)
    }

    /// One past the last block, widened so it cannot overflow.
    #[must_use]
    pub fn end(self) -> u64 {
        u64::from(self.offset) + u64::from(self.blocks)
    }

    fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            offset: read_le_u32(bytes, offset)?,
            blocks: read_le_u32(bytes, offset + 4)?,
        })
    }

    fn write(self, out: &mut [u8], offset: usize) {
        write_le_u32(out, offset, self.offset);
        write_le_u32(out, offset + 4, self.blocks);
    }
}

/// Persisted volume geometry, frozen at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub magic: u32,
    pub block_size: u32,
    pub superblock: Region,
    pub inode_map: Region,
    pub data_map: Region,
    pub inode_table: Region,
    pub data: Region,
    pub inode_count: u32,
    pub data_count: u32,
    pub root_ino: InodeNumber,
}

impl Geometry {
    /// Decode a superblock record, rejecting a foreign magic.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, SUPERBLOCK_RECORD_SIZE)?;
        let magic = read_le_u32(bytes, 0x00)?;
        if magic != NEWFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: NEWFS_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            magic,
            block_size: read_le_u32(bytes, 0x04)?,
            superblock: Region::parse(bytes, 0x08)?,
            inode_map: Region::parse(bytes, 0x10)?,
            data_map: Region::parse(bytes, 0x18)?,
            inode_table: Region::parse(bytes, 0x20)?,
            data: Region::parse(bytes, 0x28)?,
            inode_count: read_le_u32(bytes, 0x30)?,
            data_count: read_le_u32(bytes, 0x34)?,
            root_ino: InodeNumber(read_le_u32(bytes, 0x38)?),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_RECORD_SIZE] {
        let mut out = [0_u8; SUPERBLOCK_RECORD_SIZE];
        write_le_u32(&mut out, 0x00, self.magic);
        write_le_u32(&mut out, 0x04, self.block_size);
        self.superblock.write(&mut out, 0x08);
        self.inode_map.write(&mut out, 0x10);
        self.data_map.write(&mut out, 0x18);
        self.inode_table.write(&mut out, 0x20);
        self.data.write(&mut out, 0x28);
        write_le_u32(&mut out, 0x30, self.inode_count);
        write_le_u32(&mut out, 0x34, self.data_count);
        write_le_u32(&mut out, 0x38, self.root_ino.0);
        out
    }

    /// Inode records packed into one inode-table block.
    #[must_use]
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / INODE_RECORD_SIZE as u32
    }

    /// Inode-table block and byte offset within it holding `ino`.
    #[must_use]
    pub fn inode_position(&self, ino: InodeNumber) -> (BlockNumber, usize) {
        let per_block = self.inodes_per_block().max(1);
        let block = self.inode_table.offset + ino.0 / per_block;
        let offset = (ino.0 % per_block) as usize * INODE_RECORD_SIZE;
        (BlockNumber(block), offset)
    }

    /// Absolute block number of data-bitmap bit `index`.
    #[must_use]
    pub fn data_block(&self, index: u32) -> BlockNumber {
        BlockNumber(self.data.offset + index)
    }

    /// Data-bitmap bit owning an absolute block, if it lies in the data region.
    #[must_use]
    pub fn data_index(&self, block: BlockNumber) -> Option<u32> {
        let index = block.0.checked_sub(self.data.offset)?;
        (index < self.data_count).then_some(index)
    }

    /// Blocks past the data region that no bitmap covers.
    #[must_use]
    pub fn stranded_blocks(&self, device_blocks: u32) -> u64 {
        u64::from(device_blocks).saturating_sub(self.data.end())
    }
}

/// Fixed-size on-disk inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub mode: u32,
    pub size: u32,
    pub links: u32,
    /// Absolute block numbers. 0 marks an unassigned slot.
    pub blocks: [u32; DIRECT_BLOCKS],
}

impl InodeRecord {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_RECORD_SIZE)?;
        let mut blocks = [0_u32; DIRECT_BLOCKS];
        for (slot, value) in blocks.iter_mut().enumerate() {
            *value = read_le_u32(bytes, 0x0C + slot * 4)?;
        }
        Ok(Self {
            mode: read_le_u32(bytes, 0x00)?,
            size: read_le_u32(bytes, 0x04)?,
            links: read_le_u32(bytes, 0x08)?,
            blocks,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut out = [0_u8; INODE_RECORD_SIZE];
        write_le_u32(&mut out, 0x00, self.mode);
        write_le_u32(&mut out, 0x04, self.size);
        write_le_u32(&mut out, 0x08, self.links);
        for (slot, value) in self.blocks.iter().enumerate() {
            write_le_u32(&mut out, 0x0C + slot * 4, *value);
        }
        out
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    /// Block assigned to direct slot `slot`, if any.
    #[must_use]
    pub fn direct(&self, slot: usize) -> Option<BlockNumber> {
        match self.blocks.get(slot) {
            Some(0) | None => None,
            Some(block) => Some(BlockNumber(*block)),
        }
    }
}

/// Fixed-size on-disk directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DentryRecord {
    pub name: String,
    pub ino: InodeNumber,
    pub mode: u32,
}

impl DentryRecord {
    /// Longest name that still leaves room for the terminating NUL.
    pub const MAX_NAME_BYTES: usize = MAX_NAME_LEN - 1;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let name = ensure_slice(bytes, 0, MAX_NAME_LEN)?;
        Ok(Self {
            name: trim_nul_padded(name),
            ino: InodeNumber(read_le_u32(bytes, MAX_NAME_LEN)?),
            mode: read_le_u32(bytes, MAX_NAME_LEN + 4)?,
        })
    }

    /// Encode the record. Names are expected to be validated already; bytes
    /// past [`Self::MAX_NAME_BYTES`] are not stored.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DENTRY_RECORD_SIZE] {
        let mut out = [0_u8; DENTRY_RECORD_SIZE];
        let name = self.name.as_bytes();
        let len = name.len().min(Self::MAX_NAME_BYTES);
        out[..len].copy_from_slice(&name[..len]);
        write_le_u32(&mut out, MAX_NAME_LEN, self.ino.0);
        write_le_u32(&mut out, MAX_NAME_LEN + 4, self.mode);
        out
    }
}
