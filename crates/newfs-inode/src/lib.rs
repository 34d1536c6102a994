#![forbid(unsafe_code)]
//! Inode management.
//!
//! [`Volume`] bundles everything a mounted newfs image mutates: the device
//! adapter, the frozen geometry and both bitmap allocators. On top of it this
//! crate provides inode table IO (records packed `block_size / 44` per block)
//! and data-block allocation with zero-fill.

use newfs_alloc::{BitmapAllocator, BitmapKind};
use newfs_block::{BlockBuf, DiskIo};
use newfs_error::{FsError, Result};
use newfs_ondisk::{Geometry, INODE_RECORD_SIZE, InodeRecord};
use newfs_types::{BlockNumber, DentryId, InodeNumber, ParseError};

/// Whether a directory's entries have been materialized in the tree.
///
/// The only transition is `Unloaded -> Loaded`, and it is never undone
/// within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildrenState {
    #[default]
    Unloaded,
    Loaded,
}

/// In-memory inode: the on-disk record plus tree bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeNode {
    pub ino: InodeNumber,
    pub record: InodeRecord,
    /// Dentry that owns this inode once it is cached in the tree.
    pub dentry: Option<DentryId>,
    /// Head of the child list (directories only).
    pub first_child: Option<DentryId>,
    /// File content buffer. Content IO is not provided, so this stays empty.
    pub content: Option<Vec<u8>>,
    pub children: ChildrenState,
}

impl InodeNode {
    /// A node with tree-navigation fields cleared.
    #[must_use]
    pub fn detached(ino: InodeNumber, record: InodeRecord) -> Self {
        Self {
            ino,
            record,
            dentry: None,
            first_child: None,
            content: None,
            children: ChildrenState::Unloaded,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.record.is_dir()
    }

    #[must_use]
    pub fn children_loaded(&self) -> bool {
        self.children == ChildrenState::Loaded
    }
}

/// Map a record decoding failure on `block` to a runtime error.
#[must_use]
pub fn parse_to_fs_error(block: BlockNumber, e: &ParseError) -> FsError {
    FsError::Corruption {
        block: u64::from(block.0),
        detail: e.to_string(),
    }
}

/// A mounted image: device, geometry and both allocators.
#[derive(Debug)]
pub struct Volume {
    io: DiskIo,
    geometry: Geometry,
    inode_map: BitmapAllocator,
    data_map: BitmapAllocator,
}

impl Volume {
    #[must_use]
    pub fn new(
        io: DiskIo,
        geometry: Geometry,
        inode_map: BitmapAllocator,
        data_map: BitmapAllocator,
    ) -> Self {
        debug_assert_eq!(inode_map.kind(), BitmapKind::Inode);
        debug_assert_eq!(data_map.kind(), BitmapKind::Data);
        Self {
            io,
            geometry,
            inode_map,
            data_map,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    #[must_use]
    pub fn io(&self) -> &DiskIo {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut DiskIo {
        &mut self.io
    }

    /// Record the root inode chosen at format time.
    pub fn set_root_ino(&mut self, ino: InodeNumber) {
        self.geometry.root_ino = ino;
    }

    #[must_use]
    pub fn inode_map(&self) -> &BitmapAllocator {
        &self.inode_map
    }

    #[must_use]
    pub fn data_map(&self) -> &BitmapAllocator {
        &self.data_map
    }

    pub fn read_block(&mut self, block: BlockNumber) -> Result<BlockBuf> {
        self.io.read_block(block)
    }

    pub fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.io.write_block(block, data)
    }

    fn check_ino(&self, ino: InodeNumber) -> Result<()> {
        if ino.0 >= self.geometry.inode_count {
            return Err(FsError::InvalidArgument(format!(
                "inode {ino} out of range (capacity {})",
                self.geometry.inode_count
            )));
        }
        Ok(())
    }

    /// Read inode `ino` into a fresh detached node.
    pub fn read_inode(&mut self, ino: InodeNumber) -> Result<InodeNode> {
        self.check_ino(ino)?;
        let (block, offset) = self.geometry.inode_position(ino);
        let buf = self.io.read_block(block)?;
        let bytes = buf
            .as_slice()
            .get(offset..offset + INODE_RECORD_SIZE)
            .ok_or_else(|| FsError::Corruption {
                block: u64::from(block.0),
                detail: format!("inode {ino} record past end of block"),
            })?;
        let record = InodeRecord::parse_from_bytes(bytes).map_err(|e| parse_to_fs_error(block, &e))?;
        Ok(InodeNode::detached(ino, record))
    }

    /// Persist `node.record`, preserving neighbouring records in the block.
    pub fn write_inode(&mut self, node: &InodeNode) -> Result<()> {
        self.write_record(node.ino, &node.record)
    }

    fn write_record(&mut self, ino: InodeNumber, record: &InodeRecord) -> Result<()> {
        self.check_ino(ino)?;
        let (block, offset) = self.geometry.inode_position(ino);
        let mut buf = self.io.read_block(block)?;
        buf.as_mut_slice()[offset..offset + INODE_RECORD_SIZE].copy_from_slice(&record.to_bytes());
        self.io.write_block(block, buf.as_slice())?;
        tracing::trace!(target: "newfs::inode", ino = ino.0, block = block.0, "inode_write");
        Ok(())
    }

    /// Claim an inode number and zero its on-disk record.
    pub fn alloc_inode(&mut self) -> Result<InodeNumber> {
        let ino = InodeNumber(self.inode_map.allocate(&mut self.io)?);
        if let Err(err) = self.write_record(ino, &InodeRecord::default()) {
            tracing::warn!(target: "newfs::inode", ino = ino.0, error = %err, "inode_alloc_rollback");
            if let Err(free_err) = self.inode_map.free(&mut self.io, ino.0) {
                tracing::warn!(target: "newfs::inode", ino = ino.0, error = %free_err, "inode_rollback_failed");
            }
            return Err(err);
        }
        tracing::debug!(target: "newfs::inode", ino = ino.0, "inode_alloc");
        Ok(ino)
    }

    /// Return an inode number to the bitmap.
    pub fn free_inode(&mut self, ino: InodeNumber) -> Result<()> {
        self.check_ino(ino)?;
        self.inode_map.free(&mut self.io, ino.0)
    }

    /// Claim a data block, zero it on disk and return its absolute number.
    pub fn alloc_data_block(&mut self) -> Result<BlockNumber> {
        let index = self.data_map.allocate(&mut self.io)?;
        let block = self.geometry.data_block(index);
        let zeros = vec![0_u8; self.geometry.block_size as usize];
        if let Err(err) = self.io.write_block(block, &zeros) {
            tracing::warn!(target: "newfs::inode", block = block.0, error = %err, "data_alloc_rollback");
            if let Err(free_err) = self.data_map.free(&mut self.io, index) {
                tracing::warn!(target: "newfs::inode", block = block.0, error = %free_err, "data_rollback_failed");
            }
            return Err(err);
        }
        tracing::debug!(target: "newfs::inode", block = block.0, index, "data_alloc");
        Ok(block)
    }

    /// Return an absolute data block to the bitmap.
    pub fn free_data_block(&mut self, block: BlockNumber) -> Result<()> {
        let index = self.geometry.data_index(block).ok_or_else(|| {
            FsError::InvalidArgument(format!("block {block} is outside the data region"))
        })?;
        self.data_map.free(&mut self.io, index)
    }

    /// Write both bitmaps back in full.
    pub fn flush_bitmaps(&mut self) -> Result<()> {
        self.inode_map.flush(&mut self.io)?;
        self.data_map.flush(&mut self.io)
    }

    /// Release the device.
    pub fn close(self) -> Result<()> {
        self.io.close()
    }
}
