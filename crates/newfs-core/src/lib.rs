#![forbid(unsafe_code)]
//! newfs mount session.
//!
//! [`NewFs`] is the explicit session object: it owns the mounted
//! [`Volume`] and the dentry tree, and every path-based operation goes
//! through it. A device without a valid superblock is formatted on mount.

pub mod superblock;

use newfs_block::{DeviceConfig, DiskDriver, DiskIo, FileDiskDriver};
use newfs_dir::{DentryTree, validate_name};
use newfs_inode::{InodeNode, Volume};
use newfs_ondisk::{Geometry, InodeRecord, SUPERBLOCK_RECORD_SIZE};
use newfs_types::{
    BLOCK_SIZE, DEFAULT_DIR_PERM, DEFAULT_FILE_PERM, DIRECT_BLOCKS, DentryId, InodeNumber,
    S_IFDIR, S_IFREG, mode_is_dir,
};
use serde::{Deserialize, Serialize};

pub use newfs_error::{FsError, Result};
pub use superblock::{compute_geometry, format, load, validate_geometry};

// ── VFS semantics layer ─────────────────────────────────────────────────────

/// File type as reported to the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
}

impl FileType {
    /// Anything that is not a directory is reported as a regular file.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        if mode_is_dir(mode) {
            Self::Directory
        } else {
            Self::RegularFile
        }
    }
}

/// Attributes returned by [`FsOps::getattr`].
///
/// Ownership and timestamps are not stored on disk; the dispatch layer
/// fills them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Engine inode number (0 is the root).
    pub ino: InodeNumber,
    /// Raw stored mode, type bits included.
    pub mode: u32,
    pub kind: FileType,
    /// Lower 12 bits of `mode`.
    pub perm: u16,
    pub size: u64,
    /// Stored link count, never reported as 0. The root reports 2.
    pub nlink: u32,
    /// `size` in device transfer units, rounded up.
    pub blocks: u64,
    /// Logical block size.
    pub blksize: u32,
}

impl InodeAttr {
    fn from_record(
        ino: InodeNumber,
        record: &InodeRecord,
        is_root: bool,
        io_size: u32,
        block_size: u32,
    ) -> Self {
        let nlink = if is_root { 2 } else { record.links.max(1) };
        Self {
            ino,
            mode: record.mode,
            kind: FileType::from_mode(record.mode),
            perm: (record.mode & 0o7777) as u16,
            size: u64::from(record.size),
            nlink,
            blocks: u64::from(record.size).div_ceil(u64::from(io_size.max(1))),
            blksize: block_size,
        }
    }
}

/// A directory entry returned by [`FsOps::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub kind: FileType,
    /// Entry name (a single component, not a path).
    pub name: String,
}

/// Allocation counters derived from the bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub inodes_used: u32,
    pub inodes_total: u32,
    pub blocks_used: u32,
    pub blocks_total: u32,
    /// Device blocks past the end of the data region that no bitmap covers.
    pub stranded_blocks: u64,
}

/// Path-based operations consumed by the dispatch layer.
///
/// Methods take `&mut self`: the engine serves one session from one thread,
/// and callers that share it across threads wrap it in a single lock.
///
/// - Errors are `FsError`, translated to errnos only at the dispatch boundary.
/// - Content IO, unlink, rmdir, rename and truncate are not implemented
///   and return `FsError::Unimplemented`.
pub trait FsOps {
    /// Attributes of the entry at `path`.
    fn getattr(&mut self, path: &str) -> Result<InodeAttr>;

    /// Entries of the directory at `path`, in sibling order.
    ///
    /// Returns `FsError::NotDirectory` if `path` is a file.
    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>>;

    /// Create an empty regular file. Fails with `Exists` if the name is taken.
    fn create_file(&mut self, path: &str) -> Result<InodeAttr>;

    /// Create an empty directory. Fails with `Exists` if the name is taken.
    fn create_dir(&mut self, path: &str) -> Result<InodeAttr>;

    /// Succeeds iff `path` resolves. Permission bits are not checked.
    fn access(&mut self, path: &str) -> Result<()>;

    fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>>;

    fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<u32>;

    fn unlink(&mut self, path: &str) -> Result<()>;

    fn rmdir(&mut self, path: &str) -> Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    fn truncate(&mut self, path: &str, size: u64) -> Result<()>;
}

// ── Mount session ───────────────────────────────────────────────────────────

/// A mounted newfs volume.
pub struct NewFs {
    vol: Volume,
    tree: DentryTree,
    formatted: bool,
}

impl std::fmt::Debug for NewFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewFs")
            .field("geometry", self.vol.geometry())
            .field("dentries", &self.tree.len())
            .field("formatted", &self.formatted)
            .finish_non_exhaustive()
    }
}

impl NewFs {
    /// Open the backing file described by `config` and mount it.
    pub fn mount(config: &DeviceConfig) -> Result<Self> {
        let driver = FileDiskDriver::open(config)?;
        Self::mount_with_driver(Box::new(driver))
    }

    /// Mount an already opened device.
    ///
    /// The superblock record is read first. If it cannot be read or its
    /// magic does not match, the device is formatted.
    pub fn mount_with_driver(driver: Box<dyn DiskDriver>) -> Result<Self> {
        let mut io = DiskIo::new(driver, BLOCK_SIZE)?;
        let stored = read_stored_geometry(&mut io);
        let formatted = stored.is_none();
        let mut vol = match stored {
            Some(geometry) => superblock::load(io, geometry)?,
            None => superblock::format(io)?,
        };

        let mut tree = DentryTree::new(vol.geometry().root_ino);
        let root = tree.root();
        tree.resolve_inode(&mut vol, root)?;

        let usage = usage_of(&vol);
        tracing::info!(
            target: "newfs::core",
            formatted,
            blocks = vol.io().block_count(),
            io_size = vol.io().io_size(),
            inodes_used = usage.inodes_used,
            blocks_used = usage.blocks_used,
            "mounted"
        );
        Ok(Self {
            vol,
            tree,
            formatted,
        })
    }

    /// Write the bitmaps back, drop the tree and release the device.
    pub fn unmount(mut self) -> Result<()> {
        self.vol.flush_bitmaps()?;
        let dentries = self.tree.dispose();
        self.vol.close()?;
        tracing::info!(target: "newfs::core", dentries, "unmounted");
        Ok(())
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.vol.geometry()
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        usage_of(&self.vol)
    }

    /// Whether this mount found no valid superblock and formatted the device.
    #[must_use]
    pub fn was_formatted(&self) -> bool {
        self.formatted
    }

    #[must_use]
    pub fn io_size(&self) -> u32 {
        self.vol.io().io_size()
    }

    pub fn getattr(&mut self, path: &str) -> Result<InodeAttr> {
        let id = self.tree.resolve_path(&mut self.vol, path)?;
        self.attr_of(id)
    }

    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let id = self.tree.resolve_path(&mut self.vol, path)?;
        self.tree.load_children(&mut self.vol, id)?;
        Ok(self
            .tree
            .children(id)
            .map(|child| {
                let node = self.tree.node(child);
                DirEntry {
                    ino: node.ino,
                    kind: FileType::from_mode(node.mode),
                    name: node.name.clone(),
                }
            })
            .collect())
    }

    /// Names in the directory at `path`, in sibling order.
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .read_dir(path)?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    pub fn create_file(&mut self, path: &str) -> Result<InodeAttr> {
        self.create(path, S_IFREG | DEFAULT_FILE_PERM)
    }

    pub fn create_dir(&mut self, path: &str) -> Result<InodeAttr> {
        self.create(path, S_IFDIR | DEFAULT_DIR_PERM)
    }

    pub fn access(&mut self, path: &str) -> Result<()> {
        self.tree.resolve_path(&mut self.vol, path).map(|_| ())
    }

    /// Allocate an inode, write it, then link it into the parent directory.
    /// Any failure after the allocation frees the inode bit again.
    fn create(&mut self, path: &str, mode: u32) -> Result<InodeAttr> {
        let (parent, leaf) = self.tree.resolve_parent_and_leaf(&mut self.vol, path)?;
        validate_name(&leaf)?;
        if self.tree.find_child(parent, &leaf).is_some() {
            return Err(FsError::Exists);
        }

        let ino = self.vol.alloc_inode()?;
        let node = InodeNode::detached(
            ino,
            InodeRecord {
                mode,
                size: 0,
                links: 1,
                blocks: [0; DIRECT_BLOCKS],
            },
        );
        let linked = match self.vol.write_inode(&node) {
            Ok(()) => self
                .tree
                .add_entry(&mut self.vol, parent, &leaf, ino, mode, Some(node)),
            Err(err) => Err(err),
        };
        let id = match linked {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    target: "newfs::core",
                    path,
                    ino = ino.0,
                    error = %err,
                    "create_rolled_back"
                );
                if let Err(free_err) = self.vol.free_inode(ino) {
                    tracing::warn!(
                        target: "newfs::core",
                        ino = ino.0,
                        error = %free_err,
                        "inode_free_failed"
                    );
                }
                return Err(err);
            }
        };
        tracing::debug!(target: "newfs::core", path, ino = ino.0, mode, "created");
        self.attr_of(id)
    }

    fn attr_of(&mut self, id: DentryId) -> Result<InodeAttr> {
        let io_size = self.vol.io().io_size();
        let block_size = self.vol.block_size();
        let is_root = id == self.tree.root();
        let inode = self.tree.resolve_inode(&mut self.vol, id)?;
        Ok(InodeAttr::from_record(
            inode.ino,
            &inode.record,
            is_root,
            io_size,
            block_size,
        ))
    }
}

impl FsOps for NewFs {
    fn getattr(&mut self, path: &str) -> Result<InodeAttr> {
        Self::getattr(self, path)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        Self::read_dir(self, path)
    }

    fn create_file(&mut self, path: &str) -> Result<InodeAttr> {
        Self::create_file(self, path)
    }

    fn create_dir(&mut self, path: &str) -> Result<InodeAttr> {
        Self::create_dir(self, path)
    }

    fn access(&mut self, path: &str) -> Result<()> {
        Self::access(self, path)
    }

    fn read(&mut self, _path: &str, _offset: u64, _size: u32) -> Result<Vec<u8>> {
        Err(FsError::Unimplemented("read"))
    }

    fn write(&mut self, _path: &str, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(FsError::Unimplemented("write"))
    }

    fn unlink(&mut self, _path: &str) -> Result<()> {
        Err(FsError::Unimplemented("unlink"))
    }

    fn rmdir(&mut self, _path: &str) -> Result<()> {
        Err(FsError::Unimplemented("rmdir"))
    }

    fn rename(&mut self, _from: &str, _to: &str) -> Result<()> {
        Err(FsError::Unimplemented("rename"))
    }

    fn truncate(&mut self, _path: &str, _size: u64) -> Result<()> {
        Err(FsError::Unimplemented("truncate"))
    }
}

/// Decode the superblock record, or `None` if the device needs formatting.
fn read_stored_geometry(io: &mut DiskIo) -> Option<Geometry> {
    let mut raw = [0_u8; SUPERBLOCK_RECORD_SIZE];
    if let Err(err) = io.read_at(0, &mut raw) {
        tracing::warn!(target: "newfs::core", error = %err, "superblock_unreadable");
        return None;
    }
    match Geometry::parse_from_bytes(&raw) {
        Ok(geometry) => Some(geometry),
        Err(err) => {
            tracing::debug!(target: "newfs::core", error = %err, "superblock_absent");
            None
        }
    }
}

fn usage_of(vol: &Volume) -> Usage {
    Usage {
        inodes_used: vol.inode_map().used(),
        inodes_total: vol.inode_map().capacity(),
        blocks_used: vol.data_map().used(),
        blocks_total: vol.data_map().capacity(),
        stranded_blocks: vol.geometry().stranded_blocks(vol.io().block_count()),
    }
}
