//! Superblock manager: geometry computation, format and load.

use newfs_alloc::{BitmapAllocator, BitmapKind};
use newfs_block::DiskIo;
use newfs_error::{FsError, Result};
use newfs_inode::{InodeNode, Volume};
use newfs_ondisk::{Geometry, InodeRecord, Region};
use newfs_types::{
    BLOCK_SIZE, DEFAULT_DIR_PERM, InodeNumber, MIN_BLOCK_COUNT, NEWFS_MAGIC, S_IFDIR,
};

/// Lay out a volume of `block_count` blocks.
///
/// Regions are fixed at one block each for the superblock, both bitmaps and
/// the inode table. The data region takes the rest, then both capacities are
/// clamped to what one bitmap block can address. When the data bitmap is the
/// binding constraint the data region is shrunk to match and the blocks past
/// it stay unused.
pub fn compute_geometry(block_count: u32, block_size: u32) -> Result<Geometry> {
    if block_count < MIN_BLOCK_COUNT {
        return Err(FsError::NoSpace(format!(
            "device has {block_count} blocks, format needs at least {MIN_BLOCK_COUNT}"
        )));
    }
    let superblock = Region {
        offset: 0,
        blocks: 1,
    };
    let inode_map = Region {
        offset: 1,
        blocks: 1,
    };
    let data_map = Region {
        offset: 2,
        blocks: 1,
    };
    let inode_table = Region {
        offset: 3,
        blocks: 1,
    };
    let bits_per_map = block_size.saturating_mul(8);
    let table_capacity =
        (block_size / newfs_ondisk::INODE_RECORD_SIZE as u32).saturating_mul(inode_table.blocks);
    let inode_count = table_capacity.min(bits_per_map);
    let data_count = (block_count - 4).min(bits_per_map);

    Ok(Geometry {
        magic: NEWFS_MAGIC,
        block_size,
        superblock,
        inode_map,
        data_map,
        inode_table,
        data: Region {
            offset: 4,
            blocks: data_count,
        },
        inode_count,
        data_count,
        root_ino: InodeNumber(0),
    })
}

/// Check only what would otherwise index past a region or the device.
pub fn validate_geometry(geo: &Geometry, device_blocks: u32) -> Result<()> {
    let fail = |detail: String| Err(FsError::Format(detail));
    if geo.block_size != BLOCK_SIZE {
        return fail(format!(
            "block_size {} unsupported (expected {BLOCK_SIZE})",
            geo.block_size
        ));
    }
    if geo.inode_map.blocks == 0 || geo.data_map.blocks == 0 {
        return fail("bitmap region is empty".to_owned());
    }
    let bits = |region: Region| u64::from(region.blocks) * u64::from(geo.block_size) * 8;
    if u64::from(geo.inode_count) > bits(geo.inode_map) {
        return fail(format!(
            "inode_count {} exceeds inode bitmap",
            geo.inode_count
        ));
    }
    if u64::from(geo.data_count) > bits(geo.data_map) {
        return fail(format!("data_count {} exceeds data bitmap", geo.data_count));
    }
    if geo.inode_count > geo.inodes_per_block().saturating_mul(geo.inode_table.blocks) {
        return fail(format!(
            "inode_count {} exceeds inode table",
            geo.inode_count
        ));
    }
    if geo.data_count > geo.data.blocks || geo.data.offset == 0 {
        return fail("data region does not cover data_count".to_owned());
    }
    if geo.root_ino.0 >= geo.inode_count {
        return fail(format!("root inode {} out of range", geo.root_ino));
    }
    for (name, region) in [
        ("superblock", geo.superblock),
        ("inode_map", geo.inode_map),
        ("data_map", geo.data_map),
        ("inode_table", geo.inode_table),
        ("data", geo.data),
    ] {
        if region.end() > u64::from(device_blocks) {
            return fail(format!(
                "{name} region ends at block {} past device end {device_blocks}",
                region.end()
            ));
        }
    }
    Ok(())
}

/// Format the device and return the mounted volume.
///
/// Order: zeroed bitmaps, root inode, then the superblock record. A format
/// that stops early leaves no valid magic and is redone on the next mount.
pub fn format(mut io: DiskIo) -> Result<Volume> {
    let geometry = compute_geometry(io.block_count(), io.block_size())?;
    let inode_map = BitmapAllocator::zeroed(
        BitmapKind::Inode,
        geometry.inode_map,
        geometry.inode_count,
        geometry.block_size,
    )?;
    let data_map = BitmapAllocator::zeroed(
        BitmapKind::Data,
        geometry.data_map,
        geometry.data_count,
        geometry.block_size,
    )?;
    inode_map.flush(&mut io)?;
    data_map.flush(&mut io)?;

    let mut vol = Volume::new(io, geometry, inode_map, data_map);
    let root_ino = vol.alloc_inode()?;
    let root = InodeNode::detached(
        root_ino,
        InodeRecord {
            mode: S_IFDIR | DEFAULT_DIR_PERM,
            size: 0,
            links: 1,
            blocks: [0; newfs_types::DIRECT_BLOCKS],
        },
    );
    vol.write_inode(&root)?;
    vol.set_root_ino(root_ino);

    let record = vol.geometry().to_bytes();
    vol.io_mut().write_at(0, &record)?;
    let geo = vol.geometry();
    tracing::info!(
        target: "newfs::core",
        blocks = vol.io().block_count(),
        inode_count = geo.inode_count,
        data_offset = geo.data.offset,
        data_count = geo.data_count,
        root_ino = geo.root_ino.0,
        "volume_formatted"
    );
    Ok(vol)
}

/// Mount an already formatted device using its stored geometry.
pub fn load(mut io: DiskIo, geometry: Geometry) -> Result<Volume> {
    validate_geometry(&geometry, io.block_count())?;
    let inode_map = BitmapAllocator::load(
        &mut io,
        BitmapKind::Inode,
        geometry.inode_map,
        geometry.inode_count,
    )?;
    let data_map = BitmapAllocator::load(
        &mut io,
        BitmapKind::Data,
        geometry.data_map,
        geometry.data_count,
    )?;
    Ok(Volume::new(io, geometry, inode_map, data_map))
}
