//! Directory entry array IO.

use newfs_error::{FsError, Result};
use newfs_inode::{InodeNode, Volume, parse_to_fs_error};
use newfs_ondisk::{DENTRY_RECORD_SIZE, DentryRecord, InodeRecord};
use newfs_types::{BlockNumber, DIRECT_BLOCKS};

/// Most entries a directory can hold: `floor(8 * block_size / 136)`.
#[must_use]
pub fn max_entries(block_size: u32) -> u32 {
    (DIRECT_BLOCKS as u32 * block_size) / DENTRY_RECORD_SIZE as u32
}

/// Entries currently stored in a directory, derived from its size.
#[must_use]
pub fn entry_count(record: &InodeRecord) -> u32 {
    record.size / DENTRY_RECORD_SIZE as u32
}

/// Reject names that cannot be stored in a dentry record.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty entry name".to_owned()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument(format!(
            "entry name {name:?} contains a separator or NUL"
        )));
    }
    if name.len() > DentryRecord::MAX_NAME_BYTES {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// One contiguous piece of an entry within a single direct block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    slot: usize,
    block_offset: usize,
    record_offset: usize,
    len: usize,
}

/// Split entry `index` into the per-block pieces it occupies.
fn pieces(index: u32, block_size: u32) -> Vec<Piece> {
    let block_size = block_size as usize;
    let start = index as usize * DENTRY_RECORD_SIZE;
    let mut out = Vec::with_capacity(2);
    let mut done = 0;
    while done < DENTRY_RECORD_SIZE {
        let pos = start + done;
        let block_offset = pos % block_size;
        let len = (block_size - block_offset).min(DENTRY_RECORD_SIZE - done);
        out.push(Piece {
            slot: pos / block_size,
            block_offset,
            record_offset: done,
            len,
        });
        done += len;
    }
    out
}

/// Read every stored entry of `dir` in on-disk order.
///
/// Entries whose bytes fall in an unassigned direct slot are skipped.
pub fn read_entries(vol: &mut Volume, dir: &InodeRecord) -> Result<Vec<DentryRecord>> {
    if !dir.is_dir() {
        return Err(FsError::NotDirectory);
    }
    let block_size = vol.block_size();
    let count = entry_count(dir).min(max_entries(block_size));
    let mut blocks: [Option<Vec<u8>>; DIRECT_BLOCKS] = Default::default();
    let mut out = Vec::new();
    out.try_reserve_exact(count as usize)?;

    'entries: for index in 0..count {
        let mut raw = [0_u8; DENTRY_RECORD_SIZE];
        let parts = pieces(index, block_size);
        for part in &parts {
            let Some(block) = dir.direct(part.slot) else {
                continue 'entries;
            };
            if blocks[part.slot].is_none() {
                blocks[part.slot] = Some(vol.read_block(block)?.into_inner());
            }
            if let Some(bytes) = &blocks[part.slot] {
                raw[part.record_offset..part.record_offset + part.len]
                    .copy_from_slice(&bytes[part.block_offset..part.block_offset + part.len]);
            }
        }
        let first = BlockNumber(dir.blocks[parts[0].slot]);
        out.push(DentryRecord::parse_from_bytes(&raw).map_err(|e| parse_to_fs_error(first, &e))?);
    }
    Ok(out)
}

/// Append `entry` to directory `dir` and persist the grown inode.
///
/// Missing direct blocks are allocated on demand. On failure the inode's
/// block pointers and size are restored and any block allocated here is
/// freed, so the directory's stored entry count never changes.
pub fn append_entry(vol: &mut Volume, dir: &mut InodeNode, entry: &DentryRecord) -> Result<()> {
    if !dir.is_dir() {
        return Err(FsError::NotDirectory);
    }
    validate_name(&entry.name)?;
    let block_size = vol.block_size();
    let index = entry_count(&dir.record);
    if index >= max_entries(block_size) {
        return Err(FsError::NoSpace(format!(
            "directory inode {} holds the maximum of {} entries",
            dir.ino,
            max_entries(block_size)
        )));
    }

    let saved = dir.record;
    let mut fresh = Vec::new();
    let result = write_entry(vol, dir, index, entry, &mut fresh);
    if let Err(err) = result {
        tracing::warn!(
            target: "newfs::dir",
            dir = dir.ino.0,
            index,
            fresh_blocks = fresh.len(),
            error = %err,
            "append_entry_rollback"
        );
        dir.record = saved;
        // The failed write may have left part of the new record on disk.
        if let Err(restore_err) = vol.write_inode(dir) {
            tracing::warn!(target: "newfs::dir", dir = dir.ino.0, error = %restore_err, "append_entry_restore_failed");
        }
        for block in fresh {
            if let Err(free_err) = vol.free_data_block(block) {
                tracing::warn!(target: "newfs::dir", block = block.0, error = %free_err, "append_entry_free_failed");
            }
        }
        return Err(err);
    }
    tracing::debug!(
        target: "newfs::dir",
        dir = dir.ino.0,
        index,
        name = %entry.name,
        ino = entry.ino.0,
        "append_entry"
    );
    Ok(())
}

fn write_entry(
    vol: &mut Volume,
    dir: &mut InodeNode,
    index: u32,
    entry: &DentryRecord,
    fresh: &mut Vec<BlockNumber>,
) -> Result<()> {
    let raw = entry.to_bytes();
    for part in pieces(index, vol.block_size()) {
        let block = match dir.record.direct(part.slot) {
            Some(block) => block,
            None => {
                let block = vol.alloc_data_block()?;
                fresh.push(block);
                dir.record.blocks[part.slot] = block.0;
                block
            }
        };
        let mut buf = vol.read_block(block)?;
        buf.as_mut_slice()[part.block_offset..part.block_offset + part.len]
            .copy_from_slice(&raw[part.record_offset..part.record_offset + part.len]);
        vol.write_block(block, buf.as_slice())?;
    }
    dir.record.size += DENTRY_RECORD_SIZE as u32;
    vol.write_inode(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_inode, volume};
    use newfs_types::{InodeNumber, S_IFDIR, S_IFREG};

    fn rec(name: &str, ino: u32) -> DentryRecord {
        DentryRecord {
            name: name.to_owned(),
            ino: InodeNumber(ino),
            mode: S_IFREG | 0o644,
        }
    }

    #[test]
    fn capacity_for_1k_blocks() {
        assert_eq!(max_entries(1024), 60);
    }

    #[test]
    fn pieces_split_straddling_records() {
        // Entry 7 covers bytes 952..1088: 72 bytes in slot 0, 64 in slot 1.
        assert_eq!(
            pieces(7, 1024),
            vec![
                Piece {
                    slot: 0,
                    block_offset: 952,
                    record_offset: 0,
                    len: 72,
                },
                Piece {
                    slot: 1,
                    block_offset: 0,
                    record_offset: 72,
                    len: 64,
                },
            ]
        );
        assert_eq!(pieces(0, 1024).len(), 1);
        assert_eq!(pieces(59, 1024)[0].slot, 7);
    }

    #[test]
    fn validate_name_rules() {
        assert!(validate_name("ok").is_ok());
        assert!(validate_name(&"n".repeat(127)).is_ok());
        assert!(matches!(validate_name(&"n".repeat(128)), Err(FsError::NameTooLong)));
        assert!(matches!(validate_name(""), Err(FsError::InvalidArgument(_))));
        assert!(matches!(validate_name("a/b"), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn append_then_read_in_disk_order() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            append_entry(&mut vol, &mut dir, &rec(name, 5 + i as u32)).unwrap();
        }
        assert_eq!(dir.record.size, 3 * 136);
        assert_ne!(dir.record.blocks[0], 0);

        let reread = vol.read_inode(InodeNumber(0)).unwrap();
        assert_eq!(reread.record, dir.record);
        let names: Vec<_> = read_entries(&mut vol, &reread.record)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.ino.0))
            .collect();
        assert_eq!(
            names,
            vec![("a".to_owned(), 5), ("b".to_owned(), 6), ("c".to_owned(), 7)]
        );
    }

    #[test]
    fn straddling_entry_allocates_next_slot() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        for i in 0..7 {
            append_entry(&mut vol, &mut dir, &rec(&format!("e{i}"), 1)).unwrap();
        }
        assert_eq!(dir.record.blocks[1], 0);
        append_entry(&mut vol, &mut dir, &rec("straddle", 9)).unwrap();
        assert_ne!(dir.record.blocks[1], 0);

        let entries = read_entries(&mut vol, &dir.record).unwrap();
        assert_eq!(entries[7], rec("straddle", 9));
    }

    #[test]
    fn full_directory_is_no_space_and_unchanged() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        for i in 0..60 {
            append_entry(&mut vol, &mut dir, &rec(&format!("f{i}"), 1)).unwrap();
        }
        let before = dir.record;
        let used = vol.data_map().used();
        let err = append_entry(&mut vol, &mut dir, &rec("overflow", 1)).unwrap_err();
        assert!(matches!(err, FsError::NoSpace(_)));
        assert_eq!(dir.record, before);
        assert_eq!(vol.read_inode(InodeNumber(0)).unwrap().record.size, 60 * 136);
        assert_eq!(vol.data_map().used(), used);
        assert_eq!(read_entries(&mut vol, &dir.record).unwrap().len(), 60);
    }

    #[test]
    fn exhausted_data_bitmap_leaves_directory_unchanged() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        let before = dir.record;
        while vol.alloc_data_block().is_ok() {}
        let err = append_entry(&mut vol, &mut dir, &rec("x", 3)).unwrap_err();
        assert!(matches!(err, FsError::NoSpace(_)));
        assert_eq!(dir.record, before);
    }

    #[test]
    fn failed_record_write_frees_fresh_block() {
        let (dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        let before = dir.record;
        let used = vol.data_map().used();

        // Bitmap flush and zero-fill take two unit writes each; the fifth
        // write is the first half of the entry block.
        dev.fail_nth_write(4);
        let err = append_entry(&mut vol, &mut dir, &rec("x", 3)).unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(dir.record, before);
        assert_eq!(vol.data_map().used(), used);
        assert!(!vol.data_map().is_allocated(0));
        assert_eq!(vol.read_inode(InodeNumber(0)).unwrap().record, before);

        append_entry(&mut vol, &mut dir, &rec("x", 3)).unwrap();
        assert_eq!(dir.record.blocks[0], vol.geometry().data_block(0).0);
    }

    #[test]
    fn append_to_file_is_not_directory() {
        let (_dev, mut vol) = volume();
        let mut file = make_inode(&mut vol, S_IFREG | 0o644);
        assert!(matches!(
            append_entry(&mut vol, &mut file, &rec("x", 1)),
            Err(FsError::NotDirectory)
        ));
        assert!(matches!(
            read_entries(&mut vol, &file.record),
            Err(FsError::NotDirectory)
        ));
        let dir = make_inode(&mut vol, S_IFDIR | 0o755);
        assert!(read_entries(&mut vol, &dir.record).unwrap().is_empty());
    }

    #[test]
    fn unassigned_slot_entries_are_skipped() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        append_entry(&mut vol, &mut dir, &rec("kept", 4)).unwrap();
        let mut record = dir.record;
        // Claim two entries whose bytes would live in the unassigned slot 1+.
        record.size = 9 * 136;
        let entries = read_entries(&mut vol, &record).unwrap();
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[0].name, "kept");
    }
}
