#![forbid(unsafe_code)]
//! Device layer for newfs.
//!
//! The simulated block device only accepts transfers whose offset and length
//! are multiples of its transfer unit (`io_size`). [`DiskIo`] is the adapter
//! that turns arbitrary byte ranges and whole logical blocks into sequences of
//! such aligned transfers against a [`DiskDriver`].

mod driver;

pub use driver::{FileDiskDriver, MemoryDiskDriver, TransferStats};

use newfs_error::{FsError, Result};
use newfs_types::BlockNumber;
use serde::{Deserialize, Serialize};
use std::io::{self, SeekFrom};
use std::path::PathBuf;

/// Transfer unit and capacity reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverGeometry {
    /// Size in bytes of the only transfer granularity the device accepts.
    pub io_size: u32,
    /// Fixed total capacity in bytes.
    pub disk_size: u64,
}

/// The block device collaborator.
///
/// `read_units` and `write_units` transfer `buf.len()` bytes at the current
/// position and advance it. The length must be a non-zero multiple of
/// `io_size` and the position must be unit-aligned.
pub trait DiskDriver: Send {
    fn geometry(&self) -> DriverGeometry;

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    fn read_units(&mut self, buf: &mut [u8]) -> io::Result<()>;

    fn write_units(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush and release the device. No transfer may follow.
    fn close(&mut self) -> io::Result<()>;
}

/// Description of the file-backed simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backing file.
    pub path: PathBuf,
    /// Transfer unit in bytes.
    pub io_size: u32,
    /// Capacity used when the backing file is created or empty.
    pub disk_size: u64,
    /// Create the backing file when it does not exist.
    pub create: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ddriver"),
            io_size: 512,
            disk_size: 4 * 1024 * 1024,
            create: true,
        }
    }
}

/// Owned block buffer.
///
/// Invariant: length == logical block size of the originating volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Obtain a zeroed scratch buffer without aborting on allocation failure.
fn scratch(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Aligned-transfer adapter over a [`DiskDriver`].
pub struct DiskIo {
    driver: Box<dyn DiskDriver>,
    io_size: u32,
    disk_size: u64,
    block_size: u32,
}

impl std::fmt::Debug for DiskIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskIo")
            .field("io_size", &self.io_size)
            .field("disk_size", &self.disk_size)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl DiskIo {
    /// Wrap `driver` for a volume with the given logical block size.
    ///
    /// The block size must be a whole multiple of the device transfer unit,
    /// otherwise block transfers could not be expressed as aligned units.
    pub fn new(driver: Box<dyn DiskDriver>, block_size: u32) -> Result<Self> {
        let DriverGeometry { io_size, disk_size } = driver.geometry();
        if io_size == 0 {
            return Err(FsError::InvalidGeometry(
                "device reports io_size=0".to_owned(),
            ));
        }
        if block_size == 0 || block_size % io_size != 0 {
            return Err(FsError::InvalidGeometry(format!(
                "block_size {block_size} is not a multiple of io_size {io_size}"
            )));
        }
        Ok(Self {
            driver,
            io_size,
            disk_size,
            block_size,
        })
    }

    #[must_use]
    pub fn io_size(&self) -> u32 {
        self.io_size
    }

    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Whole logical blocks on the device, saturated to `u32`.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        u32::try_from(self.disk_size / u64::from(self.block_size)).unwrap_or(u32::MAX)
    }

    /// Round `[offset, offset + len)` out to transfer-unit boundaries.
    fn aligned_span(&self, offset: i64, len: usize) -> Result<(u64, u64)> {
        let offset = u64::try_from(offset)
            .map_err(|_| FsError::InvalidArgument(format!("negative device offset {offset}")))?;
        let unit = u64::from(self.io_size);
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| FsError::InvalidArgument("device range overflows u64".to_owned()))?;
        let start = offset - offset % unit;
        let end = end
            .checked_next_multiple_of(unit)
            .ok_or_else(|| FsError::InvalidArgument("device range overflows u64".to_owned()))?;
        Ok((start, end))
    }

    /// Read `buf.len()` bytes starting at byte `offset`.
    pub fn read_at(&mut self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (start, end) = self.aligned_span(offset, buf.len())?;
        if end > self.disk_size {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {offset} exceeds device size {}",
                    buf.len(),
                    self.disk_size
                ),
            )));
        }
        let mut span = scratch((end - start) as usize)?;
        self.driver.seek(SeekFrom::Start(start))?;
        self.driver.read_units(&mut span)?;
        let skip = offset as u64 - start;
        buf.copy_from_slice(&span[skip as usize..skip as usize + buf.len()]);
        tracing::trace!(
            target: "newfs::block",
            offset,
            len = buf.len(),
            span_start = start,
            span_len = end - start,
            "disk_read"
        );
        Ok(())
    }

    /// Write `data` starting at byte `offset`, preserving every neighboring
    /// byte inside the aligned span.
    pub fn write_at(&mut self, offset: i64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (start, end) = self.aligned_span(offset, data.len())?;
        if end > self.disk_size {
            return Err(FsError::NoSpace(format!(
                "write of {} bytes at {offset} exceeds device size {}",
                data.len(),
                self.disk_size
            )));
        }
        let mut span = scratch((end - start) as usize)?;
        self.driver.seek(SeekFrom::Start(start))?;
        self.driver.read_units(&mut span)?;
        let skip = (offset as u64 - start) as usize;
        span[skip..skip + data.len()].copy_from_slice(data);
        self.driver.seek(SeekFrom::Start(start))?;
        self.driver.write_units(&span)?;
        tracing::trace!(
            target: "newfs::block",
            offset,
            len = data.len(),
            span_start = start,
            span_len = end - start,
            "disk_write"
        );
        Ok(())
    }

    fn block_range(&self, block: BlockNumber) -> Option<u64> {
        let base = block.to_byte_offset(self.block_size);
        let end = base.checked_add(u64::from(self.block_size))?;
        (end <= self.disk_size).then_some(base)
    }

    /// Read one logical block as `block_size / io_size` unit transfers.
    pub fn read_block(&mut self, block: BlockNumber) -> Result<BlockBuf> {
        let base = self.block_range(block).ok_or_else(|| {
            FsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block {block} is past the end of the device"),
            ))
        })?;
        let mut buf = scratch(self.block_size as usize)?;
        let unit = self.io_size as usize;
        for (k, chunk) in buf.chunks_exact_mut(unit).enumerate() {
            self.driver
                .seek(SeekFrom::Start(base + (k * unit) as u64))?;
            self.driver.read_units(chunk)?;
        }
        tracing::trace!(target: "newfs::block", block = block.0, "block_read");
        Ok(BlockBuf::new(buf))
    }

    /// Write one logical block. `data.len()` must equal the block size.
    pub fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(FsError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let base = self.block_range(block).ok_or_else(|| {
            FsError::NoSpace(format!("block {block} is past the end of the device"))
        })?;
        let unit = self.io_size as usize;
        for (k, chunk) in data.chunks_exact(unit).enumerate() {
            self.driver
                .seek(SeekFrom::Start(base + (k * unit) as u64))?;
            self.driver.write_units(chunk)?;
        }
        tracing::trace!(target: "newfs::block", block = block.0, "block_write");
        Ok(())
    }

    /// Release the underlying device.
    pub fn close(mut self) -> Result<()> {
        self.driver.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_over(dev: &MemoryDiskDriver) -> DiskIo {
        DiskIo::new(Box::new(dev.clone()), 1024).expect("disk io")
    }

    #[test]
    fn unaligned_write_preserves_neighbors() {
        let dev = MemoryDiskDriver::new(512, 4096);
        let mut io = io_over(&dev);
        io.write_at(0, &[0xAA_u8; 2048]).unwrap();
        io.write_at(500, &[0x11_u8; 30]).unwrap();

        let image = dev.snapshot();
        assert!(image[..500].iter().all(|b| *b == 0xAA));
        assert!(image[500..530].iter().all(|b| *b == 0x11));
        assert!(image[530..2048].iter().all(|b| *b == 0xAA));

        let mut out = [0_u8; 32];
        io.read_at(499, &mut out).unwrap();
        assert_eq!(out[0], 0xAA);
        assert!(out[1..31].iter().all(|b| *b == 0x11));
        assert_eq!(out[31], 0xAA);
    }

    #[test]
    fn zero_length_is_a_no_op() {
        let dev = MemoryDiskDriver::new(512, 4096);
        let mut io = io_over(&dev);
        io.write_at(4096, &[]).unwrap();
        io.read_at(1 << 40, &mut []).unwrap();
        assert_eq!(dev.stats(), TransferStats::default());
    }

    #[test]
    fn negative_offset_is_invalid_argument() {
        let dev = MemoryDiskDriver::new(512, 4096);
        let mut io = io_over(&dev);
        let mut buf = [0_u8; 4];
        assert!(matches!(
            io.read_at(-1, &mut buf),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            io.write_at(-8, &buf),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn span_past_capacity_fails_by_direction() {
        let dev = MemoryDiskDriver::new(512, 4096);
        let mut io = io_over(&dev);
        let mut buf = [0_u8; 8];
        match io.read_at(4092, &mut buf) {
            Err(FsError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io error, got {other:?}"),
        }
        assert!(matches!(io.write_at(4092, &buf), Err(FsError::NoSpace(_))));
        assert_eq!(dev.stats().writes, 0);
    }

    #[test]
    fn block_transfers_are_split_into_units() {
        let dev = MemoryDiskDriver::new(256, 8192);
        let mut io = DiskIo::new(Box::new(dev.clone()), 1024).unwrap();
        io.write_block(BlockNumber(3), &[5_u8; 1024]).unwrap();
        assert_eq!(dev.stats().writes, 4);

        let block = io.read_block(BlockNumber(3)).unwrap();
        assert_eq!(block.as_slice(), &[5_u8; 1024][..]);
        assert_eq!(dev.stats().reads, 4);
        assert!(dev.snapshot()[3072..4096].iter().all(|b| *b == 5));
    }

    #[test]
    fn block_out_of_range() {
        let dev = MemoryDiskDriver::new(512, 4096);
        let mut io = io_over(&dev);
        assert_eq!(io.block_count(), 4);
        assert!(matches!(io.read_block(BlockNumber(4)), Err(FsError::Io(_))));
        assert!(matches!(
            io.write_block(BlockNumber(4), &[0_u8; 1024]),
            Err(FsError::NoSpace(_))
        ));
        assert!(matches!(
            io.write_block(BlockNumber(0), &[0_u8; 10]),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn block_size_must_be_multiple_of_unit() {
        let dev = MemoryDiskDriver::new(768, 768 * 8);
        let err = DiskIo::new(Box::new(dev), 1024).unwrap_err();
        assert!(matches!(err, FsError::InvalidGeometry(_)));
    }

    #[test]
    fn device_errors_propagate() {
        let dev = MemoryDiskDriver::new(512, 4096);
        let mut io = io_over(&dev);
        dev.set_fail_writes(true);
        assert!(matches!(
            io.write_block(BlockNumber(0), &[1_u8; 1024]),
            Err(FsError::Io(_))
        ));
    }

    #[test]
    fn default_device_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.io_size, 512);
        assert_eq!(config.disk_size, 4 * 1024 * 1024);
        assert!(config.create);
    }
}
