//! Simulated block devices.
//!
//! A [`DiskDriver`](crate::DiskDriver) only accepts transfers whose position
//! and length are whole multiples of its transfer unit, and never grows past
//! its fixed capacity. Two implementations exist:
//!
//! - [`FileDiskDriver`]: a regular file, created and sized on demand.
//! - [`MemoryDiskDriver`]: an in-memory image whose storage is shared by all
//!   clones, so tests can unmount and remount the same bytes.

use crate::{DeviceConfig, DiskDriver, DriverGeometry};
use newfs_error::{FsError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

fn unaligned(what: &str, value: u64, io_size: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{what} {value} is not a multiple of io_size {io_size}"),
    )
}

/// Validate a transfer of `len` bytes at `pos` against a unit size and
/// capacity, returning the end position.
fn check_transfer(pos: u64, len: usize, io_size: u32, disk_size: u64) -> io::Result<u64> {
    let len = len as u64;
    if len == 0 || len % u64::from(io_size) != 0 {
        return Err(unaligned("transfer length", len, io_size));
    }
    if pos % u64::from(io_size) != 0 {
        return Err(unaligned("position", pos, io_size));
    }
    let end = pos
        .checked_add(len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "transfer range overflow"))?;
    if end > disk_size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("transfer [{pos}, {end}) past device end {disk_size}"),
        ));
    }
    Ok(end)
}

fn apply_seek(current: u64, disk_size: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => disk_size.checked_add_signed(delta),
    };
    target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before device start"))
}

/// File-backed simulated device.
///
/// Transfers use positional `pread`/`pwrite` at a cursor kept in the driver,
/// so `seek` never touches the file's own offset.
#[derive(Debug)]
pub struct FileDiskDriver {
    file: File,
    io_size: u32,
    disk_size: u64,
    pos: u64,
}

impl FileDiskDriver {
    /// Open (or create) the backing file described by `config`.
    ///
    /// An empty or newly created file is extended to `config.disk_size`. An
    /// existing non-empty file keeps its length, which must be a whole number
    /// of transfer units.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        if config.io_size == 0 {
            return Err(FsError::InvalidGeometry("io_size must be non-zero".to_owned()));
        }
        let io_size = u64::from(config.io_size);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create)
            .truncate(false)
            .open(&config.path)?;

        let mut disk_size = file.metadata()?.len();
        if disk_size == 0 {
            if config.disk_size == 0 || config.disk_size % io_size != 0 {
                return Err(FsError::InvalidGeometry(format!(
                    "disk_size {} is not a non-zero multiple of io_size {io_size}",
                    config.disk_size
                )));
            }
            file.set_len(config.disk_size)?;
            disk_size = config.disk_size;
            tracing::debug!(
                target: "newfs::block",
                path = %config.path.display(),
                disk_size,
                "file_driver_sized"
            );
        } else if disk_size % io_size != 0 {
            return Err(FsError::InvalidGeometry(format!(
                "device length {disk_size} is not a multiple of io_size {io_size}"
            )));
        }

        Ok(Self {
            file,
            io_size: config.io_size,
            disk_size,
            pos: 0,
        })
    }
}

impl DiskDriver for FileDiskDriver {
    fn geometry(&self) -> DriverGeometry {
        DriverGeometry {
            io_size: self.io_size,
            disk_size: self.disk_size,
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = apply_seek(self.pos, self.disk_size, pos)?;
        Ok(self.pos)
    }

    fn read_units(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let end = check_transfer(self.pos, buf.len(), self.io_size, self.disk_size)?;
        self.file.read_exact_at(buf, self.pos)?;
        self.pos = end;
        Ok(())
    }

    fn write_units(&mut self, buf: &[u8]) -> io::Result<()> {
        let end = check_transfer(self.pos, buf.len(), self.io_size, self.disk_size)?;
        self.file.write_all_at(buf, self.pos)?;
        self.pos = end;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Transfer counters kept by [`MemoryDiskDriver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Completed `read_units` calls.
    pub reads: u64,
    /// Completed `write_units` calls.
    pub writes: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
}

#[derive(Debug)]
struct MemoryImage {
    bytes: Vec<u8>,
    stats: TransferStats,
    fail_writes: bool,
    fail_nth: Option<u64>,
}

/// In-memory simulated device.
///
/// Clones share storage, counters and the write-failure switch, but each
/// clone keeps its own cursor.
#[derive(Debug, Clone)]
pub struct MemoryDiskDriver {
    image: Arc<Mutex<MemoryImage>>,
    io_size: u32,
    pos: u64,
}

impl MemoryDiskDriver {
    /// Create a zero-filled device. `disk_size` is rounded down to a whole
    /// number of transfer units.
    #[must_use]
    pub fn new(io_size: u32, disk_size: u64) -> Self {
        let io_size = io_size.max(1);
        let len = disk_size - disk_size % u64::from(io_size);
        Self {
            image: Arc::new(Mutex::new(MemoryImage {
                bytes: vec![0_u8; usize::try_from(len).unwrap_or(0)],
                stats: TransferStats::default(),
                fail_writes: false,
                fail_nth: None,
            })),
            io_size,
            pos: 0,
        }
    }

    /// Counters accumulated across every clone.
    #[must_use]
    pub fn stats(&self) -> TransferStats {
        self.image.lock().stats
    }

    /// Copy of the current device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.lock().bytes.clone()
    }

    /// When set, every subsequent `write_units` fails with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.image.lock().fail_writes = fail;
    }

    /// Fail exactly one future `write_units` call: the one after `n` more
    /// successful writes. Later writes succeed again.
    pub fn fail_nth_write(&self, n: u64) {
        self.image.lock().fail_nth = Some(n);
    }
}

impl DiskDriver for MemoryDiskDriver {
    fn geometry(&self) -> DriverGeometry {
        DriverGeometry {
            io_size: self.io_size,
            disk_size: self.image.lock().bytes.len() as u64,
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let disk_size = self.image.lock().bytes.len() as u64;
        self.pos = apply_seek(self.pos, disk_size, pos)?;
        Ok(self.pos)
    }

    fn read_units(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut image = self.image.lock();
        let end = check_transfer(self.pos, buf.len(), self.io_size, image.bytes.len() as u64)?;
        buf.copy_from_slice(&image.bytes[self.pos as usize..end as usize]);
        image.stats.reads += 1;
        image.stats.bytes_read += buf.len() as u64;
        drop(image);
        self.pos = end;
        Ok(())
    }

    fn write_units(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut image = self.image.lock();
        if image.fail_writes {
            return Err(io::Error::other("injected write failure"));
        }
        match image.fail_nth {
            Some(0) => {
                image.fail_nth = None;
                return Err(io::Error::other("injected write failure"));
            }
            Some(n) => image.fail_nth = Some(n - 1),
            None => {}
        }
        let end = check_transfer(self.pos, buf.len(), self.io_size, image.bytes.len() as u64)?;
        image.bytes[self.pos as usize..end as usize].copy_from_slice(buf);
        image.stats.writes += 1;
        image.stats.bytes_written += buf.len() as u64;
        drop(image);
        self.pos = end;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_driver_rejects_misaligned_transfers() {
        let mut dev = MemoryDiskDriver::new(512, 4096);
        let mut buf = vec![0_u8; 100];
        let err = dev.read_units(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        dev.seek(SeekFrom::Start(10)).unwrap();
        let mut buf = vec![0_u8; 512];
        let err = dev.read_units(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = dev.write_units(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn memory_driver_rejects_transfers_past_end() {
        let mut dev = MemoryDiskDriver::new(512, 1024);
        dev.seek(SeekFrom::Start(512)).unwrap();
        let mut buf = vec![0_u8; 1024];
        let err = dev.read_units(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(dev.seek(SeekFrom::Current(-2048)).is_err());
    }

    #[test]
    fn memory_driver_clones_share_storage() {
        let mut a = MemoryDiskDriver::new(512, 2048);
        let mut b = a.clone();
        a.seek(SeekFrom::Start(1024)).unwrap();
        a.write_units(&[9_u8; 512]).unwrap();

        b.seek(SeekFrom::End(-1024)).unwrap();
        let mut buf = vec![0_u8; 512];
        b.read_units(&mut buf).unwrap();
        assert_eq!(buf, vec![9_u8; 512]);

        let stats = a.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 512);
    }

    #[test]
    fn memory_driver_cursor_advances() {
        let mut dev = MemoryDiskDriver::new(512, 2048);
        dev.write_units(&[1_u8; 512]).unwrap();
        dev.write_units(&[2_u8; 512]).unwrap();
        let image = dev.snapshot();
        assert!(image[..512].iter().all(|b| *b == 1));
        assert!(image[512..1024].iter().all(|b| *b == 2));
    }

    #[test]
    fn injected_write_failure_surfaces() {
        let mut dev = MemoryDiskDriver::new(512, 2048);
        dev.set_fail_writes(true);
        assert!(dev.write_units(&[0_u8; 512]).is_err());
        dev.set_fail_writes(false);
        dev.write_units(&[0_u8; 512]).unwrap();

        dev.fail_nth_write(1);
        dev.write_units(&[0_u8; 512]).unwrap();
        assert!(dev.write_units(&[0_u8; 512]).is_err());
        dev.write_units(&[0_u8; 512]).unwrap();
    }

    #[test]
    fn file_driver_creates_and_sizes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddriver");
        let config = DeviceConfig {
            path: path.clone(),
            io_size: 512,
            disk_size: 8192,
            create: true,
        };

        let mut dev = FileDiskDriver::open(&config).unwrap();
        assert_eq!(
            dev.geometry(),
            DriverGeometry {
                io_size: 512,
                disk_size: 8192,
            }
        );
        dev.seek(SeekFrom::Start(1024)).unwrap();
        dev.write_units(&[0x42_u8; 1024]).unwrap();
        dev.close().unwrap();
        drop(dev);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 8192);
        assert!(bytes[1024..2048].iter().all(|b| *b == 0x42));
        assert!(bytes[..1024].iter().all(|b| *b == 0));
    }

    #[test]
    fn file_driver_keeps_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0_u8; 3072]).unwrap();
        let config = DeviceConfig {
            path,
            io_size: 512,
            disk_size: 1 << 20,
            create: false,
        };
        let dev = FileDiskDriver::open(&config).unwrap();
        assert_eq!(dev.geometry().disk_size, 3072);
    }

    #[test]
    fn file_driver_rejects_unaligned_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0_u8; 1000]).unwrap();
        let config = DeviceConfig {
            path,
            io_size: 512,
            ..DeviceConfig::default()
        };
        let err = FileDiskDriver::open(&config).unwrap_err();
        assert!(matches!(err, FsError::InvalidGeometry(_)));
    }

    #[test]
    fn file_driver_missing_without_create_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            path: dir.path().join("absent"),
            create: false,
            ..DeviceConfig::default()
        };
        match FileDiskDriver::open(&config).unwrap_err() {
            FsError::Io(err) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            other => panic!("expected Io(NotFound), got {other:?}"),
        }
    }
}
