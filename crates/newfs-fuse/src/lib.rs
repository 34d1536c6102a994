#![forbid(unsafe_code)]
//! FUSE adapter for newfs.
//!
//! Kernel requests arrive through `fuser` addressed by inode number; the
//! engine is addressed by path. [`FuseState`] keeps the map between the two
//! and forwards each request to [`FsOps`]. Errors become errnos here and
//! nowhere else.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use newfs_core::{FileType as NewFsFileType, FsOps, InodeAttr, NewFs};
use newfs_error::{FsError, Result};
use newfs_types::InodeNumber;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, trace, warn};

/// TTL for cached attributes and entries. The volume is writable, so keep
/// it short.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// FUSE reserves inode 1 for the mount root.
pub const FUSE_ROOT_ID: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured context for a failed request, logged once per error reply.
pub struct FuseErrorContext<'a> {
    pub error: &'a FsError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT on lookup is routine.
        if errno == libc::ENOENT {
            trace!(
                target: "newfs::fuse",
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "fuse_op_enoent"
            );
        } else {
            warn!(
                target: "newfs::fuse",
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "fuse_op_failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

/// FUSE inode number for an engine inode. The engine root is inode 0.
#[must_use]
pub fn fuse_ino(ino: InodeNumber) -> u64 {
    u64::from(ino.0) + 1
}

fn to_fuser_file_type(ft: NewFsFileType) -> FileType {
    match ft {
        NewFsFileType::RegularFile => FileType::RegularFile,
        NewFsFileType::Directory => FileType::Directory,
    }
}

/// Build the kernel attribute record. Ownership and times are not stored on
/// disk, so they come from the caller and the clock.
fn to_file_attr(attr: &InodeAttr, uid: u32, gid: u32, now: SystemTime) -> FileAttr {
    FileAttr {
        ino: fuse_ino(attr.ino),
        size: attr.size,
        blocks: attr.blocks,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn name_str(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidArgument(format!("name {name:?} is not valid UTF-8")))
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Request translation ─────────────────────────────────────────────────────

/// One `readdir` reply entry: FUSE inode, resume offset, type and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirReplyEntry {
    pub ino: u64,
    pub offset: i64,
    pub kind: FileType,
    pub name: String,
}

/// Inode-to-path translation in front of an engine.
///
/// Every inode the kernel has been told about (through `lookup`, `readdir`
/// or a create) is remembered with its path, so later requests on that
/// inode can be resolved.
pub struct FuseState<F> {
    ops: F,
    paths: HashMap<u64, String>,
}

impl<F: std::fmt::Debug> std::fmt::Debug for FuseState<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseState")
            .field("ops", &self.ops)
            .field("known_inodes", &self.paths.len())
            .finish()
    }
}

impl<F: FsOps> FuseState<F> {
    pub fn new(ops: F) -> Self {
        let mut paths = HashMap::new();
        paths.insert(FUSE_ROOT_ID, "/".to_owned());
        Self { ops, paths }
    }

    pub fn ops(&mut self) -> &mut F {
        &mut self.ops
    }

    pub fn into_ops(self) -> F {
        self.ops
    }

    /// Path the kernel's `ino` refers to.
    pub fn path_of(&self, ino: u64) -> Result<&str> {
        self.paths
            .get(&ino)
            .map(String::as_str)
            .ok_or_else(|| FsError::NotFound(format!("fuse inode {ino}")))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String> {
        Ok(child_path(self.path_of(parent)?, name_str(name)?))
    }

    fn remember(&mut self, ino: InodeNumber, path: String) {
        self.paths.insert(fuse_ino(ino), path);
    }

    pub fn getattr(&mut self, ino: u64) -> Result<InodeAttr> {
        let path = self.path_of(ino)?.to_owned();
        self.ops.getattr(&path)
    }

    pub fn lookup(&mut self, parent: u64, name: &OsStr) -> Result<InodeAttr> {
        let path = self.child_of(parent, name)?;
        let attr = self.ops.getattr(&path)?;
        self.remember(attr.ino, path);
        Ok(attr)
    }

    /// Entries after `offset`; entry *k* of the listing carries offset *k+1*.
    pub fn readdir(&mut self, ino: u64, offset: i64) -> Result<Vec<DirReplyEntry>> {
        let path = self.path_of(ino)?.to_owned();
        let entries = self.ops.read_dir(&path)?;
        let skip = usize::try_from(offset).unwrap_or(0);
        let mut out = Vec::new();
        for (k, entry) in entries.into_iter().enumerate().skip(skip) {
            self.remember(entry.ino, child_path(&path, &entry.name));
            out.push(DirReplyEntry {
                ino: fuse_ino(entry.ino),
                offset: i64::try_from(k + 1).unwrap_or(i64::MAX),
                kind: to_fuser_file_type(entry.kind),
                name: entry.name,
            });
        }
        Ok(out)
    }

    pub fn mkdir(&mut self, parent: u64, name: &OsStr) -> Result<InodeAttr> {
        let path = self.child_of(parent, name)?;
        let attr = self.ops.create_dir(&path)?;
        self.remember(attr.ino, path);
        Ok(attr)
    }

    pub fn mknod(&mut self, parent: u64, name: &OsStr) -> Result<InodeAttr> {
        let path = self.child_of(parent, name)?;
        let attr = self.ops.create_file(&path)?;
        self.remember(attr.ino, path);
        Ok(attr)
    }

    pub fn access(&mut self, ino: u64) -> Result<()> {
        let path = self.path_of(ino)?.to_owned();
        self.ops.access(&path)
    }

    pub fn read(&mut self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let path = self.path_of(ino)?.to_owned();
        self.ops.read(&path, offset, size)
    }

    pub fn write(&mut self, ino: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let path = self.path_of(ino)?.to_owned();
        self.ops.write(&path, offset, data)
    }

    pub fn unlink(&mut self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_of(parent, name)?;
        self.ops.unlink(&path)
    }

    pub fn rmdir(&mut self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_of(parent, name)?;
        self.ops.rmdir(&path)
    }

    pub fn rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<()> {
        let from = self.child_of(parent, name)?;
        let to = self.child_of(newparent, newname)?;
        self.ops.rename(&from, &to)
    }

    /// A size change truncates. Anything else (times, mode, owner) is
    /// accepted without effect and returns the current attributes.
    pub fn setattr(&mut self, ino: u64, size: Option<u64>) -> Result<InodeAttr> {
        let path = self.path_of(ino)?.to_owned();
        if let Some(size) = size {
            self.ops.truncate(&path, size)?;
        }
        self.ops.getattr(&path)
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// `fuser` front end. The whole engine sits behind one lock; the slot is
/// emptied when the session is torn down.
pub struct NewFuse {
    state: Mutex<Option<FuseState<NewFs>>>,
}

impl std::fmt::Debug for NewFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewFuse")
            .field("mounted", &self.state.lock().is_some())
            .finish()
    }
}

impl NewFuse {
    #[must_use]
    pub fn new(fs: NewFs) -> Self {
        Self {
            state: Mutex::new(Some(FuseState::new(fs))),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FuseState<NewFs>) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| FsError::InvalidArgument("filesystem is unmounted".to_owned()))?;
        f(state)
    }

    fn reply_attr(req: &Request<'_>, attr: &InodeAttr) -> FileAttr {
        to_file_attr(attr, req.uid(), req.gid(), SystemTime::now())
    }
}

impl Filesystem for NewFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        info!(target: "newfs::fuse", "fuse_session_started");
        Ok(())
    }

    fn destroy(&mut self) {
        let Some(state) = self.state.lock().take() else {
            return;
        };
        if let Err(err) = state.into_ops().unmount() {
            warn!(target: "newfs::fuse", error = %err, "unmount_failed");
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.with_state(|s| s.getattr(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &Self::reply_attr(req, &attr)),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.with_state(|s| s.lookup(parent, name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &Self::reply_attr(req, &attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles are tracked.
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.with_state(|s| s.readdir(ino, offset)) {
            Ok(entries) => {
                for entry in &entries {
                    if reply.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: u64::try_from(offset).ok(),
                }
                .log_and_errno(),
            ),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.with_state(|s| s.mkdir(parent, name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &Self::reply_attr(req, &attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "mkdir",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.with_state(|s| s.mknod(parent, name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &Self::reply_attr(req, &attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "mknod",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.with_state(|s| s.mknod(parent, name)) {
            Ok(attr) => reply.created(&ATTR_TTL, &Self::reply_attr(req, &attr), 0, 0, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "create",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.with_state(|s| s.access(ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "access",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.with_state(|s| s.read(ino, byte_offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.with_state(|s| s.write(ino, byte_offset, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "write",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.with_state(|s| s.unlink(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "unlink",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.with_state(|s| s.rmdir(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "rmdir",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.with_state(|s| s.rename(parent, name, newparent, newname)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "rename",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.with_state(|s| s.setattr(ino, size)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &Self::reply_attr(req, &attr)),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "setattr",
                    ino,
                    offset: size,
                }
                .log_and_errno(),
            ),
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Build a list of `fuser::MountOption` from our `MountOptions`.
fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("newfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
        MountOption::RW,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// Serve `fs` at `mountpoint` until the kernel unmounts it (blocking).
///
/// The engine is unmounted when the session ends.
pub fn mount(
    fs: NewFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> std::result::Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    info!(target: "newfs::fuse", mountpoint = %mountpoint.display(), "fuse_mount");
    fuser::mount2(NewFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}
