//! The overlay filesystem: logical names in, physical names out.
//!
//! Every callback follows the same shape: encode the logical path into its
//! physical spelling, special-case the mount root, relay the operation to
//! the root anchor via a relative `*at` call, and translate any failure
//! into an errno for the kernel. Directory listings run the other way:
//! each physical entry name is decoded before it is handed back.
//!
//! File contents are never transformed; reads and writes pass straight
//! through to the underlying descriptors.
//!
//! # Layering
//!
//! The path-level `*_path` methods implement the operation table — root
//! rejections included — on logical paths, exactly as a path-based FUSE
//! binding would deliver them. The `fuser::Filesystem` impl below them is
//! adapter plumbing for fuser's inode-based surface: it keeps an
//! inode → logical-path table fed by `lookup` and pruned by `forget`, and
//! handle tables mapping the kernel's opaque `fh` integers to owned file
//! descriptors and directory streams.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::fs::encoding;
use crate::fs::error::{OverlayError, OverlayResult};
use crate::fs::posix::{Dir, DirStream, FileFd};

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Strip the leading `/` from an encoded absolute path.
///
/// Callback paths always arrive absolute; anything else would make the
/// relative `*at` call walk the wrong tree, so it is refused outright.
fn make_relative(physical: &[u8]) -> OverlayResult<&[u8]> {
    match physical.split_first() {
        Some((b'/', rest)) => Ok(rest),
        _ => Err(OverlayError::Sys(libc::ENOENT)),
    }
}

/// Append one logical name to a logical directory path.
fn join_child(parent: &[u8], name: &[u8]) -> Vec<u8> {
    let mut path = parent.to_vec();
    if path != b"/" {
        path.push(b'/');
    }
    path.extend_from_slice(name);
    path
}

fn stat_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        // nsec is a forward offset from secs even before the epoch:
        // (-5, 500_000_000) is 4.5s before, not 5s.
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::new(0, nanos as u32)
    }
}

fn file_type_of(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn dirent_type_of(d_type: u8) -> FileType {
    match d_type {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        // DT_UNKNOWN included; the caller can lstat if it cares.
        _ => FileType::RegularFile,
    }
}

fn stat_to_attr(st: &libc::stat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: stat_time(st.st_atime, st.st_atime_nsec),
        mtime: stat_time(st.st_mtime, st.st_mtime_nsec),
        ctime: stat_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_of(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn timespec_of(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        Some(TimeOrNow::SpecificTime(at)) => {
            let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(since_epoch.subsec_nanos()),
            }
        }
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

struct InodeEntry {
    /// Logical absolute path the kernel knows this inode by.
    path: Vec<u8>,
    /// Kernel lookup count; the entry dies when `forget` drains it.
    lookups: u64,
}

/// The mounted overlay.
///
/// Holds the root anchor pinning the underlying directory plus the adapter
/// tables described in the module docs. The anchor is set at construction
/// and never mutated; per-handle state lives in the handle it belongs to,
/// so stateless callbacks on distinct handles can proceed independently.
pub struct ScovilleFs {
    root: Dir,
    inodes: RwLock<FxHashMap<u64, InodeEntry>>,
    files: RwLock<FxHashMap<u64, FileFd>>,
    dirs: RwLock<FxHashMap<u64, DirStream>>,
    next_fh: AtomicU64,
}

impl ScovilleFs {
    /// Build an overlay around an already-open root anchor.
    pub fn new(root: Dir) -> Self {
        ScovilleFs {
            root,
            inodes: RwLock::new(FxHashMap::default()),
            files: RwLock::new(FxHashMap::default()),
            dirs: RwLock::new(FxHashMap::default()),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Open `target` as the underlying directory and build an overlay on it.
    pub fn open(target: &Path) -> OverlayResult<Self> {
        Ok(Self::new(Dir::open(target)?))
    }

    // ------------------------------------------------------------------
    // Path-level operations
    //
    // Logical paths in, physical effects out. These carry the root-path
    // policies; the fuser glue below never reimplements them.
    // ------------------------------------------------------------------

    /// Statistics of the volume behind `path`.
    pub fn statfs_path(&self, path: &[u8]) -> OverlayResult<libc::statvfs> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            self.root.stat_vfs_self()
        } else {
            self.root
                .open_file_at(make_relative(&physical)?, libc::O_RDONLY | libc::O_PATH)?
                .stat_vfs()
        }
    }

    /// Attributes of `path`; does not follow a terminal symlink.
    pub fn getattr_path(&self, path: &[u8]) -> OverlayResult<libc::stat> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            self.root.stat_self()
        } else {
            self.root.link_stat_at(make_relative(&physical)?)
        }
    }

    /// Open `path` as a file handle.
    pub fn open_path(&self, path: &[u8], flags: libc::c_int) -> OverlayResult<FileFd> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            Ok(FileFd::from(self.root.try_clone()?))
        } else {
            self.root.open_file_at(make_relative(&physical)?, flags)
        }
    }

    /// Create and open `path` as a file handle.
    pub fn create_path(
        &self,
        path: &[u8],
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> OverlayResult<FileFd> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            Ok(FileFd::from(self.root.try_clone()?))
        } else {
            self.root
                .create_file_at(make_relative(&physical)?, flags | libc::O_CREAT, mode)
        }
    }

    /// Truncate `path` to `size` bytes.
    pub fn truncate_path(&self, path: &[u8], size: i64) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            return Err(OverlayError::Sys(libc::EISDIR));
        }
        self.root
            .open_file_at(make_relative(&physical)?, libc::O_WRONLY)?
            .truncate(size)
    }

    /// Create a device node, FIFO, or socket at `path`.
    pub fn mknod_path(
        &self,
        path: &[u8],
        mode: libc::mode_t,
        dev: libc::dev_t,
    ) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            return Err(OverlayError::Sys(libc::EISDIR));
        }
        self.root.mknod_at(make_relative(&physical)?, mode, dev)
    }

    /// Create a directory at `path`.
    pub fn mkdir_path(&self, path: &[u8], mode: libc::mode_t) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            // That's the mount point; it exists by definition.
            return Err(OverlayError::Sys(libc::EEXIST));
        }
        self.root.mkdir_at(make_relative(&physical)?, mode)
    }

    /// Remove the file at `path`.
    pub fn unlink_path(&self, path: &[u8]) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            // Removing the root is probably a bad idea.
            return Err(OverlayError::Sys(libc::EPERM));
        }
        self.root.unlink_at(make_relative(&physical)?)
    }

    /// Remove the directory at `path`.
    pub fn rmdir_path(&self, path: &[u8]) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            return Err(OverlayError::Sys(libc::EPERM));
        }
        self.root.rmdir_at(make_relative(&physical)?)
    }

    /// Rename `old_path` to `new_path`.
    pub fn rename_path(&self, old_path: &[u8], new_path: &[u8]) -> OverlayResult<()> {
        let old_physical = encoding::encode(old_path);
        let new_physical = encoding::encode(new_path);
        if old_physical == b"/" || new_physical == b"/" {
            return Err(OverlayError::Sys(libc::EINVAL));
        }
        self.root
            .rename_at(make_relative(&old_physical)?, make_relative(&new_physical)?)
    }

    /// Change the permission bits of `path`.
    pub fn chmod_path(&self, path: &[u8], mode: libc::mode_t) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            self.root.chmod_at(b".", mode)
        } else {
            self.root.chmod_at(make_relative(&physical)?, mode)
        }
    }

    /// Set access/modification times of `path`. Either timespec may carry
    /// the `UTIME_OMIT` marker to leave that time unchanged.
    pub fn utimens_path(&self, path: &[u8], times: &[libc::timespec; 2]) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            self.root.utimens_at(b".", times)
        } else {
            self.root.utimens_at(make_relative(&physical)?, times)
        }
    }

    /// Create a symlink at `path`. The target bytes are stored verbatim;
    /// only the link's own location is encoded.
    pub fn symlink_path(&self, target: &[u8], path: &[u8]) -> OverlayResult<()> {
        let physical = encoding::encode(path);
        self.root.symlink_at(target, make_relative(&physical)?)
    }

    /// Read a symlink through the overlay.
    ///
    /// Always fails: targets are stored verbatim, so there is no way to
    /// know whether decoding one would be meaningful.
    pub fn readlink_path(&self, _path: &[u8]) -> OverlayResult<Vec<u8>> {
        Err(OverlayError::Sys(libc::EINVAL))
    }

    /// Open an entry stream over the directory at `path`.
    pub fn opendir_path(&self, path: &[u8]) -> OverlayResult<DirStream> {
        let physical = encoding::encode(path);
        if physical == b"/" {
            // Re-open the anchor rather than dup it: a dup would share the
            // anchor's kernel read offset, and concurrent root listings
            // would rewind and corrupt each other's cursors.
            self.root.open_dir_at(b".")?.stream()
        } else {
            self.root.open_dir_at(make_relative(&physical)?)?.stream()
        }
    }

    // ------------------------------------------------------------------
    // fuser adapter plumbing
    // ------------------------------------------------------------------

    fn logical_path(&self, ino: u64) -> OverlayResult<Vec<u8>> {
        if ino == FUSE_ROOT_ID {
            return Ok(b"/".to_vec());
        }
        self.inodes
            .read()
            .expect("inode table poisoned")
            .get(&ino)
            .map(|entry| entry.path.clone())
            .ok_or(OverlayError::Sys(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> OverlayResult<Vec<u8>> {
        Ok(join_child(&self.logical_path(parent)?, name.as_bytes()))
    }

    fn remember_inode(&self, ino: u64, path: Vec<u8>) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut inodes = self.inodes.write().expect("inode table poisoned");
        let entry = inodes.entry(ino).or_insert_with(|| InodeEntry {
            path: Vec::new(),
            lookups: 0,
        });
        // A rename behind our back may have moved the inode; trust the
        // path the kernel just resolved.
        entry.path = path;
        entry.lookups += 1;
    }

    fn forget_inode(&self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut inodes = self.inodes.write().expect("inode table poisoned");
        if let Some(entry) = inodes.get_mut(&ino) {
            entry.lookups = entry.lookups.saturating_sub(nlookup);
            if entry.lookups == 0 {
                inodes.remove(&ino);
            }
        }
    }

    /// Rewrite table paths after a successful rename of `old` to `new`.
    fn move_inode_paths(&self, old: &[u8], new: &[u8]) {
        let old_prefix = [old, b"/"].concat();
        let mut inodes = self.inodes.write().expect("inode table poisoned");
        for entry in inodes.values_mut() {
            if entry.path == old {
                entry.path = new.to_vec();
            } else if entry.path.starts_with(&old_prefix) {
                let mut moved = new.to_vec();
                moved.extend_from_slice(&entry.path[old.len()..]);
                entry.path = moved;
            }
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// Stat `path` and register its inode for the kernel's entry cache.
    fn lookup_entry(&self, path: Vec<u8>) -> OverlayResult<FileAttr> {
        let st = self.getattr_path(&path)?;
        let ino = st.st_ino;
        self.remember_inode(ino, path);
        Ok(stat_to_attr(&st, ino))
    }

    /// Run one callback body, funneling every failure into an errno.
    ///
    /// Syscall errors are ordinary traffic and log at debug; undecodable
    /// names and internal bugs are not, and a panic is translated rather
    /// than letting it tear down the session loop.
    fn dispatch<T>(
        &self,
        op: &'static str,
        f: impl FnOnce() -> OverlayResult<T>,
    ) -> Result<T, libc::c_int> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                match &err {
                    OverlayError::Sys(_) => debug!("{}: {}", op, err),
                    OverlayError::BadName(_) => warn!("{}: {}", op, err),
                    OverlayError::InvalidArgument(_) => error!("{}: {}", op, err),
                }
                Err(err.errno())
            }
            Err(_) => {
                error!("{}: caught unexpected panic", op);
                Err(libc::ENOTRECOVERABLE)
            }
        }
    }
}

impl fuser::Filesystem for ScovilleFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("overlay initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("overlay unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.dispatch("lookup", || {
            let path = self.child_path(parent, name)?;
            self.lookup_entry(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.forget_inode(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let result = self.dispatch("getattr", || {
            if let Some(fh) = fh {
                let files = self.files.read().expect("file table poisoned");
                let file = files.get(&fh).ok_or(OverlayError::Sys(libc::EBADF))?;
                return Ok(stat_to_attr(&file.stat()?, ino));
            }
            let path = self.logical_path(ino)?;
            let st = self.getattr_path(&path)?;
            Ok(stat_to_attr(&st, ino))
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.dispatch("setattr", || {
            if uid.is_some() || gid.is_some() {
                // Ownership changes are not part of the overlay's surface.
                return Err(OverlayError::Sys(libc::ENOSYS));
            }
            let path = self.logical_path(ino)?;

            if let Some(size) = size {
                match fh {
                    Some(fh) => {
                        let files = self.files.read().expect("file table poisoned");
                        let file = files.get(&fh).ok_or(OverlayError::Sys(libc::EBADF))?;
                        file.truncate(size as i64)?;
                    }
                    None => self.truncate_path(&path, size as i64)?,
                }
            }

            if let Some(mode) = mode {
                self.chmod_path(&path, mode as libc::mode_t)?;
            }

            if atime.is_some() || mtime.is_some() {
                self.utimens_path(&path, &[timespec_of(atime), timespec_of(mtime)])?;
            }

            let st = self.getattr_path(&path)?;
            Ok(stat_to_attr(&st, ino))
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.dispatch("mknod", || {
            let path = self.child_path(parent, name)?;
            self.mknod_path(&path, (mode & !umask) as libc::mode_t, libc::dev_t::from(rdev))?;
            self.lookup_entry(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.dispatch("mkdir", || {
            let path = self.child_path(parent, name)?;
            self.mkdir_path(&path, (mode & !umask) as libc::mode_t)?;
            self.lookup_entry(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.dispatch("unlink", || {
            let path = self.child_path(parent, name)?;
            self.unlink_path(&path)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.dispatch("rmdir", || {
            let path = self.child_path(parent, name)?;
            self.rmdir_path(&path)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.dispatch("symlink", || {
            let path = self.child_path(parent, link_name)?;
            self.symlink_path(target.as_os_str().as_bytes(), &path)?;
            self.lookup_entry(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.dispatch("readlink", || {
            let path = self.logical_path(ino)?;
            self.readlink_path(&path)
        });
        match result {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
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
        let result = self.dispatch("rename", || {
            let old_path = self.child_path(parent, name)?;
            let new_path = self.child_path(newparent, newname)?;
            self.rename_path(&old_path, &new_path)?;
            self.move_inode_paths(&old_path, &new_path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.dispatch("open", || {
            let path = self.logical_path(ino)?;
            let file = self.open_path(&path, flags)?;
            let fh = self.alloc_fh();
            self.files.write().expect("file table poisoned").insert(fh, file);
            Ok(fh)
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.dispatch("create", || {
            let path = self.child_path(parent, name)?;
            let file = self.create_path(&path, flags, (mode & !umask) as libc::mode_t)?;
            let st = file.stat()?;
            let ino = st.st_ino;
            self.remember_inode(ino, path);
            let fh = self.alloc_fh();
            self.files.write().expect("file table poisoned").insert(fh, file);
            Ok((stat_to_attr(&st, ino), fh))
        });
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.dispatch("read", || {
            if offset < 0 {
                return Err(OverlayError::Sys(libc::EINVAL));
            }
            let files = self.files.read().expect("file table poisoned");
            let file = files.get(&fh).ok_or(OverlayError::Sys(libc::EBADF))?;
            file.read(offset, size as usize)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.dispatch("write", || {
            if offset < 0 {
                return Err(OverlayError::Sys(libc::EINVAL));
            }
            let files = self.files.read().expect("file table poisoned");
            let file = files.get(&fh).ok_or(OverlayError::Sys(libc::EBADF))?;
            file.write(offset, data)?;
            Ok(data.len() as u32)
        });
        match result {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.files.write().expect("file table poisoned").remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let result = self.dispatch("opendir", || {
            let path = self.logical_path(ino)?;
            let stream = self.opendir_path(&path)?;
            let fh = self.alloc_fh();
            self.dirs.write().expect("dir table poisoned").insert(fh, stream);
            Ok(fh)
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let mut dirs = self.dirs.write().expect("dir table poisoned");
        let stream = match dirs.get_mut(&fh) {
            Some(stream) => stream,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if offset != stream.offset() {
            stream.seek(offset);
        }

        loop {
            let entry = match stream.read_one() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    debug!("readdir: {}", err);
                    reply.error(err.errno());
                    return;
                }
            };
            let logical = match encoding::decode(&entry.name) {
                Ok(name) => name,
                Err(err) => {
                    // Some other program stored a name with a stray '%'
                    // under the overlay; nothing sensible to return.
                    warn!("readdir: undecodable entry name: {}", err);
                    reply.error(libc::EIO);
                    return;
                }
            };
            let next_offset = stream.offset();
            let name = OsString::from_vec(logical);
            if reply.add(entry.ino, next_offset, dirent_type_of(entry.kind), &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.dirs.write().expect("dir table poisoned").remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let result = self.dispatch("statfs", || {
            let path = self.logical_path(ino)?;
            self.statfs_path(&path)
        });
        match result {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }
}

/// Options for mounting the overlay.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Filesystem name shown in mount output.
    pub fsname: String,
    /// Allow other users to access the mount.
    pub allow_other: bool,
    /// Allow root to access the mount.
    pub allow_root: bool,
    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,
    /// Extra options passed through to the FUSE driver verbatim.
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            fsname: "scoville".to_string(),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            extra: Vec::new(),
        }
    }
}

impl MountOptions {
    fn to_fuser_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fsname.clone()),
            MountOption::DefaultPermissions,
        ];
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        if self.allow_other {
            options.push(MountOption::AllowOther);
        } else if self.allow_root {
            options.push(MountOption::AllowRoot);
        }
        options.extend(self.extra.iter().cloned().map(MountOption::CUSTOM));
        options
    }
}

/// Mount the overlay at `mountpoint` and block until it is unmounted.
pub fn mount<P: AsRef<Path>>(
    fs: ScovilleFs,
    mountpoint: P,
    options: &MountOptions,
) -> io::Result<()> {
    fuser::mount2(fs, mountpoint.as_ref(), &options.to_fuser_options())
}

/// Mount the overlay in a background session.
///
/// Dropping the returned session unmounts the filesystem.
pub fn spawn_mount<P: AsRef<Path>>(
    fs: ScovilleFs,
    mountpoint: P,
    options: &MountOptions,
) -> io::Result<fuser::BackgroundSession> {
    fuser::spawn_mount2(fs, mountpoint.as_ref(), &options.to_fuser_options())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_relative_strips_one_slash() {
        assert_eq!(make_relative(b"/foo/bar").unwrap(), b"foo/bar");
        assert_eq!(make_relative(b"/").unwrap(), b"");
    }

    #[test]
    fn make_relative_rejects_non_absolute() {
        assert!(make_relative(b"foo").is_err());
        assert!(make_relative(b"").is_err());
    }

    #[test]
    fn join_child_handles_root_parent() {
        assert_eq!(join_child(b"/", b"file"), b"/file");
        assert_eq!(join_child(b"/dir", b"file"), b"/dir/file");
    }

    #[test]
    fn file_types_map_by_mode() {
        assert_eq!(file_type_of(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(file_type_of(libc::S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(file_type_of(libc::S_IFLNK | 0o777), FileType::Symlink);
    }

    #[test]
    fn omitted_times_become_utime_omit() {
        let ts = timespec_of(None);
        assert_eq!(ts.tv_nsec, libc::UTIME_OMIT);
        let now = timespec_of(Some(TimeOrNow::Now));
        assert_eq!(now.tv_nsec, libc::UTIME_NOW);
    }

    #[test]
    fn stat_times_survive_conversion() {
        let t = stat_time(1_700_000_000, 500_000_000);
        let since = t.duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(since.as_secs(), 1_700_000_000);
        assert_eq!(since.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn pre_epoch_stat_times_keep_their_nanos() {
        // (-5, 500_000_000) is 4.5s before the epoch.
        let t = stat_time(-5, 500_000_000);
        let before = UNIX_EPOCH.duration_since(t).unwrap();
        assert_eq!(before.as_secs(), 4);
        assert_eq!(before.subsec_nanos(), 500_000_000);
    }
}
