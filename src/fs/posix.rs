//! Thin safe wrappers over the `*at` family of syscalls.
//!
//! Every operation here is scoped to an open directory descriptor rather
//! than the process working directory, which is what lets the overlay pin
//! the underlying tree once at mount time and survive the mount shadowing
//! its own path. Paths handed to these wrappers must be relative; an
//! absolute path is a caller bug and is rejected before reaching the kernel.
//!
//! Descriptors follow scoped acquisition: [`Dir`] and [`FileFd`] own their
//! fd via [`OwnedFd`], and [`DirStream`] owns the `DIR *` stream (and with
//! it the duplicated descriptor `fdopendir` consumed). Nothing here closes
//! a descriptor twice, including on constructor failure.

use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::fs::error::{OverlayError, OverlayResult};

/// One entry yielded by a [`DirStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number from the underlying `dirent`.
    pub ino: u64,
    /// `d_type` value (`DT_REG`, `DT_DIR`, ...; may be `DT_UNKNOWN`).
    pub kind: u8,
    /// Entry name as stored on disk, i.e. in physical spelling.
    pub name: Vec<u8>,
}

fn cstring(bytes: &[u8]) -> OverlayResult<CString> {
    CString::new(bytes).map_err(|_| OverlayError::InvalidArgument("nul byte in path"))
}

fn relative_cstring(rel: &[u8]) -> OverlayResult<CString> {
    if rel.first() == Some(&b'/') {
        return Err(OverlayError::InvalidArgument("absolute path in *at operation"));
    }
    cstring(rel)
}

fn fstat_fd(fd: RawFd) -> OverlayResult<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: fstat writes into st and we check the return value.
    let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if rc < 0 {
        return Err(OverlayError::last_os_error());
    }
    // SAFETY: fstat initialized the struct on success.
    Ok(unsafe { st.assume_init() })
}

fn fstatvfs_fd(fd: RawFd) -> OverlayResult<libc::statvfs> {
    let mut st = MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: fstatvfs writes into st and we check the return value.
    let rc = unsafe { libc::fstatvfs(fd, st.as_mut_ptr()) };
    if rc < 0 {
        return Err(OverlayError::last_os_error());
    }
    // SAFETY: fstatvfs initialized the struct on success.
    Ok(unsafe { st.assume_init() })
}

fn dup_cloexec(fd: RawFd) -> OverlayResult<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC allocates a fresh descriptor; we check the
    // return value before claiming ownership.
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new_fd < 0 {
        return Err(OverlayError::last_os_error());
    }
    // SAFETY: new_fd was just returned to us and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// An open directory on the underlying filesystem.
///
/// All child operations resolve relative to this descriptor. The mount's
/// root anchor is a `Dir` opened once at startup and held for the lifetime
/// of the mounted filesystem.
#[derive(Debug)]
pub struct Dir {
    fd: OwnedFd,
}

impl Dir {
    /// Open `path` as a directory anchor.
    pub fn open(path: &Path) -> OverlayResult<Self> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = cstring(path.as_os_str().as_bytes())?;
        let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
        // SAFETY: open doesn't modify memory and we check the return value.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd < 0 {
            return Err(OverlayError::last_os_error());
        }
        // SAFETY: we just opened this fd.
        Ok(Dir { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Duplicate the anchor, e.g. to serve an `open` of the mount root.
    pub fn try_clone(&self) -> OverlayResult<Self> {
        Ok(Dir { fd: dup_cloexec(self.fd.as_raw_fd())? })
    }

    /// fstat(2) of the directory itself.
    pub fn stat_self(&self) -> OverlayResult<libc::stat> {
        fstat_fd(self.fd.as_raw_fd())
    }

    /// fstatvfs(3) of the volume containing the directory.
    pub fn stat_vfs_self(&self) -> OverlayResult<libc::statvfs> {
        fstatvfs_fd(self.fd.as_raw_fd())
    }

    /// lstat-style stat of a child; does not follow a terminal symlink.
    pub fn link_stat_at(&self, rel: &[u8]) -> OverlayResult<libc::stat> {
        let c_rel = relative_cstring(rel)?;
        let mut st = MaybeUninit::<libc::stat>::zeroed();
        // SAFETY: fstatat writes into st and we check the return value.
        let rc = unsafe {
            libc::fstatat(
                self.fd.as_raw_fd(),
                c_rel.as_ptr(),
                st.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        // SAFETY: fstatat initialized the struct on success.
        Ok(unsafe { st.assume_init() })
    }

    fn openat(&self, rel: &[u8], flags: libc::c_int, mode: Option<libc::mode_t>) -> OverlayResult<OwnedFd> {
        let c_rel = relative_cstring(rel)?;
        // SAFETY: openat doesn't modify memory and we check the return value.
        let fd = unsafe {
            match mode {
                Some(mode) => libc::openat(
                    self.fd.as_raw_fd(),
                    c_rel.as_ptr(),
                    flags | libc::O_CLOEXEC,
                    libc::c_uint::from(mode),
                ),
                None => libc::openat(self.fd.as_raw_fd(), c_rel.as_ptr(), flags | libc::O_CLOEXEC),
            }
        };
        if fd < 0 {
            return Err(OverlayError::last_os_error());
        }
        // SAFETY: we just opened this fd.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// openat(2) a child as a file descriptor.
    pub fn open_file_at(&self, rel: &[u8], flags: libc::c_int) -> OverlayResult<FileFd> {
        Ok(FileFd { fd: self.openat(rel, flags, None)? })
    }

    /// openat(2) a child as a file descriptor, creating it with `mode` if
    /// the flags ask for that.
    pub fn create_file_at(
        &self,
        rel: &[u8],
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> OverlayResult<FileFd> {
        Ok(FileFd { fd: self.openat(rel, flags, Some(mode))? })
    }

    /// openat(2) a child directory.
    pub fn open_dir_at(&self, rel: &[u8]) -> OverlayResult<Dir> {
        Ok(Dir { fd: self.openat(rel, libc::O_RDONLY | libc::O_DIRECTORY, None)? })
    }

    /// mknodat(2).
    pub fn mknod_at(&self, rel: &[u8], mode: libc::mode_t, dev: libc::dev_t) -> OverlayResult<()> {
        let c_rel = relative_cstring(rel)?;
        // SAFETY: mknodat doesn't modify memory and we check the return value.
        let rc = unsafe { libc::mknodat(self.fd.as_raw_fd(), c_rel.as_ptr(), mode, dev) };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// mkdirat(2).
    pub fn mkdir_at(&self, rel: &[u8], mode: libc::mode_t) -> OverlayResult<()> {
        let c_rel = relative_cstring(rel)?;
        // SAFETY: mkdirat doesn't modify memory and we check the return value.
        let rc = unsafe { libc::mkdirat(self.fd.as_raw_fd(), c_rel.as_ptr(), mode) };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// symlinkat(2). The target is stored verbatim.
    pub fn symlink_at(&self, target: &[u8], rel: &[u8]) -> OverlayResult<()> {
        let c_target = cstring(target)?;
        let c_rel = relative_cstring(rel)?;
        // SAFETY: symlinkat doesn't modify memory and we check the return value.
        let rc = unsafe { libc::symlinkat(c_target.as_ptr(), self.fd.as_raw_fd(), c_rel.as_ptr()) };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// readlinkat(2); returns the raw target bytes.
    pub fn readlink_at(&self, rel: &[u8]) -> OverlayResult<Vec<u8>> {
        let c_rel = relative_cstring(rel)?;
        let mut buf = vec![0u8; 256];
        loop {
            // SAFETY: readlinkat writes at most buf.len() bytes into buf and
            // we check the return value.
            let n = unsafe {
                libc::readlinkat(
                    self.fd.as_raw_fd(),
                    c_rel.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(OverlayError::last_os_error());
            }
            let n = n as usize;
            if n < buf.len() {
                buf.truncate(n);
                return Ok(buf);
            }
            // Target may have been truncated; retry with more room.
            buf.resize(buf.len() * 2, 0);
        }
    }

    /// unlinkat(2), file variant.
    pub fn unlink_at(&self, rel: &[u8]) -> OverlayResult<()> {
        self.unlinkat(rel, 0)
    }

    /// unlinkat(2), directory variant.
    pub fn rmdir_at(&self, rel: &[u8]) -> OverlayResult<()> {
        self.unlinkat(rel, libc::AT_REMOVEDIR)
    }

    fn unlinkat(&self, rel: &[u8], flags: libc::c_int) -> OverlayResult<()> {
        let c_rel = relative_cstring(rel)?;
        // SAFETY: unlinkat doesn't modify memory and we check the return value.
        let rc = unsafe { libc::unlinkat(self.fd.as_raw_fd(), c_rel.as_ptr(), flags) };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// renameat(2), both paths relative to this directory.
    pub fn rename_at(&self, old_rel: &[u8], new_rel: &[u8]) -> OverlayResult<()> {
        let c_old = relative_cstring(old_rel)?;
        let c_new = relative_cstring(new_rel)?;
        // SAFETY: renameat doesn't modify memory and we check the return value.
        let rc = unsafe {
            libc::renameat(
                self.fd.as_raw_fd(),
                c_old.as_ptr(),
                self.fd.as_raw_fd(),
                c_new.as_ptr(),
            )
        };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// fchmodat(2).
    ///
    /// Follows a terminal symlink: Linux symlinks carry no mode of their
    /// own, and `AT_SYMLINK_NOFOLLOW` here is not implemented portably.
    pub fn chmod_at(&self, rel: &[u8], mode: libc::mode_t) -> OverlayResult<()> {
        let c_rel = relative_cstring(rel)?;
        // SAFETY: fchmodat doesn't modify memory and we check the return value.
        let rc = unsafe { libc::fchmodat(self.fd.as_raw_fd(), c_rel.as_ptr(), mode, 0) };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// utimensat(2), no-follow. `UTIME_OMIT`/`UTIME_NOW` markers pass through.
    pub fn utimens_at(&self, rel: &[u8], times: &[libc::timespec; 2]) -> OverlayResult<()> {
        let c_rel = relative_cstring(rel)?;
        // SAFETY: utimensat reads two timespecs from `times` and doesn't
        // modify memory; we check the return value.
        let rc = unsafe {
            libc::utimensat(
                self.fd.as_raw_fd(),
                c_rel.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }

    /// Open a seekable entry stream over this directory's children.
    pub fn stream(&self) -> OverlayResult<DirStream> {
        DirStream::new(self)
    }
}

/// A seekable cursor over the entries of a directory.
///
/// Backed by `fdopendir` on a duplicate of the parent descriptor; the
/// stream owns that duplicate and `closedir` releases both. Offsets are the
/// opaque cookies `telldir` produces: the cookie taken after yielding entry
/// *k* repositions the stream so the next read yields entry *k+1*.
#[derive(Debug)]
pub struct DirStream {
    stream: *mut libc::DIR,
}

// SAFETY: the DIR stream has no thread affinity; it is only ever accessed
// through &mut self, so it moves between threads but is never shared.
unsafe impl Send for DirStream {}

impl DirStream {
    fn new(dir: &Dir) -> OverlayResult<Self> {
        let dup = dup_cloexec(dir.fd.as_raw_fd())?;
        // SAFETY: fdopendir takes ownership of the descriptor on success;
        // on failure we still own it and OwnedFd's drop closes it.
        let stream = unsafe { libc::fdopendir(dup.as_raw_fd()) };
        if stream.is_null() {
            return Err(OverlayError::last_os_error());
        }
        // fdopendir consumed the descriptor; don't let OwnedFd close it too.
        std::mem::forget(dup);
        // The duplicate inherited the parent's read position.
        // SAFETY: stream is a valid DIR pointer.
        unsafe { libc::rewinddir(stream) };
        Ok(DirStream { stream })
    }

    /// Opaque cookie for the current position.
    pub fn offset(&self) -> i64 {
        // SAFETY: stream is a valid DIR pointer for the life of self.
        unsafe { libc::telldir(self.stream) as i64 }
    }

    /// Reposition to a cookie previously returned by [`offset`](Self::offset).
    pub fn seek(&mut self, cookie: i64) {
        // SAFETY: stream is a valid DIR pointer for the life of self.
        unsafe { libc::seekdir(self.stream, cookie as libc::c_long) };
    }

    /// Yield the next entry, or `None` at end of stream.
    pub fn read_one(&mut self) -> OverlayResult<Option<DirEntry>> {
        // readdir signals errors through errno, so clear it first to
        // distinguish "end of stream" from failure.
        // SAFETY: __errno_location returns a valid thread-local pointer.
        unsafe { *libc::__errno_location() = 0 };
        // SAFETY: stream is a valid DIR pointer for the life of self.
        let entry = unsafe { libc::readdir(self.stream) };
        if entry.is_null() {
            // SAFETY: as above.
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                return Err(OverlayError::Sys(errno));
            }
            return Ok(None);
        }
        // SAFETY: readdir returned a valid dirent whose d_name is
        // nul-terminated; the data is copied out before the next call.
        let entry = unsafe { &*entry };
        // SAFETY: d_name is nul-terminated per readdir's contract.
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Ok(Some(DirEntry {
            ino: entry.d_ino,
            kind: entry.d_type,
            name: name.to_bytes().to_vec(),
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: stream is a valid DIR pointer and is not used again.
        let rc = unsafe { libc::closedir(self.stream) };
        if rc < 0 {
            tracing::error!("closedir failed: {}", OverlayError::last_os_error());
        }
    }
}

/// An open regular file on the underlying filesystem.
///
/// All I/O is positional; there is no implicit file offset, so concurrent
/// reads and writes on the same handle do not interfere.
#[derive(Debug)]
pub struct FileFd {
    fd: OwnedFd,
}

impl From<Dir> for FileFd {
    /// Serve an `open` of the mount root from the root anchor itself.
    fn from(dir: Dir) -> Self {
        FileFd { fd: dir.fd }
    }
}

impl FileFd {
    /// fstat(2) of this file.
    pub fn stat(&self) -> OverlayResult<libc::stat> {
        fstat_fd(self.fd.as_raw_fd())
    }

    /// fstatvfs(3) of the volume containing this file.
    pub fn stat_vfs(&self) -> OverlayResult<libc::statvfs> {
        fstatvfs_fd(self.fd.as_raw_fd())
    }

    /// Read up to `len` bytes at `offset`, looping on short reads. The
    /// result is shorter than `len` only at end of file.
    pub fn read(&self, offset: i64, len: usize) -> OverlayResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut total = 0usize;
        while total < len {
            // SAFETY: the buffer has len - total bytes of room past total,
            // and we check the return value.
            let n = unsafe {
                libc::pread(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().add(total).cast(),
                    len - total,
                    offset + total as i64,
                )
            };
            if n < 0 {
                return Err(OverlayError::last_os_error());
            }
            if n == 0 {
                break;
            }
            total += n as usize;
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Write all of `data` at `offset`, looping on short writes.
    pub fn write(&self, offset: i64, data: &[u8]) -> OverlayResult<()> {
        let mut total = 0usize;
        while total < data.len() {
            // SAFETY: we pass a pointer into data with the remaining length
            // and check the return value.
            let n = unsafe {
                libc::pwrite(
                    self.fd.as_raw_fd(),
                    data.as_ptr().add(total).cast(),
                    data.len() - total,
                    offset + total as i64,
                )
            };
            if n < 0 {
                return Err(OverlayError::last_os_error());
            }
            total += n as usize;
        }
        Ok(())
    }

    /// ftruncate(2).
    pub fn truncate(&self, size: i64) -> OverlayResult<()> {
        // SAFETY: ftruncate doesn't modify memory and we check the return value.
        let rc = unsafe { libc::ftruncate(self.fd.as_raw_fd(), size) };
        if rc < 0 {
            return Err(OverlayError::last_os_error());
        }
        Ok(())
    }
}
