//! # scoville
//!
//! A FUSE overlay that lets programs use file names VFAT refuses.
//!
//! FAT32 and exFAT reject names containing control bytes, any of
//! `* ? < > | " : \`, or a trailing `.` or space. Mounting scoville over a
//! directory on such a volume exposes *logical* names (anything goes) while
//! storing *physical* names the volume accepts, via a reversible `%`-escape
//! encoding applied per path component. File contents pass through
//! untouched.
//!
//! ```text
//! application ──open("a*b.txt")──► FUSE ──► scoville ──openat("a%2ab.txt")──► VFAT
//! application ◄──readdir: "a*b.txt"── scoville ◄──readdir: "a%2ab.txt"── VFAT
//! ```
//!
//! The pieces:
//!
//! - [`fs::encoding`] — the bijective logical ↔ physical name codec
//! - [`fs::posix`] — `*at`-relative directory and file handles
//! - [`fs::overlay`] — the dispatcher wiring codec and handles into FUSE
//! - [`fs::signal`] — graceful unmount on SIGINT/SIGTERM/SIGHUP
//!
//! ```no_run
//! use scoville::{MountOptions, ScovilleFs};
//!
//! let fs = ScovilleFs::open("/media/stick/data".as_ref())?;
//! scoville::mount(fs, "/media/stick/data", &MountOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod fs;
pub use fs::*;
