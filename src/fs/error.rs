//! Error taxonomy for the overlay.
//!
//! Three classes of failure reach the dispatcher: errno values from the
//! underlying syscalls, malformed escapes while decoding names the underlying
//! directory produced, and programming errors such as handing an absolute
//! path to a `*at` operation. The host FUSE runtime only understands errno,
//! so everything funnels through [`OverlayError::errno`] at the callback
//! boundary; no failure is allowed to escape a callback.

use std::ffi::CStr;
use std::fmt;
use std::io;

use crate::fs::encoding::MalformedEscape;

/// Result type for overlay and POSIX-adapter operations.
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Errors that can occur while servicing a filesystem callback.
#[derive(Debug)]
pub enum OverlayError {
    /// An errno from the underlying filesystem. Propagated to the host
    /// unchanged, so callers see ordinary POSIX semantics (ENOENT,
    /// ENAMETOOLONG, ...).
    Sys(libc::c_int),

    /// A physical name in the underlying directory failed to decode.
    ///
    /// Only the overlay writes physical names, so this means some other
    /// program put an entry with a stray `%` there. Surfaced as EIO.
    BadName(MalformedEscape),

    /// A `*at` operation was handed a path it cannot accept, e.g. one
    /// starting with `/`. The dispatcher never constructs such paths, so
    /// this is an internal bug and maps to ENOTRECOVERABLE.
    InvalidArgument(&'static str),
}

impl OverlayError {
    /// Capture the calling thread's current errno.
    pub fn last_os_error() -> Self {
        OverlayError::Sys(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// The errno the host FUSE runtime should see for this failure.
    pub fn errno(&self) -> libc::c_int {
        match self {
            OverlayError::Sys(e) => *e,
            OverlayError::BadName(_) => libc::EIO,
            OverlayError::InvalidArgument(_) => libc::ENOTRECOVERABLE,
        }
    }
}

/// Render an errno as strerror(3) text, falling back to the raw number.
fn errno_text(err: libc::c_int) -> String {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: strerror_r writes a nul-terminated string into buf on success.
    let rc = unsafe { libc::strerror_r(err, buf.as_mut_ptr(), buf.len()) };
    if rc == 0 {
        // SAFETY: the buffer is nul-terminated when strerror_r returns 0.
        let text = unsafe { CStr::from_ptr(buf.as_ptr()) };
        text.to_string_lossy().into_owned()
    } else {
        format!("errno {}", err)
    }
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::Sys(e) => write!(f, "{}", errno_text(*e)),
            OverlayError::BadName(e) => write!(f, "undecodable name: {}", e),
            OverlayError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
        }
    }
}

impl std::error::Error for OverlayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OverlayError::BadName(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MalformedEscape> for OverlayError {
    fn from(err: MalformedEscape) -> Self {
        OverlayError::BadName(err)
    }
}

impl From<io::Error> for OverlayError {
    fn from(err: io::Error) -> Self {
        OverlayError::Sys(err.raw_os_error().unwrap_or(libc::EIO))
    }
}
