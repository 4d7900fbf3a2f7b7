pub mod encoding;
pub mod error;
pub mod overlay;
pub mod posix;
pub mod signal;

pub use encoding::{decode, encode, MalformedEscape};
pub use error::{OverlayError, OverlayResult};
pub use overlay::{mount, spawn_mount, MountOptions, ScovilleFs};
pub use posix::{Dir, DirEntry, DirStream, FileFd};
pub use signal::{install_signal_handlers, ShutdownSignal};
