//! Signal handling for graceful unmount.
//!
//! A mounted overlay should come down cleanly on SIGINT (Ctrl+C), SIGTERM,
//! or SIGHUP rather than leaving a dangling mount point behind. Handlers
//! registered here only flip atomics; the mount loop polls
//! [`ShutdownSignal::is_signaled`] and drops the background session when it
//! fires, which unmounts the filesystem.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

/// Shutdown state shared between signal handlers and the mount loop.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    signaled: AtomicBool,
    signal_num: AtomicI32,
}

impl ShutdownSignal {
    /// Create a new shutdown signal in the non-signaled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Request shutdown, recording which signal asked for it.
    pub fn trigger(&self, signal_num: i32) {
        self.signal_num.store(signal_num, Ordering::Release);
        self.signaled.store(true, Ordering::Release);
    }

    /// Name of the signal that requested shutdown, for log lines.
    pub fn signal_name(&self) -> &'static str {
        match self.signal_num.load(Ordering::Acquire) {
            SIGINT => "SIGINT",
            SIGTERM => "SIGTERM",
            SIGHUP => "SIGHUP",
            0 => "none",
            _ => "unknown",
        }
    }
}

/// Register handlers for SIGINT, SIGTERM, and SIGHUP that trip `shutdown`.
pub fn install_signal_handlers(shutdown: Arc<ShutdownSignal>) -> std::io::Result<()> {
    for signal in [SIGINT, SIGTERM, SIGHUP] {
        let shutdown = shutdown.clone();
        // SAFETY: the handler closure only touches atomics, which is
        // async-signal-safe.
        unsafe {
            signal_hook::low_level::register(signal, move || {
                shutdown.trigger(signal);
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unsignaled() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.is_signaled());
        assert_eq!(shutdown.signal_name(), "none");
    }

    #[test]
    fn trigger_records_the_signal() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger(SIGTERM);
        assert!(shutdown.is_signaled());
        assert_eq!(shutdown.signal_name(), "SIGTERM");
    }
}
