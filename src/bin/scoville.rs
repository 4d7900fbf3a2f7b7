//! scoville CLI
//!
//! Mounts the overlay on top of the target directory. The underlying
//! directory is opened before the mount goes up, so the overlay keeps a
//! handle to the real storage even though the mount shadows its path.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use scoville::{install_signal_handlers, MountOptions, ScovilleFs, ShutdownSignal};

#[derive(Parser)]
#[command(name = "scoville")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Allow forbidden characters on VFAT file systems")]
#[command(long_about = "scoville - VFAT forbidden-character overlay\n\n\
    Mounts a filesystem on top of TARGET_DIR that accepts any file name and\n\
    stores it there under a reversible %-escaped spelling VFAT accepts.\n\
    File contents are stored unchanged.\n\n\
    Examples:\n\
      scoville /media/stick/data\n\
      scoville --allow-other /media/stick/data\n\
      scoville /media/stick/data -- noatime\n\n\
    Unmount with Ctrl+C or `fusermount -u TARGET_DIR`.")]
struct Cli {
    /// Directory to overlay; the mount goes up on this same path
    target_dir: PathBuf,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the mount
    #[arg(long, conflicts_with = "allow_other")]
    allow_root: bool,

    /// Filesystem name shown in mount output
    #[arg(long, default_value = "scoville", value_name = "NAME")]
    fsname: String,

    /// Do not unmount automatically when scoville exits
    #[arg(long)]
    no_auto_unmount: bool,

    /// Extra mount options handed to the FUSE driver verbatim
    #[arg(last = true, value_name = "FUSE_OPTIONS")]
    fuse_options: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scoville=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let fs = match ScovilleFs::open(&cli.target_dir) {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!(
                "scoville: bad mount point `{}': {}",
                cli.target_dir.display(),
                err
            );
            return ExitCode::FAILURE;
        }
    };
    info!("overlaying {}", cli.target_dir.display());

    let options = MountOptions {
        fsname: cli.fsname,
        allow_other: cli.allow_other,
        allow_root: cli.allow_root,
        auto_unmount: !cli.no_auto_unmount,
        extra: cli.fuse_options,
    };

    let shutdown = Arc::new(ShutdownSignal::new());
    if let Err(err) = install_signal_handlers(shutdown.clone()) {
        error!("failed to install signal handlers: {}", err);
        return ExitCode::FAILURE;
    }

    let session = match scoville::spawn_mount(fs, &cli.target_dir, &options) {
        Ok(session) => session,
        Err(err) => {
            error!("mount failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    while !shutdown.is_signaled() {
        thread::sleep(Duration::from_millis(200));
    }
    info!("unmounting on {}", shutdown.signal_name());
    drop(session);

    ExitCode::SUCCESS
}
