//! Shared scaffolding for overlay tests.
//!
//! Each test gets its own scratch directory standing in for the VFAT-backed
//! underlying tree, plus an overlay built on it. No FUSE mount is involved:
//! the dispatcher's path-level operations are exercised directly, and the
//! backing directory is inspected with ordinary std::fs calls to observe the
//! physical side.

#![allow(dead_code)] // Not every test file uses every helper.

use std::path::Path;

use scoville::{decode, Dir, ScovilleFs};
use tempfile::TempDir;

/// Fresh scratch directory standing in for the underlying volume.
pub fn scratch() -> TempDir {
    TempDir::new().expect("failed to create scratch directory")
}

/// Overlay rooted on `backing`.
pub fn overlay(backing: &TempDir) -> ScovilleFs {
    ScovilleFs::open(backing.path()).expect("failed to open overlay root")
}

/// Bare root anchor on `backing`, for exercising the POSIX layer directly.
pub fn anchor(backing: &TempDir) -> Dir {
    Dir::open(backing.path()).expect("failed to open root anchor")
}

/// Names stored in `dir` on the underlying filesystem, sorted.
pub fn physical_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("failed to read backing directory")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Logical names listed through the overlay at `path`, sorted, without
/// the `.` and `..` entries.
pub fn logical_names(fs: &ScovilleFs, path: &[u8]) -> Vec<Vec<u8>> {
    let mut stream = fs.opendir_path(path).expect("opendir failed");
    let mut names = Vec::new();
    while let Some(entry) = stream.read_one().expect("readdir failed") {
        let logical = decode(&entry.name).expect("entry name failed to decode");
        if logical != b"." && logical != b".." {
            names.push(logical);
        }
    }
    names.sort();
    names
}
