//! Filesystem Sync Library
//!
//! The client/engine file synchronization layer of a build engine:
//! - Double-walk diffing of two sorted trees into add/modify/delete changes
//! - Content hashing of file metadata (and optionally content)
//! - A request-coalescing cache for change computations
//! - A packet protocol for walking and reading a remote tree
//! - `cp -a` style copies with include/exclude and gitignore filtering
//! - Syncing a local tree to a walked source by applying their diff

pub mod cache;
pub mod config;
pub mod context;
pub mod copy;
pub mod diff;
pub mod error;
pub mod filter;
pub mod fs;
pub mod hasher;
pub mod pool;
pub mod remote;
pub mod stat;

// Re-export main types and functions
pub use cache::{CacheHandle, ChangeCache};
pub use config::EngineConfig;
pub use context::Context;
pub use copy::{copy, receive, sync, CopyInfo, Owner};
pub use diff::{same_file, Change, ChangeKind, DiffEngine, SnapshotDiff};
pub use error::{Result, SyncError};
pub use filter::{GitignoreMatcher, MatchInfo, PatternMatcher};
pub use fs::{LocalFs, ReadFs, Snapshot, WalkFs};
pub use hasher::{hash_of, ContentHasher, HashAlgorithm};
pub use remote::{framed, Packet, PacketCodec, RemoteFs, Sender};
pub use stat::{compare_path, FileKind, Stat};

/// Diff two local directories, collecting every change that turns `lower`
/// into `upper`
pub async fn diff_directories(
    ctx: &Context,
    lower: impl Into<std::path::PathBuf>,
    upper: impl Into<std::path::PathBuf>,
) -> Result<Vec<Change>> {
    let lower = LocalFs::new(lower);
    let upper = LocalFs::new(upper);
    let changes = std::sync::Mutex::new(Vec::new());
    DiffEngine::new()
        .diff(ctx, &lower, &upper, |change| {
            let changes = &changes;
            async move {
                changes.lock().unwrap_or_else(|p| p.into_inner()).push(change);
                Ok(())
            }
        })
        .await?;
    Ok(changes.into_inner().unwrap_or_else(|p| p.into_inner()))
}

/// Copy `src` under `src_root` to `dst` under `dst_root` with default options
pub async fn copy_path(
    src_root: impl AsRef<std::path::Path>,
    src: &str,
    dst_root: impl AsRef<std::path::Path>,
    dst: &str,
) -> Result<()> {
    copy(&Context::new(), src_root.as_ref(), src, dst_root.as_ref(), dst, &CopyInfo::default()).await
}

// Test modules
#[cfg(test)]
mod testutil;
#[cfg(test)]
mod remote_tests;
