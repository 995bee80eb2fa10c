//! Bring a local tree in line with a walked source by applying the diff
//! between them

use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::context::Context;
use crate::copy::copier::Copier;
use crate::copy::pending::{self, PendingWrite};
use crate::copy::{is_under, mkdir_all, node, CopyInfo};
use crate::diff::{Change, ChangeKind, SnapshotDiff};
use crate::error::{Result, SyncError};
use crate::fs::{local_path, LocalFs, ReadFs, Snapshot, WalkFs};
use crate::stat::{FileKind, Stat};

/// A directory whose metadata is restored once the diff leaves it
struct OpenDir {
    path: String,
    stat: Stat,
    target: PathBuf,
}

struct SyncState {
    copier: Copier,
    dst_root: PathBuf,
    open_dirs: Vec<OpenDir>,
    added: usize,
    modified: usize,
    deleted: usize,
}

/// Make `dst_root` match the tree walked by `fs`.
///
/// The current content of `dst_root` is diffed against `fs`: paths only
/// present locally are removed, added and modified paths are recreated
/// from `fs` and unchanged paths are left alone. Regular file content is
/// fetched concurrently with the walk of `fs`. Ownership, mode, timestamp and
/// xattr options of `info` apply to every recreated node, and its change
/// notifier receives each applied change with its kind. Filters are not
/// supported.
pub async fn sync<F>(ctx: &Context, fs: &F, dst_root: &Path, info: &CopyInfo) -> Result<()>
where
    F: WalkFs + ReadFs,
{
    if info.use_gitignore || !info.include_patterns.is_empty() || !info.exclude_patterns.is_empty() || info.only.is_some()
    {
        return Err(SyncError::copy_error(dst_root, "filters are not supported when syncing"));
    }
    mkdir_all(dst_root, 0o755, info.chown.as_ref(), info.utime)?;
    // The destination changes while changes are applied, so walk it up front
    let local = Snapshot::capture(ctx, &LocalFs::new(dst_root)).await?;

    let copier = Copier::new(dst_root, info, None)?;
    let pool = copier.pool();
    let shared = Mutex::new(SyncState {
        copier,
        dst_root: dst_root.to_path_buf(),
        open_dirs: Vec::new(),
        added: 0,
        modified: 0,
        deleted: 0,
    });
    let state = &shared;
    let (queue, queued) = mpsc::unbounded_channel();

    // Changes are applied from inside the walk: a remote source only serves
    // content while its walk is running
    let apply = async {
        let queue = queue;
        let mut diff = SnapshotDiff::new(local.into_stats());
        fs.walk(ctx, |upper| {
            let changes = diff.push(upper);
            let queue = &queue;
            async move { state.lock().await.apply_all(ctx, fs, queue, changes).await }
        })
        .await?;
        let deletes = diff.finish();
        state.lock().await.apply_all(ctx, fs, &queue, deletes).await
    };
    let writes = pending::drain(queued, |mut pending: PendingWrite<F::Reader>| async move {
        pending.write(pool).await?;
        pending.finish(&mut state.lock().await.copier)
    });
    let ((), files) = tokio::try_join!(apply, writes)?;

    let mut state = shared.into_inner();
    state.close_dirs("")?;
    info!(
        dst = %dst_root.display(),
        added = state.added,
        modified = state.modified,
        deleted = state.deleted,
        files,
        "Sync finished"
    );
    Ok(())
}

impl SyncState {
    async fn apply_all<F>(
        &mut self,
        ctx: &Context,
        fs: &F,
        queue: &mpsc::UnboundedSender<PendingWrite<F::Reader>>,
        changes: Vec<Change>,
    ) -> Result<()>
    where
        F: ReadFs,
    {
        for change in changes {
            if let Some(pending) = self.apply(ctx, fs, change).await? {
                queue
                    .send(pending)
                    .map_err(|_| SyncError::Cancelled("content writer stopped".to_string()))?;
            }
        }
        Ok(())
    }

    async fn apply<F>(&mut self, ctx: &Context, fs: &F, change: Change) -> Result<Option<PendingWrite<F::Reader>>>
    where
        F: ReadFs,
    {
        ctx.check()?;
        let target = self.dst_root.join(local_path(&change.path)?);
        self.close_dirs(&change.path)?;

        let Some(stat) = change.upper else {
            self.deleted += 1;
            remove_stale(&target).await?;
            if let Some(lower) = &change.lower {
                self.copier.notify_change(ChangeKind::Delete, &target, lower)?;
            }
            return Ok(None);
        };
        match change.kind {
            ChangeKind::Modify => self.modified += 1,
            _ => self.added += 1,
        }

        let kind = stat
            .kind()
            .ok_or_else(|| SyncError::copy_error(&target, format!("unsupported file mode {:o}", stat.mode)))?;
        let existing = node::lstat_optional(&target).await?;
        if let Some(meta) = &existing {
            if !(kind == FileKind::Directory && meta.is_dir()) {
                node::remove_all(&target, meta).await?;
            }
        }

        match kind {
            FileKind::Directory => {
                node::copy_directory_only(&target, &stat, true).await?;
                self.copier.notify_change(change.kind, &target, &stat)?;
                self.open_dirs.push(OpenDir {
                    path: change.path,
                    stat,
                    target,
                });
                return Ok(None);
            }
            FileKind::Regular if !stat.linkname.is_empty() => {
                // The inode's metadata is restored through its first path
                let first = self.dst_root.join(local_path(&stat.linkname)?);
                node::hard_link(&first, &target).await?;
                self.copier.notify_change(change.kind, &target, &stat)?;
                return Ok(None);
            }
            FileKind::Regular => {
                node::create_empty_file(&target, &stat).await?;
                let reader = fs.read_file(ctx, &change.path).await?;
                return Ok(Some(PendingWrite {
                    reader,
                    stat,
                    target,
                    copy_file_info: true,
                    target_existed: existing.is_some(),
                    notify: Some(change.kind),
                }));
            }
            FileKind::Symlink => node::symlink(&stat.linkname, &target).await?,
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
                node::create_special(&target, &stat)?;
            }
        }

        self.copier.finish(&stat, &target, true, false, false, false)?;
        self.copier.notify_change(change.kind, &target, &stat)?;
        Ok(None)
    }

    /// Restore the metadata of every open directory that does not contain `path`
    fn close_dirs(&mut self, path: &str) -> Result<()> {
        while let Some(dir) = self.open_dirs.last() {
            if !path.is_empty() && is_under(path, &dir.path) {
                break;
            }
            let Some(dir) = self.open_dirs.pop() else { break };
            self.copier.finish(&dir.stat, &dir.target, true, false, false, false)?;
        }
        Ok(())
    }
}

/// Remove a path that only exists locally. A parent that was already
/// replaced by a non-directory counts as removed.
async fn remove_stale(target: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(target).await {
        Ok(meta) => node::remove_all(target, &meta).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound || is_not_a_directory(&e) => Ok(()),
        Err(e) => Err(SyncError::copy_error(target, format!("failed to stat stale path: {}", e))),
    }
}

#[cfg(unix)]
fn is_not_a_directory(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTDIR)
}

#[cfg(not(unix))]
fn is_not_a_directory(_: &std::io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_remove_stale_below_replaced_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("was-a-dir"), b"now a file").unwrap();

        remove_stale(&dir.path().join("was-a-dir/child")).await.unwrap();
        remove_stale(&dir.path().join("missing")).await.unwrap();
        assert!(dir.path().join("was-a-dir").is_file());
    }

    #[tokio::test]
    async fn test_filters_rejected() {
        let dir = TempDir::new().unwrap();
        let fs = crate::fs::LocalFs::new(dir.path());
        let info = CopyInfo::new().with_exclude_pattern("*.o");

        let err = sync(&Context::new(), &fs, dir.path(), &info).await.unwrap_err();
        assert!(matches!(err, SyncError::Copy { .. }), "{}", err);
    }
}
