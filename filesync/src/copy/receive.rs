//! Materialize the entries of a walk, typically a [`RemoteFs`](crate::remote::RemoteFs),
//! under a local root

use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::context::Context;
use crate::copy::copier::{Copier, Prepared};
use crate::copy::pending::{self, PendingWrite};
use crate::copy::{is_under, mkdir_all, node, CopyInfo};
use crate::diff::ChangeKind;
use crate::error::{Result, SyncError};
use crate::filter::MatchInfo;
use crate::fs::{local_path, ReadFs, WalkFs};
use crate::stat::{FileKind, Stat};

/// An open directory whose metadata is restored once its last child is done
struct Frame {
    path: String,
    stat: Stat,
    target: PathBuf,
    include: bool,
    target_existed: bool,
    include_info: MatchInfo,
    exclude_info: MatchInfo,
}

struct ReceiveState {
    copier: Copier,
    dst_root: PathBuf,
    frames: Vec<Frame>,
    // Directory left out of the `only` set; its subtree is skipped
    skipped: Option<String>,
    count: usize,
}

/// Apply every entry `fs` walks onto `dst_root`, reading regular file
/// content through `fs`.
///
/// Filters, conflict handling, metadata restoration and change
/// notifications follow [`copy`](super::copy). Entries whose `linkname` names
/// an already received path are hardlinked to it. File content is written
/// concurrently with the walk. Gitignore rules need a local source and are
/// rejected.
pub async fn receive<F>(ctx: &Context, fs: &F, dst_root: &Path, info: &CopyInfo) -> Result<()>
where
    F: WalkFs + ReadFs,
{
    if info.use_gitignore {
        return Err(SyncError::copy_error(dst_root, "gitignore rules are not supported for walked sources"));
    }
    mkdir_all(dst_root, 0o755, info.chown.as_ref(), info.utime)?;

    let copier = Copier::new(dst_root, info, None)?;
    let pool = copier.pool();
    let shared = Mutex::new(ReceiveState {
        copier,
        dst_root: dst_root.to_path_buf(),
        frames: Vec::new(),
        skipped: None,
        count: 0,
    });
    let state = &shared;
    let (queue, queued) = mpsc::unbounded_channel();

    let walk = async {
        let queue = queue;
        fs.walk(ctx, |stat| {
            let queue = &queue;
            async move {
                if let Some(pending) = state.lock().await.apply(ctx, fs, stat).await? {
                    queue
                        .send(pending)
                        .map_err(|_| SyncError::Cancelled("content writer stopped".to_string()))?;
                }
                Ok(())
            }
        })
        .await
    };
    let writes = pending::drain(queued, |mut pending: PendingWrite<F::Reader>| async move {
        pending.write(pool).await?;
        pending.finish(&mut state.lock().await.copier)
    });
    let ((), files) = tokio::try_join!(walk, writes)?;

    let mut state = shared.into_inner();
    state.close_frames("")?;
    debug!(dst = %dst_root.display(), entries = state.count, files, "Receive finished");
    Ok(())
}

impl ReceiveState {
    /// Apply one walked entry. Regular files come back with their content
    /// still to be written.
    async fn apply<F>(&mut self, ctx: &Context, fs: &F, stat: Stat) -> Result<Option<PendingWrite<F::Reader>>>
    where
        F: ReadFs,
    {
        ctx.check()?;
        let target = self.dst_root.join(local_path(&stat.path)?);
        self.close_frames(&stat.path)?;

        if let Some(skipped) = &self.skipped {
            if is_under(&stat.path, skipped) {
                return Ok(None);
            }
            self.skipped = None;
        }
        if !self.copier.in_only_set(&stat.path) {
            if stat.is_dir() {
                self.skipped = Some(stat.path.clone());
            }
            return Ok(None);
        }

        let (parent_include, parent_exclude) = match self.frames.last() {
            Some(frame) => (frame.include_info.clone(), frame.exclude_info.clone()),
            None => Default::default(),
        };
        let filtered = self
            .copier
            .filter(&stat.path, None, stat.is_dir(), &parent_include, &parent_exclude)?;
        let kind = stat
            .kind()
            .ok_or_else(|| SyncError::copy_error(&target, format!("unsupported file mode {:o}", stat.mode)))?;

        let target_existed = match self.copier.prepare_target(&target, &stat, filtered.include, true).await? {
            Prepared::Skip => return Ok(None),
            Prepared::Ready { target_existed } => target_existed,
        };
        self.count += 1;

        match kind {
            FileKind::Directory => {
                self.copier
                    .open_directory(&target, &stat, true, filtered.include)
                    .await?;
                self.frames.push(Frame {
                    path: stat.path.clone(),
                    stat,
                    target,
                    include: filtered.include,
                    target_existed,
                    include_info: filtered.include_info,
                    exclude_info: filtered.exclude_info,
                });
                return Ok(None);
            }
            FileKind::Regular => {
                if !self.link_received(&stat, &target).await? {
                    node::create_empty_file(&target, &stat).await?;
                    let reader = fs.read_file(ctx, &stat.path).await?;
                    return Ok(Some(PendingWrite {
                        reader,
                        stat,
                        target,
                        copy_file_info: filtered.include,
                        target_existed,
                        notify: Some(ChangeKind::Add),
                    }));
                }
            }
            FileKind::Symlink => node::symlink(&stat.linkname, &target).await?,
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
                node::create_special(&target, &stat)?;
            }
        }

        self.copier
            .finish(&stat, &target, filtered.include, false, target_existed, true)?;
        Ok(None)
    }

    /// Hardlink `target` to the first received path of its inode, if that
    /// path exists
    async fn link_received(&self, stat: &Stat, target: &Path) -> Result<bool> {
        if stat.linkname.is_empty() {
            return Ok(false);
        }
        let first = self.dst_root.join(local_path(&stat.linkname)?);
        if node::lstat_optional(&first).await?.is_none() {
            return Ok(false);
        }
        node::hard_link(&first, target).await?;
        Ok(true)
    }

    /// Finish every open directory that does not contain `path`
    fn close_frames(&mut self, path: &str) -> Result<()> {
        while let Some(frame) = self.frames.last() {
            if !path.is_empty() && is_under(path, &frame.path) {
                break;
            }
            let Some(frame) = self.frames.pop() else { break };
            self.copier.close_directory();
            self.copier
                .finish(&frame.stat, &frame.target, frame.include, false, frame.target_existed, false)?;
        }
        Ok(())
    }
}
