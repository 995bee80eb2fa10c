//! Walk and read capabilities, and their local filesystem implementation

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::stat::{compare_path, stat_from_metadata, to_slash, Stat};

/// Enumerates a tree as [`Stat`] records in [`compare_path`] order.
///
/// `f` is awaited once per entry; an error from it stops the walk and is
/// returned. The root itself is not reported.
///
/// A walk always covers the whole tree: a remote sender streams its entire
/// root and the diff pairs complete trees. To walk a subtree, root the
/// implementation there, e.g. `LocalFs::new(root.join("sub"))`.
pub trait WalkFs: Send + Sync {
    fn walk<F, Fut>(&self, ctx: &Context, f: F) -> impl Future<Output = Result<()>> + Send
    where
        F: FnMut(Stat) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send;
}

/// Opens file content by walk-relative path
pub trait ReadFs: Send + Sync {
    type Reader: AsyncRead + Send + Unpin + 'static;

    fn read_file(&self, ctx: &Context, path: &str) -> impl Future<Output = Result<Self::Reader>> + Send;
}

/// Convert a slash-separated relative path into a local relative path.
///
/// Rejects paths that do not survive the round trip through the local
/// separator, absolute paths and parent components.
pub fn local_path(path: &str) -> Result<PathBuf> {
    let local = if std::path::MAIN_SEPARATOR == '/' {
        path.to_string()
    } else {
        path.replace('/', std::path::MAIN_SEPARATOR_STR)
    };
    let local = PathBuf::from(local);
    if to_slash(&local) != path {
        return Err(SyncError::path_syntax_error(path, "contains the local path separator"));
    }
    for component in local.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(SyncError::path_syntax_error(path, "escapes the walk root"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::path_syntax_error(path, "is absolute"));
            }
        }
    }
    Ok(local)
}

/// A directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
    channel_capacity: usize,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, &EngineConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            root: root.into(),
            channel_capacity: config.walk_channel_capacity.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WalkFs for LocalFs {
    async fn walk<F, Fut>(&self, ctx: &Context, mut f: F) -> Result<()>
    where
        F: FnMut(Stat) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let root = self.root.clone();
        let producer_ctx = ctx.clone();
        let producer = tokio::task::spawn_blocking(move || walk_blocking(&root, &producer_ctx, &tx));

        let mut count = 0usize;
        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = ctx.cancelled() => return Err(ctx.cause()),
            };
            let Some(item) = item else { break };
            f(item?).await?;
            count += 1;
        }

        producer
            .await
            .map_err(|e| SyncError::walk_error(&self.root, format!("walker task failed: {}", e)))?;
        debug!(root = %self.root.display(), entries = count, "Local walk finished");
        Ok(())
    }
}

impl ReadFs for LocalFs {
    type Reader = tokio::fs::File;

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<Self::Reader> {
        ctx.check()?;
        let full = self.root.join(local_path(path)?);
        Ok(tokio::fs::File::open(&full).await?)
    }
}

/// Records captured from a finished walk, replayed in the same order
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    stats: Vec<Stat>,
}

impl Snapshot {
    /// Walk `fs` to completion and keep every record
    pub async fn capture<W: WalkFs>(ctx: &Context, fs: &W) -> Result<Self> {
        let stats = std::sync::Mutex::new(Vec::new());
        fs.walk(ctx, |stat| {
            stats.lock().unwrap_or_else(|p| p.into_inner()).push(stat);
            async { Ok(()) }
        })
        .await?;
        Ok(Self {
            stats: stats.into_inner().unwrap_or_else(|p| p.into_inner()),
        })
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn into_stats(self) -> Vec<Stat> {
        self.stats
    }
}

impl WalkFs for Snapshot {
    async fn walk<F, Fut>(&self, ctx: &Context, mut f: F) -> Result<()>
    where
        F: FnMut(Stat) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        for stat in &self.stats {
            ctx.check()?;
            f(stat.clone()).await?;
        }
        Ok(())
    }
}

/// Runs on a blocking thread; stops as soon as the receiver goes away
fn walk_blocking(root: &Path, ctx: &Context, tx: &mpsc::Sender<Result<Stat>>) {
    // (dev, ino) of multiply linked files -> first path seen
    let mut inodes: HashMap<(u64, u64), String> = HashMap::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    let mut last: Option<String> = None;
    for entry in walker {
        if ctx.is_cancelled() {
            return;
        }
        let item = entry
            .map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                SyncError::walk_error(path, e.to_string())
            })
            .and_then(|entry| entry_to_stat(root, &entry, &mut inodes));

        if let Ok(stat) = &item {
            if let Some(prev) = &last {
                debug_assert_eq!(
                    compare_path(prev, &stat.path),
                    std::cmp::Ordering::Less,
                    "walk out of order"
                );
            }
            last = Some(stat.path.clone());
        }

        let failed = item.is_err();
        if tx.blocking_send(item).is_err() || failed {
            return;
        }
    }
}

fn entry_to_stat(
    root: &Path,
    entry: &walkdir::DirEntry,
    inodes: &mut HashMap<(u64, u64), String>,
) -> Result<Stat> {
    let rel = entry
        .path()
        .strip_prefix(root)
        .map_err(|e| SyncError::walk_error(entry.path(), e.to_string()))?;
    let rel = to_slash(rel);
    let meta = entry
        .metadata()
        .map_err(|e| SyncError::walk_error(entry.path(), e.to_string()))?;
    let mut stat = stat_from_metadata(&rel, entry.path(), &meta)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if !meta.is_dir() && meta.nlink() > 1 {
            match inodes.get(&(meta.dev(), meta.ino())) {
                Some(first) => stat.linkname = first.clone(),
                None => {
                    inodes.insert((meta.dev(), meta.ino()), rel);
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = inodes;

    Ok(stat)
}
