//! Double-walk diff: merge two ordered walks into an ordered change stream

use std::cmp::Ordering;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::fs::WalkFs;
use crate::stat::{compare_path, Stat};

/// Classification of a path between the lower and the upper tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    /// Present and identical on both sides. Never delivered to callbacks.
    None,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

/// One difference between the two trees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
    /// Set for `Delete` and `Modify`
    pub lower: Option<Stat>,
    /// Set for `Add` and `Modify`
    pub upper: Option<Stat>,
}

impl Change {
    fn add(upper: Stat) -> Self {
        Self {
            kind: ChangeKind::Add,
            path: upper.path.clone(),
            lower: None,
            upper: Some(upper),
        }
    }

    fn delete(lower: Stat) -> Self {
        Self {
            kind: ChangeKind::Delete,
            path: lower.path.clone(),
            lower: Some(lower),
            upper: None,
        }
    }

    fn compare(lower: Stat, upper: Stat) -> Self {
        let kind = if same_file(&lower, &upper) {
            ChangeKind::None
        } else {
            ChangeKind::Modify
        };
        Self {
            kind,
            path: upper.path.clone(),
            lower: Some(lower),
            upper: Some(upper),
        }
    }
}

/// Whether two records describe the same entry. Sizes and modification
/// times are ignored for directories.
pub fn same_file(lower: &Stat, upper: &Stat) -> bool {
    if lower.mode != upper.mode
        || lower.uid != upper.uid
        || lower.gid != upper.gid
        || lower.devmajor != upper.devmajor
        || lower.devminor != upper.devminor
        || lower.linkname != upper.linkname
    {
        return false;
    }
    if !lower.is_dir() && (lower.size != upper.size || lower.mod_time != upper.mod_time) {
        return false;
    }
    true
}

/// Merges two concurrent walks into [`Change`]s
#[derive(Debug, Clone)]
pub struct DiffEngine {
    channel_capacity: usize,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            channel_capacity: config.walk_channel_capacity.max(1),
        }
    }

    /// Walk `lower` and `upper` concurrently and call `change_fn` once per
    /// differing path, in increasing path order, never concurrently.
    ///
    /// The first error from either walk or from `change_fn` cancels the rest
    /// and is returned.
    pub async fn diff<L, U, F, Fut>(&self, ctx: &Context, lower: &L, upper: &U, change_fn: F) -> Result<()>
    where
        L: WalkFs,
        U: WalkFs,
        F: FnMut(Change) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let ctx = ctx.child();
        let (lower_tx, lower_rx) = mpsc::channel(self.channel_capacity);
        let (upper_tx, upper_rx) = mpsc::channel(self.channel_capacity);

        let result = tokio::try_join!(
            send_walk(&ctx, lower, lower_tx),
            send_walk(&ctx, upper, upper_tx),
            merge(&ctx, lower_rx, upper_rx, change_fn),
        );

        match result {
            Ok((_, _, stats)) => {
                info!(
                    added = stats.added,
                    modified = stats.modified,
                    deleted = stats.deleted,
                    unchanged = stats.unchanged,
                    "Diff completed"
                );
                Ok(())
            }
            Err(e) => {
                ctx.cancel_with_cause(e.to_string());
                debug!(error = %e, "Diff aborted");
                Err(e)
            }
        }
    }
}

async fn send_walk<W: WalkFs>(ctx: &Context, fs: &W, tx: mpsc::Sender<Stat>) -> Result<()> {
    fs.walk(ctx, |stat| {
        let tx = tx.clone();
        async move {
            tokio::select! {
                sent = tx.send(stat) => sent.map_err(|_| SyncError::Cancelled("diff merge stopped".to_string())),
                _ = ctx.cancelled() => Err(ctx.cause()),
            }
        }
    })
    .await
}

async fn next(ctx: &Context, rx: &mut mpsc::Receiver<Stat>) -> Result<Option<Stat>> {
    tokio::select! {
        stat = rx.recv() => Ok(stat),
        _ = ctx.cancelled() => Err(ctx.cause()),
    }
}

#[derive(Debug, Default)]
struct MergeStats {
    added: usize,
    modified: usize,
    deleted: usize,
    unchanged: usize,
}

/// Drops what a merge must not report: unchanged paths and deletes below a
/// directory whose delete was already reported
#[derive(Debug, Default)]
struct ChangeFilter {
    stats: MergeStats,
    // Prefix of the most recently deleted directory
    rmdir: Option<String>,
}

impl ChangeFilter {
    fn admit(&mut self, change: Change) -> Option<Change> {
        if change.kind == ChangeKind::Delete {
            if let Some(prefix) = &self.rmdir {
                if change.path.starts_with(prefix.as_str()) {
                    return None;
                }
            }
        }
        self.rmdir = None;

        match change.kind {
            ChangeKind::None => {
                self.stats.unchanged += 1;
                return None;
            }
            ChangeKind::Add => self.stats.added += 1,
            ChangeKind::Modify => self.stats.modified += 1,
            ChangeKind::Delete => {
                self.stats.deleted += 1;
                if change.lower.as_ref().is_some_and(Stat::is_dir) {
                    self.rmdir = Some(format!("{}/", change.path));
                }
            }
        }
        Some(change)
    }
}

async fn merge<F, Fut>(
    ctx: &Context,
    mut lower_rx: mpsc::Receiver<Stat>,
    mut upper_rx: mpsc::Receiver<Stat>,
    mut change_fn: F,
) -> Result<MergeStats>
where
    F: FnMut(Change) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut filter = ChangeFilter::default();
    let mut lower: Option<Stat> = None;
    let mut upper: Option<Stat> = None;
    let mut lower_done = false;
    let mut upper_done = false;

    loop {
        if lower.is_none() && !lower_done {
            lower = next(ctx, &mut lower_rx).await?;
            lower_done = lower.is_none();
        }
        if upper.is_none() && !upper_done {
            upper = next(ctx, &mut upper_rx).await?;
            upper_done = upper.is_none();
        }

        let change = match (lower.take(), upper.take()) {
            (None, None) => break,
            (Some(l), None) => Change::delete(l),
            (None, Some(u)) => Change::add(u),
            (Some(l), Some(u)) => match compare_path(&l.path, &u.path) {
                Ordering::Less => {
                    upper = Some(u);
                    Change::delete(l)
                }
                Ordering::Greater => {
                    lower = Some(l);
                    Change::add(u)
                }
                Ordering::Equal => Change::compare(l, u),
            },
        };

        if let Some(change) = filter.admit(change) {
            change_fn(change).await?;
        }
    }

    Ok(filter.stats)
}

/// Diffs an already captured lower tree against upper entries pushed one at
/// a time in walk order.
///
/// Every change up to an upper entry is known as soon as that entry is
/// pushed, so the changes can be applied from inside the upper walk.
#[derive(Debug)]
pub struct SnapshotDiff {
    lower: std::iter::Peekable<std::vec::IntoIter<Stat>>,
    filter: ChangeFilter,
}

impl SnapshotDiff {
    /// `lower` must be in [`compare_path`] order, as a walk produces it
    pub fn new(lower: Vec<Stat>) -> Self {
        Self {
            lower: lower.into_iter().peekable(),
            filter: ChangeFilter::default(),
        }
    }

    /// Changes for every lower path before `upper`, then for `upper` itself
    pub fn push(&mut self, upper: Stat) -> Vec<Change> {
        let mut changes = Vec::new();
        while let Some(lower) = self.lower.next_if(|l| compare_path(&l.path, &upper.path) == Ordering::Less) {
            changes.extend(self.filter.admit(Change::delete(lower)));
        }
        let change = match self.lower.next_if(|l| l.path == upper.path) {
            Some(lower) => Change::compare(lower, upper),
            None => Change::add(upper),
        };
        changes.extend(self.filter.admit(change));
        changes
    }

    /// Deletes for the lower paths after the last upper entry
    pub fn finish(&mut self) -> Vec<Change> {
        let mut changes = Vec::new();
        while let Some(lower) = self.lower.next() {
            changes.extend(self.filter.admit(Change::delete(lower)));
        }
        debug!(
            added = self.filter.stats.added,
            modified = self.filter.stats.modified,
            deleted = self.filter.stats.deleted,
            unchanged = self.filter.stats.unchanged,
            "Snapshot diff completed"
        );
        changes
    }
}
