//! State of one copy invocation: filters, pending parent directories and
//! the hardlink map, plus the recursive walk over a local source

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use futures::future::{BoxFuture, FutureExt};
use tracing::trace;

use crate::context::Context;
use crate::copy::node;
use crate::copy::{ChangeNotifier, Chowner, CopyInfo, Owner, XAttrErrorHandler};
use crate::diff::ChangeKind;
use crate::error::{Result, SyncError};
use crate::filter::{GitignoreMatcher, MatchInfo, PatternMatcher};
use crate::pool::BufferPool;
use crate::stat::{clean_path, stat_from_metadata, to_slash, FileKind, Stat, MODE_PERM_MASK};

/// A source directory whose destination may not have been created yet
#[derive(Debug)]
struct ParentDir {
    stat: Stat,
    dst: PathBuf,
    copied: bool,
}

/// Result of filtering one source entry
#[derive(Debug, Default)]
pub(crate) struct Filtered {
    pub include: bool,
    pub include_info: MatchInfo,
    pub exclude_info: MatchInfo,
}

/// What to do with an entry once its target has been prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prepared {
    Skip,
    Ready { target_existed: bool },
}

pub(crate) struct Copier {
    dest_root: PathBuf,
    chown: Option<Chowner>,
    utime: Option<FileTime>,
    mode: Option<u32>,
    xattr_error_handler: Option<XAttrErrorHandler>,
    only: Option<HashSet<String>>,
    include: Option<PatternMatcher>,
    exclude: Option<PatternMatcher>,
    gitignore: Option<GitignoreMatcher>,
    always_replace: bool,
    change_fn: Option<ChangeNotifier>,
    parent_dirs: Vec<ParentDir>,
    inodes: HashMap<(u64, u64), PathBuf>,
    pool: &'static BufferPool,
}

impl Copier {
    pub fn new(dest_root: &Path, info: &CopyInfo, gitignore_root: Option<&Path>) -> Result<Self> {
        let include = if info.include_patterns.is_empty() {
            None
        } else {
            Some(PatternMatcher::new(&info.include_patterns).map_err(|e| {
                SyncError::FilterPattern(format!("invalid include patterns {:?}: {}", info.include_patterns, e))
            })?)
        };
        let exclude = if info.exclude_patterns.is_empty() {
            None
        } else {
            Some(PatternMatcher::new(&info.exclude_patterns).map_err(|e| {
                SyncError::FilterPattern(format!("invalid exclude patterns {:?}: {}", info.exclude_patterns, e))
            })?)
        };

        Ok(Self {
            dest_root: dest_root.to_path_buf(),
            chown: info.chown.clone(),
            utime: info.utime,
            mode: info.mode,
            xattr_error_handler: info.xattr_error_handler.clone(),
            only: info.only.clone(),
            include,
            exclude,
            gitignore: gitignore_root.map(GitignoreMatcher::new),
            always_replace: info.always_replace_existing_dest_paths,
            change_fn: info.change_fn.clone(),
            parent_dirs: Vec::new(),
            inodes: HashMap::new(),
            pool: BufferPool::global(),
        })
    }

    pub fn pool(&self) -> &'static BufferPool {
        self.pool
    }

    /// Whether `components` survives the `only` set. The copy root always does.
    pub fn in_only_set(&self, components: &str) -> bool {
        match &self.only {
            Some(only) if !components.is_empty() => only.contains(&clean_path(components)),
            _ => true,
        }
    }

    /// Apply include patterns, then exclude patterns, then gitignore rules
    pub fn filter(
        &mut self,
        components: &str,
        src: Option<&Path>,
        is_dir: bool,
        parent_include: &MatchInfo,
        parent_exclude: &MatchInfo,
    ) -> Result<Filtered> {
        if components.is_empty() {
            return Ok(Filtered {
                include: true,
                ..Default::default()
            });
        }

        let mut filtered = Filtered {
            include: true,
            ..Default::default()
        };
        if let Some(include) = &self.include {
            let (matched, info) = include.matches_using_parent_results(components, parent_include)?;
            filtered.include = matched;
            filtered.include_info = info;
        }
        if let Some(exclude) = &self.exclude {
            let (matched, info) = exclude.matches_using_parent_results(components, parent_exclude)?;
            if matched {
                filtered.include = false;
            }
            filtered.exclude_info = info;
        }
        if let (Some(gitignore), Some(src)) = (self.gitignore.as_mut(), src) {
            if gitignore.matches(src, is_dir)? {
                filtered.include = false;
            }
        }
        Ok(filtered)
    }

    /// Get `target` ready for a new node. Included entries clear a
    /// conflicting target and create their pending parents; excluded
    /// non-directories are skipped.
    pub async fn prepare_target(&mut self, target: &Path, stat: &Stat, include: bool, overwrite: bool) -> Result<Prepared> {
        let target_meta = node::lstat_optional(target).await?;

        if include {
            if let Some(meta) = &target_meta {
                if self.always_replace && !(stat.is_dir() && meta.is_dir()) {
                    node::remove_all(target, meta).await?;
                }
            }
            self.create_parent_dirs(overwrite).await?;
        }

        if !stat.is_dir() {
            if !include {
                return Ok(Prepared::Skip);
            }
            node::ensure_empty_file_target(target).await?;
        }

        Ok(Prepared::Ready {
            target_existed: target_meta.is_some(),
        })
    }

    /// Create `target` if the directory is included, then record it as a
    /// parent for the entries below it. Returns whether it was created.
    pub async fn open_directory(&mut self, target: &Path, stat: &Stat, overwrite: bool, include: bool) -> Result<bool> {
        let mut created = false;
        if include {
            created = node::copy_directory_only(target, stat, overwrite).await?;
            if created || overwrite {
                self.notify(target, stat)?;
            }
        }
        self.parent_dirs.push(ParentDir {
            stat: stat.clone(),
            dst: target.to_path_buf(),
            copied: include,
        });
        Ok(created)
    }

    pub fn close_directory(&mut self) {
        self.parent_dirs.pop();
    }

    /// Materialize directories that were skipped by the filters but now
    /// have an included descendant
    async fn create_parent_dirs(&mut self, overwrite: bool) -> Result<()> {
        for i in 0..self.parent_dirs.len() {
            if self.parent_dirs[i].copied {
                continue;
            }
            let stat = self.parent_dirs[i].stat.clone();
            let dst = self.parent_dirs[i].dst.clone();
            if !stat.is_dir() {
                return Err(SyncError::copy_error(&dst, format!("{} is not a directory", stat.path)));
            }
            if node::copy_directory_only(&dst, &stat, overwrite).await? {
                self.apply_metadata(&stat, &dst)?;
                self.apply_xattrs(&stat, &dst)?;
            }
            self.parent_dirs[i].copied = true;
        }
        Ok(())
    }

    /// Restore metadata on a finished node and report it
    pub fn finish(
        &mut self,
        stat: &Stat,
        target: &Path,
        copy_file_info: bool,
        restore_timestamp: bool,
        target_existed: bool,
        notify: bool,
    ) -> Result<()> {
        if copy_file_info {
            self.apply_metadata(stat, target)?;
            self.apply_xattrs(stat, target)?;
        } else if restore_timestamp && target_existed {
            self.apply_timestamp(stat, target)?;
        }
        if notify {
            self.notify(target, stat)?;
        }
        Ok(())
    }

    /// Ownership, permission bits and timestamps
    fn apply_metadata(&self, stat: &Stat, target: &Path) -> Result<()> {
        let owner = Owner {
            uid: stat.uid,
            gid: stat.gid,
        };
        let owner = match &self.chown {
            Some(chown) => chown(Some(owner))?,
            None => Some(owner),
        };
        if let Some(owner) = owner {
            node::lchown(target, owner.uid, owner.gid)?;
        }

        if !stat.is_symlink() {
            let mut mode = stat.mode & MODE_PERM_MASK;
            if let Some(fixed) = self.mode {
                mode = (mode & !0o777) | (fixed & 0o777);
            }
            node::chmod(target, mode)?;
        }

        self.apply_timestamp(stat, target)
    }

    fn apply_timestamp(&self, stat: &Stat, target: &Path) -> Result<()> {
        node::set_times(target, self.utime.unwrap_or_else(|| stat.file_time()))
    }

    fn apply_xattrs(&self, stat: &Stat, target: &Path) -> Result<()> {
        let mut keys: Vec<&String> = stat.xattrs.keys().collect();
        keys.sort();
        for key in keys {
            if let Err(e) = node::set_xattr(target, key, &stat.xattrs[key]) {
                let err = SyncError::xattr_error(target, key.as_str(), e.to_string());
                match &self.xattr_error_handler {
                    Some(handler) => handler(target, key, err)?,
                    None => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn notify(&self, target: &Path, stat: &Stat) -> Result<()> {
        self.notify_change(ChangeKind::Add, target, stat)
    }

    /// Report `kind` for `target` with its destination-relative path
    pub fn notify_change(&self, kind: ChangeKind, target: &Path, stat: &Stat) -> Result<()> {
        let Some(change_fn) = &self.change_fn else {
            return Ok(());
        };
        let rel = target.strip_prefix(&self.dest_root).unwrap_or(target);
        let path = clean_path(&format!("/{}", to_slash(rel)));
        trace!(path = %path, %kind, "Applied");
        change_fn(kind, &path, stat)
    }

    /// Path of an earlier copy of the same inode, remembering `target` as
    /// the first copy otherwise
    fn hardlink_source(&mut self, meta: &std::fs::Metadata, target: &Path) -> Option<PathBuf> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.inodes.get(&key) {
                    return Some(first.clone());
                }
                self.inodes.insert(key, target.to_path_buf());
            }
        }
        #[cfg(not(unix))]
        let _ = (meta, target);
        None
    }

    /// Copy the local entry `src` onto `target`, recursing into directories.
    ///
    /// `components` is the slash-separated path the filters see.
    /// `overwrite` allows resetting the metadata of existing directories;
    /// it is false only for the top-level entry.
    pub fn copy_entry<'a>(
        &'a mut self,
        ctx: &'a Context,
        src: PathBuf,
        components: String,
        target: PathBuf,
        overwrite: bool,
        parent_include: MatchInfo,
        parent_exclude: MatchInfo,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            ctx.check()?;

            let meta = match tokio::fs::symlink_metadata(&src).await {
                Ok(meta) => Some(meta),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    return Err(SyncError::copy_error(&src, format!("failed to stat source path: {}", e)));
                }
            };

            if !self.in_only_set(&components) {
                return Ok(());
            }

            let is_dir = meta.as_ref().map_or(true, |m| m.is_dir());
            let filtered = self.filter(&components, Some(src.as_path()), is_dir, &parent_include, &parent_exclude)?;

            let Some(meta) = meta else {
                // A vanished source only matters if it was going to be copied
                if !filtered.include {
                    return Ok(());
                }
                return Err(SyncError::copy_error(&src, "failed to stat source path: not found"));
            };

            let stat = stat_from_metadata(&components, &src, &meta)?;
            let kind = stat
                .kind()
                .ok_or_else(|| SyncError::copy_error(&src, format!("unsupported file mode {:o}", stat.mode)))?;

            let target_existed = match self.prepare_target(&target, &stat, filtered.include, overwrite).await? {
                Prepared::Skip => return Ok(()),
                Prepared::Ready { target_existed } => target_existed,
            };

            let mut copy_file_info = filtered.include;
            let mut restore_timestamp = false;
            let mut notify = true;

            match kind {
                FileKind::Directory => {
                    let created = self.open_directory(&target, &stat, overwrite, filtered.include).await?;
                    let copied = self
                        .copy_children(ctx, &src, &components, &target, filtered.include_info, filtered.exclude_info)
                        .await;
                    self.close_directory();
                    copied?;

                    if !overwrite {
                        copy_file_info = created;
                        restore_timestamp = !created;
                    }
                    notify = false;
                }
                FileKind::Regular => match self.hardlink_source(&meta, &target) {
                    Some(first) => node::hard_link(&first, &target).await?,
                    None => {
                        node::copy_file(&src, &target, self.pool).await?;
                    }
                },
                FileKind::Symlink => node::symlink(&stat.linkname, &target).await?,
                FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
                    node::create_special(&target, &stat)?;
                }
            }

            self.finish(&stat, &target, copy_file_info, restore_timestamp, target_existed, notify)
        }
        .boxed()
    }

    async fn copy_children(
        &mut self,
        ctx: &Context,
        src: &Path,
        components: &str,
        target: &Path,
        include_info: MatchInfo,
        exclude_info: MatchInfo,
    ) -> Result<()> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(src)
            .await
            .map_err(|e| SyncError::copy_error(src, format!("failed to read directory: {}", e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::copy_error(src, format!("failed to read directory: {}", e)))?
        {
            names.push(entry.file_name());
        }
        names.sort();

        for name in names {
            let child = name.to_string_lossy();
            self.copy_entry(
                ctx,
                src.join(&name),
                join_components(components, &child),
                target.join(&name),
                true,
                include_info.clone(),
                exclude_info.clone(),
            )
            .await?;
        }
        Ok(())
    }
}

pub(crate) fn join_components(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        clean_path(&format!("{}/{}", parent, name))
    }
}
