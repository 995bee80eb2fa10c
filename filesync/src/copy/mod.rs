//! cp -a style copies.
//!
//! [`copy`] reproduces a local source tree (or a wildcard selection of
//! entries) under a destination root: include/exclude patterns and
//! `.gitignore` rules filter entries, directories are created lazily when
//! an included descendant needs them, inodes linked more than once are
//! copied once and hardlinked afterwards, and ownership, permissions,
//! timestamps and extended attributes are restored on every created node.
//! [`receive`] applies the same rules to the entries of a remote walk, and
//! [`sync`] applies the diff between a local tree and a walked source.

mod copier;
pub mod node;
mod pending;
mod receive;
pub mod rootpath;
mod sync;
pub mod wildcard;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tracing::debug;

use crate::context::Context;
use crate::diff::ChangeKind;
use crate::error::{Result, SyncError};
use crate::filter::MatchInfo;
use crate::stat::{clean_path, Stat};

use copier::Copier;
pub use receive::receive;
pub use rootpath::root_path;
pub use sync::sync;

/// Numeric owner of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Maps the source owner of a node (or `None` for directories created by
/// `mkdir -p`) to the owner to apply. Returning `None` leaves ownership alone.
pub type Chowner = Arc<dyn Fn(Option<Owner>) -> Result<Option<Owner>> + Send + Sync>;

/// Decides what happens to a failed extended attribute: returning `Ok`
/// discards the error and the copy continues
pub type XAttrErrorHandler = Arc<dyn Fn(&Path, &str, SyncError) -> Result<()> + Send + Sync>;

/// Called with the destination-relative path of every created node
pub type ChangeNotifier = Arc<dyn Fn(ChangeKind, &str, &Stat) -> Result<()> + Send + Sync>;

/// Options of one copy invocation
#[derive(Clone, Default)]
pub struct CopyInfo {
    pub(crate) chown: Option<Chowner>,
    pub(crate) utime: Option<FileTime>,
    pub(crate) mode: Option<u32>,
    pub(crate) xattr_error_handler: Option<XAttrErrorHandler>,
    pub(crate) allow_wildcards: bool,
    pub(crate) include_patterns: Vec<String>,
    pub(crate) exclude_patterns: Vec<String>,
    pub(crate) use_gitignore: bool,
    pub(crate) always_replace_existing_dest_paths: bool,
    pub(crate) change_fn: Option<ChangeNotifier>,
    pub(crate) only: Option<HashSet<String>>,
    pub(crate) copy_dir_contents: bool,
    pub(crate) follow_links: bool,
    pub(crate) base_copy_path: String,
}

impl fmt::Debug for CopyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyInfo")
            .field("chown", &self.chown.is_some())
            .field("utime", &self.utime)
            .field("mode", &self.mode.map(|m| format!("{:o}", m)))
            .field("allow_wildcards", &self.allow_wildcards)
            .field("include_patterns", &self.include_patterns)
            .field("exclude_patterns", &self.exclude_patterns)
            .field("use_gitignore", &self.use_gitignore)
            .field("always_replace_existing_dest_paths", &self.always_replace_existing_dest_paths)
            .field("only", &self.only)
            .field("copy_dir_contents", &self.copy_dir_contents)
            .field("follow_links", &self.follow_links)
            .field("base_copy_path", &self.base_copy_path)
            .finish_non_exhaustive()
    }
}

impl CopyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give every created node the same owner
    pub fn with_chown(self, uid: u32, gid: u32) -> Self {
        self.with_chowner(move |_| Ok(Some(Owner { uid, gid })))
    }

    pub fn with_chowner<F>(mut self, chown: F) -> Self
    where
        F: Fn(Option<Owner>) -> Result<Option<Owner>> + Send + Sync + 'static,
    {
        self.chown = Some(Arc::new(chown));
        self
    }

    /// Stamp every created node with `time` instead of the source mtime
    pub fn with_utime(mut self, time: FileTime) -> Self {
        self.utime = Some(time);
        self
    }

    /// Replace the permission bits of every created node
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_xattr_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Path, &str, SyncError) -> Result<()> + Send + Sync + 'static,
    {
        self.xattr_error_handler = Some(Arc::new(handler));
        self
    }

    /// Log and skip extended attributes that cannot be set
    pub fn allow_xattr_errors(self) -> Self {
        self.with_xattr_error_handler(|path, key, err| {
            tracing::warn!(path = %path.display(), key, error = %err, "Discarding xattr error");
            Ok(())
        })
    }

    /// Expand `*`, `?` and `[...]` in the source path
    pub fn allow_wildcards(mut self) -> Self {
        self.allow_wildcards = true;
        self
    }

    pub fn with_include_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.include_patterns.push(pattern.into());
        self
    }

    pub fn with_exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Skip entries ignored by `.gitignore` files inside the source root
    pub fn with_gitignore(mut self) -> Self {
        self.use_gitignore = true;
        self
    }

    /// Replace existing destination entries of a different type instead of
    /// failing; directories still merge
    pub fn always_replace_existing_dest_paths(mut self) -> Self {
        self.always_replace_existing_dest_paths = true;
        self
    }

    pub fn with_change_notifier<F>(mut self, change_fn: F) -> Self
    where
        F: Fn(ChangeKind, &str, &Stat) -> Result<()> + Send + Sync + 'static,
    {
        self.change_fn = Some(Arc::new(change_fn));
        self
    }

    /// Copy only these paths, relative to the copied source
    pub fn with_only<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let only = self.only.get_or_insert_with(HashSet::new);
        only.extend(paths.into_iter().map(|p| clean_path(p.as_ref())));
        self
    }

    /// Copy the entries of a source directory rather than the directory itself
    pub fn copy_dir_contents(mut self) -> Self {
        self.copy_dir_contents = true;
        self
    }

    /// Resolve a symlink in the last component of the source path
    pub fn follow_links(mut self) -> Self {
        self.follow_links = true;
        self
    }

    /// Path the filters see for the copied source itself
    pub fn with_base_copy_path(mut self, path: impl Into<String>) -> Self {
        self.base_copy_path = path.into();
        self
    }
}

/// Copy `src` from `src_root` to `dst` under `dst_root` with `cp -a`
/// semantics. Both paths are resolved inside their roots.
pub async fn copy(ctx: &Context, src_root: &Path, src: &str, dst_root: &Path, dst: &str, info: &CopyInfo) -> Result<()> {
    let (dir, file) = rootpath::split(dst);
    let ensure = if !file.is_empty() && file != "." { dir } else { dst };
    if !ensure.is_empty() {
        let ensure = root_path(dst_root, ensure)?;
        mkdir_all(&ensure, 0o755, info.chown.as_ref(), info.utime)?;
    }

    let dst_path = root_path(dst_root, &clean_path(dst))?;
    let gitignore_root = info.use_gitignore.then_some(src_root);
    let mut copier = Copier::new(dst_root, info, gitignore_root)?;

    let srcs = if info.allow_wildcards {
        let matches = wildcard::resolve_wildcards(src_root, src, info.follow_links)?;
        if matches.is_empty() {
            return Err(SyncError::copy_error(src, format!("no matches found: {}", src)));
        }
        matches
    } else {
        vec![src.to_string()]
    };

    for src in &srcs {
        ctx.check()?;
        let src_followed = rootpath::resolve_source(src_root, src, info.follow_links)?;
        let target = prepare_target_dir(&src_followed, src, dst_path.clone(), info).await?;
        debug!(src = %src_followed.display(), dst = %target.display(), "Copying");
        copier
            .copy_entry(
                ctx,
                src_followed,
                info.base_copy_path.clone(),
                target,
                false,
                MatchInfo::default(),
                MatchInfo::default(),
            )
            .await?;
    }
    Ok(())
}

/// Pick the final destination of one source: an existing destination
/// directory receives the source under its own name, unless the contents of
/// a directory are being copied. Creates the parent of the result.
async fn prepare_target_dir(src_followed: &Path, src: &str, dst_path: PathBuf, info: &CopyInfo) -> Result<PathBuf> {
    let src_meta = tokio::fs::symlink_metadata(src_followed)
        .await
        .map_err(|e| SyncError::copy_error(src_followed, format!("failed to stat source path: {}", e)))?;
    let dst_meta = match tokio::fs::metadata(&dst_path).await {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(SyncError::copy_error(&dst_path, format!("failed to stat destination path: {}", e)));
        }
    };

    let src_is_dir = src_meta.is_dir();
    let dst_is_dir = dst_meta.as_ref().map_or(false, |m| m.is_dir());
    let mut dst_path = dst_path;
    if (!info.copy_dir_contents && src_is_dir && dst_meta.is_some()) || (!src_is_dir && dst_is_dir) {
        let base = base_name(src);
        if base != "." && base != "/" {
            dst_path.push(base);
        }
    }

    let target = if info.copy_dir_contents && src_is_dir && dst_meta.is_none() {
        dst_path.clone()
    } else {
        dst_path.parent().map(Path::to_path_buf).unwrap_or_else(|| dst_path.clone())
    };
    mkdir_all(&target, 0o755, info.chown.as_ref(), info.utime)?;

    Ok(dst_path)
}

/// Whether the slash path `path` lies strictly below `dir`. Everything lies
/// below the empty root.
pub(crate) fn is_under(path: &str, dir: &str) -> bool {
    dir.is_empty() || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

/// Last element of a slash path, with trailing separators ignored
fn base_name(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// `mkdir -p` that applies the chown hook and the fixed time to every
/// directory it creates. Creations are not reported as changes.
pub fn mkdir_all(path: &Path, mode: u32, chown: Option<&Chowner>, utime: Option<FileTime>) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => return Err(SyncError::copy_error(path, "cannot create directory: not a directory")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::copy_error(path, format!("failed to stat: {}", e))),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            mkdir_all(parent, mode, chown, utime)?;
        }
    }

    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    match builder.create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => return Ok(()),
        Err(e) => return Err(SyncError::copy_error(path, format!("failed to mkdir: {}", e))),
    }

    if let Some(chown) = chown {
        if let Some(owner) = chown(None)? {
            node::lchown(path, owner.uid, owner.gid)?;
        }
    }
    if let Some(time) = utime {
        node::set_times(path, time)?;
    }
    Ok(())
}
