//! Fixtures shared by the test modules

use std::future::Future;
use std::path::Path;
use std::sync::Mutex;

use walkdir::WalkDir;

use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::fs::WalkFs;
use crate::stat::{compare_path, to_slash, Stat, S_IFDIR, S_IFREG};

/// An in-memory walk over a fixed set of records
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    stats: Vec<Stat>,
    fail_after: Option<usize>,
}

impl MemFs {
    pub fn new(mut stats: Vec<Stat>) -> Self {
        stats.sort_by(|a, b| compare_path(&a.path, &b.path));
        Self { stats, fail_after: None }
    }

    /// Report a walk error after `n` entries
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl WalkFs for MemFs {
    async fn walk<F, Fut>(&self, ctx: &Context, mut f: F) -> Result<()>
    where
        F: FnMut(Stat) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        for (i, stat) in self.stats.iter().enumerate() {
            if self.fail_after == Some(i) {
                return Err(SyncError::walk_error(&stat.path, "injected failure"));
            }
            ctx.check()?;
            f(stat.clone()).await?;
        }
        if self.fail_after.is_some_and(|n| n >= self.stats.len()) {
            return Err(SyncError::walk_error("", "injected failure"));
        }
        Ok(())
    }
}

pub fn dir_stat(path: &str) -> Stat {
    Stat {
        path: path.to_string(),
        mode: S_IFDIR | 0o755,
        mod_time: 1,
        ..Default::default()
    }
}

pub fn file_stat(path: &str, size: u64) -> Stat {
    Stat {
        path: path.to_string(),
        mode: S_IFREG | 0o644,
        size,
        mod_time: 1,
        ..Default::default()
    }
}

/// Collects callback arguments from async callbacks
#[derive(Debug, Default)]
pub struct Recorder<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self { items: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }
}

/// Tree entry for [`create_tree`]
pub enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a str),
    #[cfg(unix)]
    Symlink(&'a str, &'a str),
}

pub fn create_tree(root: &Path, entries: &[Entry<'_>]) {
    for entry in entries {
        match entry {
            Entry::Dir(path) => std::fs::create_dir_all(root.join(path)).unwrap(),
            Entry::File(path, content) => {
                let full = root.join(path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(full, content).unwrap();
            }
            #[cfg(unix)]
            Entry::Symlink(path, target) => {
                let full = root.join(path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::os::unix::fs::symlink(target, full).unwrap();
            }
        }
    }
}

/// Every path under `root`, slash-separated and in walk order
pub fn list_tree(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|e| to_slash(e.unwrap().path().strip_prefix(root).unwrap()))
        .collect()
}

/// Assert that two trees hold the same paths, kinds, permission bits,
/// contents and link targets. Timestamps are not compared.
pub fn assert_dirs_equal(a: &Path, b: &Path) {
    let left = list_tree(a);
    let right = list_tree(b);
    assert_eq!(left, right, "trees {} and {} differ", a.display(), b.display());

    for rel in left {
        let pa = a.join(&rel);
        let pb = b.join(&rel);
        let ma = std::fs::symlink_metadata(&pa).unwrap();
        let mb = std::fs::symlink_metadata(&pb).unwrap();
        assert_eq!(ma.file_type(), mb.file_type(), "kind of {}", rel);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if !ma.file_type().is_symlink() {
                assert_eq!(
                    ma.permissions().mode() & 0o7777,
                    mb.permissions().mode() & 0o7777,
                    "mode of {}",
                    rel
                );
            }
        }

        if ma.file_type().is_symlink() {
            assert_eq!(std::fs::read_link(&pa).unwrap(), std::fs::read_link(&pb).unwrap(), "link {}", rel);
        } else if ma.is_file() {
            assert_eq!(std::fs::read(&pa).unwrap(), std::fs::read(&pb).unwrap(), "content of {}", rel);
        }
    }
}
