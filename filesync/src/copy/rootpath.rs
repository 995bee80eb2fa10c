//! Symlink resolution scoped to a root directory

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

const MAX_LINKS: usize = 255;

/// Join `path` onto `root`, resolving every symlink on the way as if `root`
/// were `/`: absolute link targets restart at `root` and `..` never climbs
/// above it. Components that do not exist yet are taken as they are.
pub fn root_path(root: &Path, path: &str) -> Result<PathBuf> {
    let mut pending: VecDeque<String> = components(path).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut links = 0usize;

    while let Some(component) = pending.pop_front() {
        if component == ".." {
            resolved.pop();
            continue;
        }

        let candidate = join(root, resolved.iter().chain(std::iter::once(&component)));
        let meta = match std::fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                resolved.push(component);
                continue;
            }
            Err(e) => {
                return Err(SyncError::copy_error(&candidate, format!("failed to resolve path: {}", e)));
            }
        };

        if !meta.file_type().is_symlink() {
            resolved.push(component);
            continue;
        }

        links += 1;
        if links > MAX_LINKS {
            return Err(SyncError::copy_error(&candidate, "too many links"));
        }
        let target = std::fs::read_link(&candidate)
            .map_err(|e| SyncError::copy_error(&candidate, format!("failed to read link: {}", e)))?;
        let target = target.to_string_lossy().into_owned();
        if target.starts_with('/') {
            resolved.clear();
        }
        for (i, part) in components(&target).enumerate() {
            pending.insert(i, part);
        }
    }

    Ok(join(root, resolved.iter()))
}

/// Resolve a copy source. Unless `follow_links` is set, a symlink in the
/// last component is kept as the link itself.
pub fn resolve_source(root: &Path, path: &str, follow_links: bool) -> Result<PathBuf> {
    let path = format!("/{}", path.trim_start_matches('/'));
    if components(&path).next().is_none() {
        return Ok(root.to_path_buf());
    }
    if follow_links {
        return root_path(root, &path);
    }
    let (dir, file) = split(&path);
    let dir = root_path(root, dir)?;
    if file.is_empty() || file == "." {
        return Ok(dir);
    }
    Ok(dir.join(file))
}

/// Split after the final separator, keeping the separator in the directory
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    }
}

fn components(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
}

fn join<'a>(root: &Path, parts: impl Iterator<Item = &'a String>) -> PathBuf {
    let mut out = root.to_path_buf();
    out.extend(parts);
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_split() {
        assert_eq!(split("a/b/c"), ("a/b/", "c"));
        assert_eq!(split("/"), ("/", ""));
        assert_eq!(split("foo"), ("", "foo"));
    }

    #[test]
    fn test_absolute_link_stays_in_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("testdir")).unwrap();
        std::fs::write(root.join("testdir/foo.txt"), b"x").unwrap();
        symlink("foo.txt", root.join("testdir/link2")).unwrap();
        symlink("/testdir", root.join("link")).unwrap();

        assert_eq!(root_path(root, "/link/link2").unwrap(), root.join("testdir/foo.txt"));
        assert_eq!(resolve_source(root, "link/link2", false).unwrap(), root.join("testdir/link2"));
        assert_eq!(resolve_source(root, "link/link2", true).unwrap(), root.join("testdir/foo.txt"));
    }

    #[test]
    fn test_parent_components_are_bounded() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        symlink("../../../etc", root.join("escape")).unwrap();

        assert_eq!(root_path(root, "escape/passwd").unwrap(), root.join("etc/passwd"));
        assert_eq!(root_path(root, "../a/./b").unwrap(), root.join("a/b"));
        assert_eq!(resolve_source(root, "/", false).unwrap(), root.to_path_buf());
        assert_eq!(resolve_source(root, "/.", true).unwrap(), root.to_path_buf());
    }

    #[test]
    fn test_link_cycle() {
        let dir = TempDir::new().unwrap();
        symlink("b", dir.path().join("a")).unwrap();
        symlink("a", dir.path().join("b")).unwrap();
        assert!(root_path(dir.path(), "a").is_err());
    }
}
