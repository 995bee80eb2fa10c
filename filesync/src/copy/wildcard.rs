//! Wildcard source paths

use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use walkdir::WalkDir;

use crate::copy::rootpath::resolve_source;
use crate::error::{Result, SyncError};
use crate::stat::to_slash;

/// Whether `name` holds an unescaped `*`, `?` or `[`
pub fn contains_wildcards(name: &str) -> bool {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if cfg!(unix) => i += 1,
            b'*' | b'?' | b'[' => return true,
            _ => {}
        }
        i += 1;
    }
    false
}

/// Split `path` before its first component holding a wildcard
pub fn split_wildcards(path: &str) -> (String, String) {
    let mut literal: Vec<&str> = Vec::new();
    let mut pattern: Vec<&str> = Vec::new();
    let mut found = false;
    for (i, part) in path.split('/').enumerate() {
        if !found && contains_wildcards(part) {
            found = true;
        }
        let part = if part.is_empty() && i == 0 { "/" } else { part };
        if part.is_empty() {
            continue;
        }
        if found {
            pattern.push(part);
        } else {
            literal.push(part);
        }
    }
    (join(&literal), join(&pattern))
}

fn join(parts: &[&str]) -> String {
    match parts.split_first() {
        Some((&"/", rest)) => format!("/{}", rest.join("/")),
        _ => parts.join("/"),
    }
}

/// Expand a wildcard source into the matching paths, relative to `root` and
/// in walk order. Matched directories are not descended into.
pub fn resolve_wildcards(root: &Path, src: &str, follow_links: bool) -> Result<Vec<String>> {
    let (literal, pattern) = split_wildcards(src);
    if pattern.is_empty() {
        return Ok(vec![literal]);
    }

    let base = resolve_source(root, &literal, follow_links)?;
    let matcher = GlobBuilder::new(&pattern)
        .literal_separator(true)
        .backslash_escape(true)
        .build()
        .map_err(|e| SyncError::FilterPattern(format!("invalid wildcard '{}': {}", src, e)))?
        .compile_matcher();

    let mut matches = Vec::new();
    let mut walker = WalkDir::new(&base).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| base.clone());
            SyncError::walk_error(path, e.to_string())
        })?;
        let rel = relative(&base, entry.path())?;
        if !matcher.is_match(&rel) {
            continue;
        }
        matches.push(relative(root, entry.path())?);
        if entry.file_type().is_dir() {
            walker.skip_current_dir();
        }
    }
    Ok(matches)
}

fn relative(base: &Path, path: &Path) -> Result<String> {
    path.strip_prefix(base)
        .map(to_slash)
        .map_err(|_| SyncError::copy_error(PathBuf::from(path), format!("not under {}", base.display())))
}
