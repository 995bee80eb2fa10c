//! Path filtering for copies: include/exclude patterns and `.gitignore` rules

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::stat::clean_path;

#[derive(Debug, Clone)]
struct Pattern {
    cleaned: String,
    exclusion: bool,
    matcher: GlobMatcher,
}

impl Pattern {
    fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

/// Per-pattern results for a directory, handed down to its children so that
/// a pattern matched by an ancestor does not need to be evaluated again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchInfo {
    parent_matched: Vec<bool>,
}

/// An ordered list of `.dockerignore`-style patterns.
///
/// `*` and `?` never cross a `/`, `**` spans any number of directories and a
/// leading `!` turns a pattern into an exception. Later patterns win, and a
/// path matches when one of its parent directories does.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
    exclusions: bool,
}

impl PatternMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        let mut exclusions = false;

        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let (exclusion, body) = match raw.strip_prefix('!') {
                Some("") => {
                    return Err(SyncError::FilterPattern("illegal exclusion pattern: \"!\"".to_string()));
                }
                Some(body) => (true, body),
                None => (false, raw),
            };
            exclusions |= exclusion;

            let mut cleaned = clean_path(body);
            if let Some(stripped) = cleaned.strip_prefix('/') {
                cleaned = if stripped.is_empty() { ".".to_string() } else { stripped.to_string() };
            }

            let glob = GlobBuilder::new(&cleaned)
                .literal_separator(true)
                .backslash_escape(true)
                .build()
                .map_err(|e| SyncError::FilterPattern(format!("invalid pattern '{}': {}", raw, e)))?;

            compiled.push(Pattern {
                cleaned,
                exclusion,
                matcher: glob.compile_matcher(),
            });
        }

        Ok(Self {
            patterns: compiled,
            exclusions,
        })
    }

    /// Whether any pattern is an exception (`!pattern`)
    pub fn exclusions(&self) -> bool {
        self.exclusions
    }

    /// The normalized patterns, without their `!` prefix
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.cleaned.as_str())
    }

    /// Match `path` without any knowledge of its parents' results
    pub fn matches(&self, path: &str) -> Result<bool> {
        Ok(self.matches_using_parent_results(path, &MatchInfo::default())?.0)
    }

    /// Match `path` (slash-separated, relative to the copy source) reusing
    /// the results recorded for its parent directory.
    ///
    /// With an empty `parent` every ancestor of `path` is tried against the
    /// patterns instead. The returned [`MatchInfo`] is meant for the
    /// children of `path`.
    pub fn matches_using_parent_results(&self, path: &str, parent: &MatchInfo) -> Result<(bool, MatchInfo)> {
        let parent_matched = &parent.parent_matched;
        if !parent_matched.is_empty() && parent_matched.len() != self.patterns.len() {
            return Err(SyncError::FilterPattern(
                "wrong number of values in parent match results".to_string(),
            ));
        }

        let mut matched = false;
        let mut info = MatchInfo {
            parent_matched: vec![false; self.patterns.len()],
        };

        for (i, pattern) in self.patterns.iter().enumerate() {
            let mut hit = parent_matched.get(i).copied().unwrap_or(false);

            if !hit {
                // An inclusion cannot change an already matched path, an
                // exception cannot change an unmatched one
                if pattern.exclusion != matched {
                    continue;
                }

                hit = pattern.matches(path);

                if !hit && parent_matched.is_empty() {
                    hit = ancestors(path).any(|dir| pattern.matches(dir));
                }
            }

            info.parent_matched[i] = hit;
            if hit {
                matched = !pattern.exclusion;
            }
        }

        Ok((matched, info))
    }
}

/// `a`, `a/b` for `a/b/c`
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(move |(i, _)| &path[..i])
        .filter(|dir| !dir.is_empty())
}

/// Evaluates `.gitignore` files found between a root directory and each
/// matched path. Rules in deeper files override shallower ones, negations
/// re-include a path even when one of its directories is ignored, and
/// `/`-anchored rules are relative to the directory holding the file.
#[derive(Debug)]
pub struct GitignoreMatcher {
    root: PathBuf,
    files: HashMap<PathBuf, Option<Gitignore>>,
    dirs: HashMap<PathBuf, bool>,
}

impl GitignoreMatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute, under the root) is ignored
    pub fn matches(&mut self, path: &Path, is_dir: bool) -> Result<bool> {
        if path == self.root || !path.starts_with(&self.root) {
            return Ok(false);
        }
        if is_dir {
            if let Some(&ignored) = self.dirs.get(path) {
                return Ok(ignored);
            }
        }

        let ignored = match self.decide(path, is_dir)? {
            Some(ignored) => ignored,
            None => match path.parent() {
                Some(parent) => self.matches(parent, true)?,
                None => false,
            },
        };

        if is_dir {
            self.dirs.insert(path.to_path_buf(), ignored);
        }
        Ok(ignored)
    }

    /// The verdict of the deepest `.gitignore` with a rule for `path` itself
    fn decide(&mut self, path: &Path, is_dir: bool) -> Result<Option<bool>> {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if !current.starts_with(&self.root) {
                break;
            }
            if let Some(gitignore) = self.load(current)? {
                let m = gitignore.matched(path, is_dir);
                if m.is_ignore() {
                    return Ok(Some(true));
                }
                if m.is_whitelist() {
                    return Ok(Some(false));
                }
            }
            if current == self.root {
                break;
            }
            dir = current.parent();
        }
        Ok(None)
    }

    fn load(&mut self, dir: &Path) -> Result<Option<&Gitignore>> {
        if !self.files.contains_key(dir) {
            let parsed = parse_gitignore(dir)?;
            self.files.insert(dir.to_path_buf(), parsed);
        }
        Ok(self.files.get(dir).and_then(Option::as_ref))
    }
}

fn parse_gitignore(dir: &Path) -> Result<Option<Gitignore>> {
    let file = dir.join(".gitignore");
    let content = match std::fs::read_to_string(&file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut builder = GitignoreBuilder::new(dir);
    for line in content.lines() {
        builder
            .add_line(Some(file.clone()), line)
            .map_err(|e| SyncError::FilterPattern(format!("{}: {}", file.display(), e)))?;
    }
    let gitignore = builder
        .build()
        .map_err(|e| SyncError::FilterPattern(format!("{}: {}", file.display(), e)))?;
    debug!(path = %file.display(), rules = gitignore.num_ignores() + gitignore.num_whitelists(), "Loaded .gitignore");
    Ok(Some(gitignore))
}
