//! Glob matching over a directory tree.
//!
//! Patterns are relative to the walked root. `*` and `?` stay within one
//! path segment, `**` crosses segments, a trailing `/` matches everything
//! below a directory and a leading `!` turns a pattern into an exclusion.
//! A pattern without `/` matches at any depth.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{SyncError, SyncResult};

/// Always skipped when collecting files.
pub const DEFAULT_IGNORE: &[&str] = &[".git/", ".trialgrid/", "__pycache__/", "node_modules/"];

fn glob_to_regex(pattern: &str) -> SyncResult<Regex> {
    let pattern = pattern.trim_start_matches("./");
    let anywhere = !pattern.trim_end_matches('/').contains('/');
    let mut re = String::from(if anywhere { "^(?:.*/)?" } else { "^" });

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    if pattern.ends_with('/') {
        re.push_str(".*");
    } else {
        // A directory name also matches everything inside it.
        re.push_str("(?:/.*)?");
    }
    re.push('$');
    Regex::new(&re).map_err(|e| SyncError::Pattern(format!("{pattern}: {e}")))
}

/// Include/exclude matcher built from a pattern list.
#[derive(Debug, Clone, Default)]
pub struct FileMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl FileMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S], ignore: &[S]) -> SyncResult<Self> {
        let mut matcher = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match pattern.strip_prefix('!') {
                Some(excluded) => matcher.exclude.push(glob_to_regex(excluded)?),
                None => matcher.include.push(glob_to_regex(pattern)?),
            }
        }
        for pattern in ignore.iter().map(AsRef::as_ref).chain(DEFAULT_IGNORE.iter().copied()) {
            // "!x" in an ignore list re-includes; only plain entries exclude.
            if !pattern.starts_with('!') {
                matcher.exclude.push(glob_to_regex(pattern)?);
            }
        }
        Ok(matcher)
    }

    /// With no include patterns everything not excluded matches.
    pub fn is_match(&self, relative: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|re| re.is_match(relative)))
            && !self.exclude.iter().any(|re| re.is_match(relative))
    }
}

/// Relative paths (with `/` separators) of matching files under `root`,
/// sorted.
pub fn find_files(root: &Path, matcher: &FileMatcher) -> SyncResult<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if matcher.is_match(&relative) {
            found.push(relative);
        }
    }
    found.sort();
    Ok(found)
}

/// Copy matching files from `from` into `to`, keeping relative paths.
pub fn copy_files(from: &Path, to: &Path, matcher: &FileMatcher) -> SyncResult<Vec<PathBuf>> {
    let files = find_files(from, matcher)?;
    let mut copied = Vec::with_capacity(files.len());
    for relative in files {
        let target = to.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from.join(&relative), &target)?;
        copied.push(target);
    }
    debug!(from = %from.display(), to = %to.display(), count = copied.len(), "files copied");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str], ignore: &[&str]) -> FileMatcher {
        FileMatcher::new(patterns, ignore).unwrap()
    }

    #[test]
    fn glob_semantics() {
        let m = matcher(&["*.py", "models/", "logs/**/*.log"], &[]);
        assert!(m.is_match("train.py"));
        assert!(m.is_match("src/util.py"));
        assert!(m.is_match("models/best/weights.h5"));
        assert!(m.is_match("logs/a/b/run.log"));
        assert!(m.is_match("logs/run.log"));
        assert!(!m.is_match("README.md"));
        assert!(!m.is_match("logs/run.txt"));
    }

    #[test]
    fn exclusions_win() {
        let m = matcher(&["**/*", "!secret.txt"], &["data/"]);
        assert!(m.is_match("a/b.txt"));
        assert!(!m.is_match("secret.txt"));
        assert!(!m.is_match("data/big.bin"));
        assert!(!m.is_match(".git/HEAD"));
        assert!(!m.is_match(".trialgrid/job.json"));
    }

    #[test]
    fn finds_and_copies() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("pkg")).unwrap();
        std::fs::create_dir_all(src.path().join(".git")).unwrap();
        std::fs::write(src.path().join("main.py"), "print(1)").unwrap();
        std::fs::write(src.path().join("pkg/model.py"), "").unwrap();
        std::fs::write(src.path().join("notes.md"), "").unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "").unwrap();

        let empty: &[&str] = &[];
        let all = find_files(src.path(), &matcher(empty, empty)).unwrap();
        assert_eq!(all, vec!["main.py", "notes.md", "pkg/model.py"]);

        let copied = copy_files(src.path(), dst.path(), &matcher(&["*.py"], empty)).unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(std::fs::read_to_string(dst.path().join("main.py")).unwrap(), "print(1)");
        assert!(dst.path().join("pkg/model.py").exists());
    }
}
