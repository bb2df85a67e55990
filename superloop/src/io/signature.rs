//! Content signatures over the working tree and test output.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::io::git::Git;

/// Paths always excluded from signatures and snapshots.
const ALWAYS_IGNORED: [&str; 2] = [".superloop/", ".git/"];

/// Compiled ignore globs matched against repo-relative paths.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<glob::Pattern>,
    prefixes: Vec<String>,
}

impl IgnoreSet {
    pub fn new(globs: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(globs.len());
        let mut prefixes = Vec::new();
        for raw in globs {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            patterns
                .push(glob::Pattern::new(raw).with_context(|| format!("ignore glob {raw:?}"))?);
            let dir = raw.trim_end_matches("/**").trim_end_matches('/');
            if !dir.contains(['*', '?', '[']) {
                prefixes.push(format!("{dir}/"));
            }
        }
        Ok(Self { patterns, prefixes })
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        ALWAYS_IGNORED.iter().any(|p| rel_path.starts_with(p))
            || self.prefixes.iter().any(|p| rel_path.starts_with(p))
            || self.patterns.iter().any(|p| p.matches(rel_path))
    }
}

/// Repo-relative files considered part of the code state, sorted.
///
/// Uses `git ls-files -co --exclude-standard` in a git work tree, else walks
/// the directory.
pub fn list_files(repo_root: &Path, ignore: &IgnoreSet) -> Result<Vec<String>> {
    let git = Git::new(repo_root);
    let mut files = if git.is_repo() {
        git.ls_files()?
    } else {
        walk_files(repo_root)?
    };
    files.retain(|f| !ignore.is_ignored(f));
    files.sort();
    Ok(files)
}

fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(files)
}

fn hash_file(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(hex::encode(Sha256::digest(&bytes))),
        // Tracked but deleted in the working tree.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok("<deleted>".to_string()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Hash of the sorted `path:sha256` lines for every tracked file.
#[instrument(skip_all, fields(root = %repo_root.display()))]
pub fn compute_code_signature(repo_root: &Path, ignore_globs: &[String]) -> Result<String> {
    let ignore = IgnoreSet::new(ignore_globs)?;
    let files = list_files(repo_root, &ignore)?;
    let mut hasher = Sha256::new();
    for rel in &files {
        let digest = hash_file(&repo_root.join(rel))?;
        hasher.update(rel.as_bytes());
        hasher.update(b":");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    let signature = hex::encode(hasher.finalize());
    debug!(files = files.len(), signature = %signature, "code signature");
    Ok(signature)
}

static FAILURE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\bFAIL(?:ED|URE|URES)?\b|\bERROR\b|\bpanicked at\b|\bassert(?:ion)?[a-z_]*\b.*\bfailed\b|^\s*not ok\b|^\s*[✗✕×]\s)",
    )
    .expect("failure line regex")
});

static PASSING_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\btest result: ok\b|\b0 (?:failed|failures|errors?)\b)")
        .expect("passing summary regex")
});

static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(?::\d+)?\b").expect("location regex"));

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(?:\.\d+)?\s?(?:ms|s|sec|seconds)\b").expect("duration regex")
});

/// Normalize a failure line so that shifting line numbers or timings do not
/// change the signature.
fn normalize_failure_line(line: &str) -> String {
    let line = LOCATION_RE.replace_all(line.trim(), ":N");
    let line = DURATION_RE.replace_all(&line, "T");
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Failure lines of a test run, normalized, sorted and deduplicated.
pub fn failure_lines(output: &str) -> Vec<String> {
    let set: BTreeSet<String> = output
        .lines()
        .filter(|line| FAILURE_LINE_RE.is_match(line) && !PASSING_SUMMARY_RE.is_match(line))
        .map(normalize_failure_line)
        .filter(|line| !line.is_empty())
        .collect();
    set.into_iter().collect()
}

/// Hash of the failure lines; empty when the output has none.
pub fn compute_test_failure_signature(output: &str) -> String {
    let lines = failure_lines(output);
    if lines.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Per-file stamp: catches edits that are reverted to identical content but
/// still touched the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStamp {
    pub len: u64,
    pub modified_nanos: u128,
    pub sha256: String,
}

/// Snapshot used to prove a reconnaissance child left the tree untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TreeFingerprint {
    /// Porcelain `XY path` entries (empty outside git).
    pub dirty: BTreeSet<String>,
    pub files: BTreeMap<String, FileStamp>,
}

impl TreeFingerprint {
    /// Paths that differ between two snapshots, sorted.
    pub fn changed_paths(&self, after: &TreeFingerprint) -> Vec<String> {
        let mut changed = BTreeSet::new();
        for (path, stamp) in &self.files {
            if after.files.get(path) != Some(stamp) {
                changed.insert(path.clone());
            }
        }
        for path in after.files.keys() {
            if !self.files.contains_key(path) {
                changed.insert(path.clone());
            }
        }
        for entry in self.dirty.symmetric_difference(&after.dirty) {
            let path = entry.get(3..).unwrap_or(entry).to_string();
            changed.insert(path);
        }
        changed.into_iter().collect()
    }
}

pub fn fingerprint_tree(repo_root: &Path, ignore_globs: &[String]) -> Result<TreeFingerprint> {
    let ignore = IgnoreSet::new(ignore_globs)?;
    let git = Git::new(repo_root);
    let dirty = if git.is_repo() {
        git.status_porcelain()?
            .into_iter()
            .filter(|e| !ignore.is_ignored(&e.path))
            .map(|e| format!("{} {}", e.code, e.path))
            .collect()
    } else {
        BTreeSet::new()
    };

    let mut files = BTreeMap::new();
    for rel in list_files(repo_root, &ignore)? {
        let path = repo_root.join(&rel);
        let stamp = match fs::metadata(&path) {
            Ok(meta) => FileStamp {
                len: meta.len(),
                modified_nanos: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos()),
                sha256: hash_file(&path)?,
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileStamp {
                len: 0,
                modified_nanos: 0,
                sha256: "<deleted>".to_string(),
            },
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        };
        files.insert(rel, stamp);
    }
    Ok(TreeFingerprint { dirty, files })
}
