//! Read-only git queries used for signatures and reconnaissance snapshots.
//!
//! Superloop never commits or switches branches; agents own the working tree.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree and git is installed.
    pub fn is_repo(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(err) => {
                debug!(err = %err, "git unavailable");
                false
            }
        }
    }

    /// Tracked plus untracked-but-not-ignored files, relative to `workdir`.
    pub fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run_checked(&["ls-files", "-z", "-co", "--exclude-standard"])?;
        let mut files: Vec<String> = out
            .stdout
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_checked(&["status", "--porcelain=v1", "-uall"])?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        let mut entries = Vec::new();
        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Porcelain quotes paths with special characters; keep the inner text.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? notes/todo.md").expect("parse");
        assert_eq!(e.code, "??");
        assert_eq!(e.path, "notes/todo.md");
    }

    #[test]
    fn parses_rename_and_quoted_paths() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
        let q = parse_status_line(" M \"with space.txt\"").expect("parse");
        assert_eq!(q.path, "with space.txt");
    }

    #[test]
    fn non_repo_is_detected() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repo());
    }
}
