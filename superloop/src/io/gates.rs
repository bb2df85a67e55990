//! Gate evaluators: checklist, tests, validation and evidence.
//!
//! Each evaluator returns a `GateStatus` and writes `<gate>-status.json` into
//! the iteration's `gates/` directory. Gate failures are data, never errors.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{GateKind, GateStatus};
use crate::io::config::{ChecklistGate, EvidenceGate};
use crate::io::fsutil::{write_atomic, write_json};
use crate::io::init::IterationPaths;
use crate::io::process::run_shell_with_timeout;

pub const DEFAULT_GATE_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*+]\s+\[([ xX])\]\s+(.*?)\s*$").expect("checkbox regex")
});

/// One gate command invocation.
#[derive(Debug, Clone)]
pub struct GateCommandRequest {
    pub gate: GateKind,
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCommandResult {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl GateCommandResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

pub trait GateCommandRunner: Sync {
    fn run(&self, request: &GateCommandRequest) -> Result<GateCommandResult>;
}

/// Runs gate commands through `sh -c` with a timeout and bounded output.
pub struct ShellGateRunner {
    pub output_limit_bytes: usize,
}

impl Default for ShellGateRunner {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_GATE_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl GateCommandRunner for ShellGateRunner {
    #[instrument(skip_all, fields(gate = request.gate.as_str(), command = %request.command))]
    fn run(&self, request: &GateCommandRequest) -> Result<GateCommandResult> {
        let out = run_shell_with_timeout(
            &request.command,
            &request.workdir,
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {} command", request.gate.as_str()))?;
        Ok(GateCommandResult {
            exit_code: out.exit_code(),
            output: out.combined(),
            timed_out: out.timed_out,
        })
    }
}

pub fn write_gate_status(paths: &IterationPaths, status: &GateStatus) -> Result<()> {
    write_json(&paths.gate_status_path(status.gate), status)
}

/// Result of scanning checklist files for markdown checkboxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChecklistScan {
    pub files: Vec<String>,
    pub total: usize,
    pub checked: usize,
    /// Unchecked items as `path: text`.
    pub remaining: Vec<String>,
}

impl ChecklistScan {
    pub fn remaining_count(&self) -> u32 {
        u32::try_from(self.remaining.len()).unwrap_or(u32::MAX)
    }
}

/// Expand repo-relative glob patterns to sorted, deduplicated relative paths.
pub fn expand_patterns(root: &Path, patterns: &[String]) -> Result<Vec<String>> {
    let mut matched = BTreeSet::new();
    for pattern in patterns {
        for rel in expand_pattern(root, pattern)? {
            matched.insert(rel);
        }
    }
    Ok(matched.into_iter().collect())
}

fn expand_pattern(root: &Path, pattern: &str) -> Result<Vec<String>> {
    // Only the pattern is glob syntax; the root is matched literally.
    let root_text = root.to_string_lossy();
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(root_text.trim_end_matches(['/', '\\'])),
        pattern.trim_start_matches('/')
    );
    let mut out = Vec::new();
    for entry in glob::glob(&full).with_context(|| format!("invalid glob '{pattern}'"))? {
        let path = entry.with_context(|| format!("expand glob '{pattern}'"))?;
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        // Rendered prompts repeat checklist items; never count run artifacts.
        if rel.starts_with(".superloop/") && rel.contains("/runs/") {
            continue;
        }
        out.push(rel);
    }
    Ok(out)
}

pub fn scan_checklists(root: &Path, patterns: &[String]) -> Result<ChecklistScan> {
    let mut scan = ChecklistScan {
        files: expand_patterns(root, patterns)?,
        ..ChecklistScan::default()
    };
    for rel in &scan.files {
        let path = root.join(rel);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let contents = String::from_utf8_lossy(&bytes);
        for line in contents.lines() {
            let Some(caps) = CHECKBOX_RE.captures(line) else {
                continue;
            };
            scan.total += 1;
            if caps[1].eq_ignore_ascii_case("x") {
                scan.checked += 1;
            } else {
                scan.remaining.push(format!("{rel}: {}", &caps[2]));
            }
        }
    }
    Ok(scan)
}

/// Checklist gate: ok iff no unchecked box remains in the matched files.
///
/// With no patterns configured the gate is skipped and counts as ok. Patterns
/// that match no file fail the gate.
#[instrument(skip_all, fields(patterns = gate.patterns.len()))]
pub fn evaluate_checklist(
    root: &Path,
    gate: &ChecklistGate,
    paths: &IterationPaths,
) -> Result<(GateStatus, ChecklistScan)> {
    if gate.patterns.is_empty() {
        let status = GateStatus::skipped(GateKind::Checklist, true, "no checklist configured");
        write_gate_status(paths, &status)?;
        return Ok((status, ChecklistScan::default()));
    }
    let scan = scan_checklists(root, &gate.patterns)?;
    let status = if scan.files.is_empty() {
        GateStatus::failed(GateKind::Checklist, "no checklist files matched")
    } else if scan.remaining.is_empty() {
        GateStatus::passed(
            GateKind::Checklist,
            format!("{} of {} items checked", scan.checked, scan.total),
        )
    } else {
        GateStatus::failed(
            GateKind::Checklist,
            format!("{} of {} items remaining", scan.remaining.len(), scan.total),
        )
    };
    debug!(ok = status.ok, remaining = scan.remaining.len(), "checklist evaluated");
    write_gate_status(paths, &status)?;
    write_json(&paths.gates_dir.join("checklist-remaining.json"), &scan.remaining)?;
    Ok((status, scan))
}

/// Parameters for a command-backed gate (tests or validation).
pub struct CommandGate<'a> {
    pub kind: GateKind,
    pub commands: &'a [String],
    pub timeout: Duration,
    pub workdir: &'a Path,
    /// Combined output of every command that ran is written here.
    pub output_path: &'a Path,
}

#[derive(Debug, Clone)]
pub struct CommandGateOutcome {
    pub status: GateStatus,
    pub output: String,
}

/// Run the gate's commands in order, stopping at the first failure.
///
/// A gate with no commands is recorded as skipped and counts as ok.
pub fn evaluate_command_gate<R: GateCommandRunner + ?Sized>(
    gate: &CommandGate<'_>,
    runner: &R,
    paths: &IterationPaths,
) -> Result<CommandGateOutcome> {
    if gate.commands.is_empty() {
        write_atomic(gate.output_path, b"")?;
        return Ok(CommandGateOutcome {
            status: skip_gate(paths, gate.kind, true, "no commands configured")?,
            output: String::new(),
        });
    }
    let mut output = String::new();
    let mut failure = None;
    for command in gate.commands {
        let result = runner.run(&GateCommandRequest {
            gate: gate.kind,
            command: command.clone(),
            workdir: gate.workdir.to_path_buf(),
            timeout: gate.timeout,
        })?;
        output.push_str(&format!("$ {command}\n"));
        output.push_str(&result.output);
        if !output.ends_with('\n') {
            output.push('\n');
        }
        if !result.success() {
            let detail = if result.timed_out {
                format!("`{command}` timed out after {}s", gate.timeout.as_secs())
            } else {
                format!("`{command}` exited with {:?}", result.exit_code)
            };
            failure = Some(detail);
            break;
        }
    }

    write_atomic(gate.output_path, output.as_bytes())?;
    let status = match failure {
        Some(detail) => {
            info!(gate = gate.kind.as_str(), %detail, "gate failed");
            GateStatus::failed(gate.kind, detail)
        }
        None => GateStatus::passed(
            gate.kind,
            format!("{} command(s) passed", gate.commands.len()),
        ),
    };
    write_gate_status(paths, &status)?;
    Ok(CommandGateOutcome { status, output })
}

/// Record a gate that did not run this iteration.
pub fn skip_gate(
    paths: &IterationPaths,
    kind: GateKind,
    ok: bool,
    detail: &str,
) -> Result<GateStatus> {
    let status = GateStatus::skipped(kind, ok, detail);
    write_gate_status(paths, &status)?;
    Ok(status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

/// `evidence.json`: hashes of every artifact matched by the evidence patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvidenceManifest {
    pub generated_at: String,
    pub entries: Vec<EvidenceEntry>,
    /// Patterns that matched no file.
    pub missing: Vec<String>,
}

/// Evidence gate: every configured pattern must match at least one file.
#[instrument(skip_all, fields(required = gate.required))]
pub fn evaluate_evidence(
    root: &Path,
    gate: &EvidenceGate,
    paths: &IterationPaths,
) -> Result<GateStatus> {
    if !gate.required && gate.artifacts.is_empty() {
        return skip_gate(paths, GateKind::Evidence, true, "evidence not required");
    }

    let mut manifest = EvidenceManifest {
        generated_at: crate::io::events::now_rfc3339(),
        ..EvidenceManifest::default()
    };
    let mut seen = BTreeSet::new();
    for pattern in &gate.artifacts {
        let matched = expand_pattern(root, pattern)?;
        if matched.is_empty() {
            manifest.missing.push(pattern.clone());
            continue;
        }
        for rel in matched {
            if !seen.insert(rel.clone()) {
                continue;
            }
            let bytes = fs::read(root.join(&rel)).with_context(|| format!("read {rel}"))?;
            manifest.entries.push(EvidenceEntry {
                bytes: bytes.len() as u64,
                sha256: hex::encode(Sha256::digest(&bytes)),
                path: rel,
            });
        }
    }
    write_json(&paths.dir.join("evidence.json"), &manifest)?;

    let status = if manifest.missing.is_empty() {
        GateStatus::passed(
            GateKind::Evidence,
            format!("{} artifact(s) recorded", manifest.entries.len()),
        )
    } else {
        warn!(missing = ?manifest.missing, "evidence artifacts missing");
        GateStatus::failed(
            GateKind::Evidence,
            format!("missing artifacts: {}", manifest.missing.join(", ")),
        )
    };
    write_gate_status(paths, &status)?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorded {
        results: Mutex<Vec<GateCommandResult>>,
        commands: Mutex<Vec<String>>,
    }

    impl GateCommandRunner for Recorded {
        fn run(&self, request: &GateCommandRequest) -> Result<GateCommandResult> {
            self.commands
                .lock()
                .expect("lock")
                .push(request.command.clone());
            Ok(self.results.lock().expect("lock").remove(0))
        }
    }

    fn result(code: i32, output: &str) -> GateCommandResult {
        GateCommandResult {
            exit_code: Some(code),
            output: output.to_string(),
            timed_out: false,
        }
    }

    fn iteration_paths(root: &Path) -> IterationPaths {
        let paths = IterationPaths::new(&root.join("runs"), "run-1", 1);
        paths.create_dirs().expect("dirs");
        paths
    }

    #[test]
    fn checklist_reports_remaining_items() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(
            root.join("PLAN.md"),
            "# Plan\n- [x] parse config\n- [ ] run gates\n* [X] write events\n",
        )
        .expect("write");
        let paths = iteration_paths(root);
        let gate = ChecklistGate {
            patterns: vec!["*.md".to_string()],
        };

        let (status, scan) = evaluate_checklist(root, &gate, &paths).expect("checklist");
        assert!(!status.ok);
        assert_eq!(scan.total, 3);
        assert_eq!(scan.checked, 2);
        assert_eq!(scan.remaining, vec!["PLAN.md: run gates".to_string()]);
        assert!(paths.gate_status_path(GateKind::Checklist).is_file());
    }

    #[test]
    fn checklist_tolerates_glob_metacharacters_and_binary_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws[1]");
        fs::create_dir_all(root.join("docs")).expect("mkdir");
        fs::write(root.join("docs/TODO.md"), "- [ ] ship it\n").expect("write");
        fs::write(root.join("docs/blob.md"), b"\xff\xfe\n- [x] a\n").expect("write");
        let paths = iteration_paths(&root);
        let gate = ChecklistGate {
            patterns: vec!["docs/*.md".to_string()],
        };

        let (status, scan) = evaluate_checklist(&root, &gate, &paths).expect("checklist");
        assert!(!status.ok);
        assert_eq!(
            scan.files,
            vec!["docs/TODO.md".to_string(), "docs/blob.md".to_string()]
        );
        assert_eq!(scan.checked, 1);
        assert_eq!(scan.remaining, vec!["docs/TODO.md: ship it".to_string()]);
    }

    #[test]
    fn checklist_without_patterns_is_skipped_ok() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = iteration_paths(temp.path());
        let (status, _) =
            evaluate_checklist(temp.path(), &ChecklistGate::default(), &paths).expect("checklist");
        assert!(status.ok);
        assert!(status.skipped);
    }

    #[test]
    fn command_gate_stops_at_first_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = iteration_paths(temp.path());
        let runner = Recorded {
            results: Mutex::new(vec![result(0, "ok"), result(1, "FAILED a::b")]),
            commands: Mutex::new(Vec::new()),
        };
        let commands = vec![
            "cargo build".to_string(),
            "cargo test".to_string(),
            "never".to_string(),
        ];
        let outcome = evaluate_command_gate(
            &CommandGate {
                kind: GateKind::Tests,
                commands: &commands,
                timeout: Duration::from_secs(5),
                workdir: temp.path(),
                output_path: &paths.test_output_path,
            },
            &runner,
            &paths,
        )
        .expect("gate");

        assert!(!outcome.status.ok);
        assert!(outcome.status.detail.contains("cargo test"));
        assert!(outcome.output.contains("FAILED a::b"));
        assert_eq!(runner.commands.lock().expect("lock").len(), 2);
        let saved = fs::read_to_string(&paths.test_output_path).expect("output");
        assert!(saved.contains("$ cargo build"));
    }

    #[test]
    fn command_gate_without_commands_is_skipped_ok() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = iteration_paths(temp.path());
        let runner = Recorded {
            results: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        };
        let outcome = evaluate_command_gate(
            &CommandGate {
                kind: GateKind::Tests,
                commands: &[],
                timeout: Duration::from_secs(5),
                workdir: temp.path(),
                output_path: &paths.test_output_path,
            },
            &runner,
            &paths,
        )
        .expect("gate");
        assert!(outcome.status.ok);
        assert!(outcome.status.skipped);
        assert!(runner.commands.lock().expect("lock").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn shell_runner_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = ShellGateRunner::default()
            .run(&GateCommandRequest {
                gate: GateKind::Validation,
                command: "echo checking; exit 4".to_string(),
                workdir: temp.path().to_path_buf(),
                timeout: Duration::from_secs(10),
            })
            .expect("run");
        assert_eq!(result.exit_code, Some(4));
        assert!(!result.success());
        assert!(result.output.contains("checking"));
    }

    #[test]
    fn evidence_hashes_artifacts_and_flags_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("artifacts")).expect("mkdir");
        fs::write(root.join("artifacts/screenshot.txt"), "pixels").expect("write");
        let paths = iteration_paths(root);
        let gate = EvidenceGate {
            required: true,
            artifacts: vec!["artifacts/*.txt".to_string(), "coverage/*.xml".to_string()],
        };

        let status = evaluate_evidence(root, &gate, &paths).expect("evidence");
        assert!(!status.ok);
        assert!(status.detail.contains("coverage/*.xml"));

        let manifest: EvidenceManifest = serde_json::from_str(
            &fs::read_to_string(paths.dir.join("evidence.json")).expect("manifest"),
        )
        .expect("parse");
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].path, "artifacts/screenshot.txt");
        assert_eq!(manifest.entries[0].sha256.len(), 64);
    }
}
