//! Read-side helpers and human controls for `list`, `status`, `approve`,
//! `reject` and `cancel`.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::core::types::{ApprovalStatus, LoopStop, Role};
use crate::io::approval::{ApprovalRequest, decide_approval, load_approval};
use crate::io::config::load_config;
use crate::io::events::{IterationSummary, load_run_summary, now_rfc3339};
use crate::io::fsutil::write_atomic;
use crate::io::init::SuperloopPaths;
use crate::io::run_state::load_run_state;

/// One row of `superloop list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopListing {
    pub id: String,
    pub spec_file: String,
    pub active: bool,
    pub completed: bool,
    pub current_iteration: u32,
    pub approval: Option<ApprovalStatus>,
}

/// Snapshot of a loop for `superloop status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub loop_id: String,
    pub active: bool,
    pub completed: bool,
    pub run_id: Option<String>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub completed_roles: Vec<Role>,
    pub stuck_streak: u32,
    pub stuck_threshold: u32,
    /// Role that will resume a rate-limited session on the next run.
    pub pending_resume: Option<Role>,
    pub last_stop: Option<LoopStop>,
    pub approval: Option<ApprovalRequest>,
    pub latest: Option<IterationSummary>,
}

pub fn list_loops(root: &Path) -> Result<Vec<LoopListing>> {
    let paths = SuperloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    config
        .loops
        .iter()
        .map(|lp| {
            let loop_paths = paths.loop_paths(&lp.id);
            let state = load_run_state(&loop_paths.run_state_path, &lp.id)?;
            let approval = load_approval(&loop_paths.approval_path)?.map(|a| a.status);
            Ok(LoopListing {
                id: lp.id.clone(),
                spec_file: lp.spec_file.clone(),
                active: state.active,
                completed: state.completed,
                current_iteration: state.current_iteration,
                approval,
            })
        })
        .collect()
}

pub fn loop_status(root: &Path, loop_id: &str) -> Result<LoopStatus> {
    let paths = SuperloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let lp = config.find_loop(loop_id)?;
    let loop_paths = paths.loop_paths(loop_id);
    let state = load_run_state(&loop_paths.run_state_path, loop_id)?;
    let summary = load_run_summary(&loop_paths.run_summary_path, loop_id)?;
    Ok(LoopStatus {
        loop_id: loop_id.to_string(),
        active: state.active,
        completed: state.completed,
        run_id: state.run_id.clone(),
        current_iteration: state.current_iteration,
        max_iterations: lp.max_iterations,
        completed_roles: state.completed_roles.clone(),
        stuck_streak: state.stuck.streak,
        stuck_threshold: lp.stuck.threshold,
        pending_resume: state.pending_resume.as_ref().map(|p| p.role),
        last_stop: state.last_stop.clone(),
        approval: load_approval(&loop_paths.approval_path)?,
        latest: summary.latest().cloned(),
    })
}

/// Plain-text rendering of a status snapshot.
pub fn render_status(status: &LoopStatus) -> String {
    let mut out = String::new();
    let state = if status.completed {
        "complete"
    } else if status.active {
        "running"
    } else {
        "idle"
    };
    let _ = writeln!(out, "loop: {} ({state})", status.loop_id);
    let _ = writeln!(
        out,
        "iteration: {}/{}",
        status.current_iteration, status.max_iterations
    );
    if let Some(run_id) = &status.run_id {
        let _ = writeln!(out, "run: {run_id}");
    }
    if !status.completed_roles.is_empty() {
        let roles: Vec<&str> = status.completed_roles.iter().map(|r| r.as_str()).collect();
        let _ = writeln!(out, "completed roles: {}", roles.join(", "));
    }
    let _ = writeln!(
        out,
        "stuck streak: {}/{}",
        status.stuck_streak, status.stuck_threshold
    );
    if let Some(role) = status.pending_resume {
        let _ = writeln!(out, "pending resume: {role}");
    }
    if let Some(stop) = &status.last_stop {
        let _ = writeln!(out, "last stop: {} ({})", stop.reason, stop.detail);
    }
    if let Some(approval) = &status.approval {
        let _ = writeln!(
            out,
            "approval: {:?} for iteration {}",
            approval.status, approval.iteration
        );
        for line in &approval.summary {
            let _ = writeln!(out, "  {line}");
        }
    }
    if let Some(latest) = &status.latest {
        let _ = writeln!(
            out,
            "latest iteration {}: {:?} (promise {})",
            latest.iteration,
            latest.result,
            if latest.promise_matched { "matched" } else { "missing" }
        );
        for gate in &latest.gates {
            let verdict = match (gate.skipped, gate.ok) {
                (true, _) => "skipped",
                (false, true) => "ok",
                (false, false) => "failed",
            };
            let _ = writeln!(out, "  {}: {verdict} {}", gate.gate.as_str(), gate.detail);
        }
    }
    out
}

/// Record a human decision on the loop's pending approval request.
pub fn decide(
    root: &Path,
    loop_id: &str,
    decision: ApprovalStatus,
    by: Option<&str>,
    note: Option<&str>,
) -> Result<ApprovalRequest> {
    let paths = SuperloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    config.find_loop(loop_id)?;
    let loop_paths = paths.loop_paths(loop_id);
    decide_approval(&loop_paths.approval_path, decision, by, note)
        .with_context(|| format!("decide approval for loop {loop_id}"))
}

/// Ask a running loop to stop at the next role boundary.
pub fn cancel(root: &Path, loop_id: &str) -> Result<()> {
    let paths = SuperloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    config.find_loop(loop_id)?;
    let loop_paths = paths.loop_paths(loop_id);
    let state = load_run_state(&loop_paths.run_state_path, loop_id)?;
    if !state.active {
        bail!("loop {loop_id:?} is not running");
    }
    write_atomic(&loop_paths.cancel_path, now_rfc3339().as_bytes())?;
    info!(loop_id, "cancel requested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StopReason;
    use crate::io::approval::request_approval;
    use crate::io::init::{InitOptions, init_superloop};
    use crate::io::run_state::{acquire_active, write_run_state};

    fn workspace() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
        temp
    }

    #[test]
    fn fresh_workspace_lists_default_loop() {
        let temp = workspace();
        let loops = list_loops(temp.path()).expect("list");
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].id, "main");
        assert!(!loops[0].active);
        assert_eq!(loops[0].current_iteration, 1);
        assert_eq!(loops[0].approval, None);
    }

    #[test]
    fn status_reports_last_stop_and_approval() {
        let temp = workspace();
        let loop_paths = SuperloopPaths::new(temp.path()).loop_paths("main");
        let mut state = acquire_active(&loop_paths.run_state_path, "main", false).expect("acquire");
        state.active = false;
        state.last_stop = Some(LoopStop {
            reason: StopReason::Stuck,
            detail: "no progress".to_string(),
        });
        write_run_state(&loop_paths.run_state_path, &mut state).expect("write");
        request_approval(&loop_paths.approval_path, "main", "run-1", 2, vec![
            "tests: ok".to_string(),
        ])
        .expect("request");

        let status = loop_status(temp.path(), "main").expect("status");
        assert_eq!(status.last_stop.as_ref().map(|s| s.reason), Some(StopReason::Stuck));
        let text = render_status(&status);
        assert!(text.contains("last stop: stuck (no progress)"));
        assert!(text.contains("approval: Pending for iteration 2"));
        assert!(text.contains("tests: ok"));
    }

    #[test]
    fn reject_records_note() {
        let temp = workspace();
        let loop_paths = SuperloopPaths::new(temp.path()).loop_paths("main");
        request_approval(&loop_paths.approval_path, "main", "run-1", 1, Vec::new())
            .expect("request");
        let decided = decide(
            temp.path(),
            "main",
            ApprovalStatus::Rejected,
            Some("ana"),
            Some("tighten error messages"),
        )
        .expect("decide");
        assert_eq!(decided.status, ApprovalStatus::Rejected);
        assert_eq!(decided.note.as_deref(), Some("tighten error messages"));
    }

    #[test]
    fn approve_without_request_fails() {
        let temp = workspace();
        let err = decide(temp.path(), "main", ApprovalStatus::Approved, None, None).unwrap_err();
        assert!(format!("{err:#}").contains("no approval request"));
    }

    #[test]
    fn cancel_requires_running_loop() {
        let temp = workspace();
        assert!(cancel(temp.path(), "main").is_err());

        let loop_paths = SuperloopPaths::new(temp.path()).loop_paths("main");
        acquire_active(&loop_paths.run_state_path, "main", false).expect("acquire");
        cancel(temp.path(), "main").expect("cancel");
        assert!(loop_paths.cancel_path.is_file());
    }

    #[test]
    fn unknown_loop_is_rejected() {
        let temp = workspace();
        assert!(loop_status(temp.path(), "ghost").is_err());
    }
}
