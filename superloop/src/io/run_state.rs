//! Per-loop run state (`.superloop/loops/<loop>/run_state.json`).
//!
//! A loop has at most one active run. The token is `active.lock` beside the
//! state file, created with `create_new` so only one entrant wins; the
//! `active` flag mirrors it for `status` and `cancel`. The driver releases
//! both on every exit path.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::LoopError;
use crate::core::stuck::{NoProgressState, StuckState};
use crate::core::types::{LoopStop, ResumeHint, Role};
use crate::io::fsutil::{read_json_opt, write_json};

/// A rate-limited role waiting to be resumed on the next run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingResume {
    pub role: Role,
    /// Agent call label the hint belongs to (`implementer`, `scripted/2`).
    #[serde(default)]
    pub label: String,
    pub hint: ResumeHint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopRunState {
    pub loop_id: String,
    pub active: bool,
    pub run_id: Option<String>,
    /// Iteration in progress, or the next one to run (1-indexed).
    pub current_iteration: u32,
    /// Roles of `current_iteration` that already finished.
    pub completed_roles: Vec<Role>,
    /// Scripted sessions (1-indexed) of `current_iteration` that already finished.
    pub completed_scripted: Vec<usize>,
    pub stuck: StuckState,
    pub no_progress: NoProgressState,
    pub pending_resume: Option<PendingResume>,
    pub last_stop: Option<LoopStop>,
    /// Reviewer feedback from a rejected approval, injected into the next prompts.
    pub rejection_note: Option<String>,
    pub completed: bool,
    pub updated_at: Option<String>,
}

impl Default for LoopRunState {
    fn default() -> Self {
        Self {
            loop_id: String::new(),
            active: false,
            run_id: None,
            current_iteration: 1,
            completed_roles: Vec::new(),
            completed_scripted: Vec::new(),
            stuck: StuckState::default(),
            no_progress: NoProgressState::default(),
            pending_resume: None,
            last_stop: None,
            rejection_note: None,
            completed: false,
            updated_at: None,
        }
    }
}

impl LoopRunState {
    pub fn new(loop_id: &str) -> Self {
        Self {
            loop_id: loop_id.to_string(),
            ..Self::default()
        }
    }

    pub fn role_completed(&self, role: Role) -> bool {
        self.completed_roles.contains(&role)
    }

    pub fn mark_role_completed(&mut self, role: Role) {
        if !self.role_completed(role) {
            self.completed_roles.push(role);
        }
    }

    pub fn scripted_completed(&self, session: usize) -> bool {
        self.completed_scripted.contains(&session)
    }

    pub fn mark_scripted_completed(&mut self, session: usize) {
        if !self.scripted_completed(session) {
            self.completed_scripted.push(session);
        }
    }

    /// Whether the current iteration was interrupted part-way.
    pub fn has_partial_progress(&self) -> bool {
        !self.completed_roles.is_empty()
            || !self.completed_scripted.is_empty()
            || self.pending_resume.is_some()
    }

    /// Move to the next iteration, dropping per-iteration progress.
    pub fn advance_iteration(&mut self) {
        self.current_iteration += 1;
        self.completed_roles.clear();
        self.completed_scripted.clear();
        self.pending_resume = None;
    }

    /// Pending resume hint for the agent call labelled `label`, if any.
    pub fn resume_hint_for(&self, label: &str) -> Option<ResumeHint> {
        self.pending_resume
            .as_ref()
            .filter(|p| p.label == label)
            .map(|p| p.hint.clone())
    }

    /// Drop the pending hint once the call labelled `label` has finished.
    pub fn clear_resume_for(&mut self, label: &str) {
        if self.pending_resume.as_ref().is_some_and(|p| p.label == label) {
            self.pending_resume = None;
        }
    }
}

/// Load run state, or a fresh state when the file is missing.
pub fn load_run_state(path: &Path, loop_id: &str) -> Result<LoopRunState> {
    let state = read_json_opt::<LoopRunState>(path)
        .with_context(|| format!("load run state for loop {loop_id}"))?
        .unwrap_or_else(|| LoopRunState::new(loop_id));
    debug!(
        loop_id,
        active = state.active,
        iteration = state.current_iteration,
        "run state loaded"
    );
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &mut LoopRunState) -> Result<()> {
    state.updated_at = Some(crate::io::events::now_rfc3339());
    debug!(
        path = %path.display(),
        run_id = ?state.run_id,
        iteration = state.current_iteration,
        active = state.active,
        "writing run state"
    );
    write_json(path, state)
}

/// Name of the lock file created next to `run_state.json` while a run is active.
pub const ACTIVE_LOCK_FILE: &str = "active.lock";

fn lock_path(state_path: &Path) -> PathBuf {
    state_path.with_file_name(ACTIVE_LOCK_FILE)
}

fn create_lock(lock: &Path) -> std::io::Result<()> {
    if let Some(parent) = lock.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(lock)?;
    writeln!(
        file,
        "pid={} started_at={}",
        std::process::id(),
        crate::io::events::now_rfc3339()
    )
}

fn remove_lock(lock: &Path) -> Result<()> {
    match fs::remove_file(lock) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", lock.display())),
    }
}

fn already_running(loop_id: &str) -> anyhow::Error {
    LoopError::AlreadyRunning {
        loop_id: loop_id.to_string(),
    }
    .into()
}

/// Take the loop's active-run lock and mark the state active.
///
/// Fails with `LoopError::AlreadyRunning` when the lock exists, unless `force`
/// removes a stale one first.
pub fn acquire_active(path: &Path, loop_id: &str, force: bool) -> Result<LoopRunState> {
    let lock = lock_path(path);
    match create_lock(&lock) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            if !force {
                return Err(already_running(loop_id));
            }
            warn!(loop_id, lock = %lock.display(), "removing stale active lock (--force)");
            remove_lock(&lock)?;
            match create_lock(&lock) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(already_running(loop_id));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", lock.display()));
                }
            }
        }
        Err(err) => return Err(err).with_context(|| format!("create {}", lock.display())),
    }

    let marked = load_run_state(path, loop_id).and_then(|mut state| {
        state.loop_id = loop_id.to_string();
        state.active = true;
        write_run_state(path, &mut state)?;
        Ok(state)
    });
    if marked.is_err() {
        remove_lock(&lock)?;
    }
    marked
}

/// Clear the active flag, then drop the lock.
pub fn release_active(path: &Path, state: &mut LoopRunState) -> Result<()> {
    state.active = false;
    write_run_state(path, state)?;
    remove_lock(&lock_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StopReason;

    #[test]
    fn missing_state_is_fresh() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_run_state(&temp.path().join("run_state.json"), "demo").expect("load");
        assert_eq!(state.loop_id, "demo");
        assert_eq!(state.current_iteration, 1);
        assert!(!state.active);
    }

    /// Verifies write → read preserves resumable fields.
    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");
        let mut state = LoopRunState {
            run_id: Some("run-1".to_string()),
            current_iteration: 4,
            completed_roles: vec![Role::Planner, Role::Implementer],
            pending_resume: Some(PendingResume {
                role: Role::Tester,
                label: "tester".to_string(),
                hint: ResumeHint::SessionId("abc".to_string()),
            }),
            last_stop: Some(LoopStop {
                reason: StopReason::RateLimit,
                detail: "limit".to_string(),
            }),
            ..LoopRunState::new("demo")
        };
        write_run_state(&path, &mut state).expect("write");
        let loaded = load_run_state(&path, "demo").expect("load");
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.resume_hint_for("tester"),
            Some(ResumeHint::SessionId("abc".to_string()))
        );
        assert_eq!(loaded.resume_hint_for("planner"), None);
    }

    #[test]
    fn second_acquire_fails_until_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");
        let mut state = acquire_active(&path, "demo", false).expect("acquire");

        let err = acquire_active(&path, "demo", false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::AlreadyRunning { .. })
        ));

        release_active(&path, &mut state).expect("release");
        acquire_active(&path, "demo", false).expect("reacquire");
    }

    #[test]
    fn force_clears_stale_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");
        acquire_active(&path, "demo", false).expect("acquire");
        let mut state = acquire_active(&path, "demo", true).expect("force acquire");
        assert!(state.active);

        release_active(&path, &mut state).expect("release");
        assert!(!temp.path().join(ACTIVE_LOCK_FILE).exists());
    }

    #[test]
    fn concurrent_acquire_admits_exactly_one() {
        use std::sync::Barrier;

        for _ in 0..50 {
            let temp = tempfile::tempdir().expect("tempdir");
            let path = temp.path().join("run_state.json");
            let barrier = Barrier::new(2);
            let (barrier, path) = (&barrier, &path);
            let results: Vec<Result<LoopRunState>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        scope.spawn(move || {
                            barrier.wait();
                            acquire_active(path, "demo", false)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("join"))
                    .collect()
            });

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            let loser = results.into_iter().find_map(Result::err).expect("loser");
            assert!(matches!(
                loser.downcast_ref::<LoopError>(),
                Some(LoopError::AlreadyRunning { .. })
            ));
        }
    }

    #[test]
    fn advance_iteration_clears_role_progress() {
        let mut state = LoopRunState::new("demo");
        state.mark_role_completed(Role::Planner);
        state.mark_role_completed(Role::Planner);
        state.mark_scripted_completed(1);
        assert_eq!(state.completed_roles, vec![Role::Planner]);
        assert!(state.has_partial_progress());
        state.advance_iteration();
        assert_eq!(state.current_iteration, 2);
        assert!(state.completed_roles.is_empty());
        assert!(!state.has_partial_progress());
    }
}
