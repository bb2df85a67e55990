//! Product artifacts for a loop: the `events.jsonl` audit log, the typed
//! `run-summary.json` record and the append-only `timeline.md`.
//!
//! These are always written, independent of `RUST_LOG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{ChildState, GateStatus, IterationPhase, LoopStop, Role};
use crate::io::fsutil::{append_line, read_json_opt, write_json};

/// UTC timestamp in RFC 3339 with second precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One typed entry of the events log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        iteration: u32,
        resumed: bool,
    },
    Phase {
        iteration: u32,
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    RoleFinished {
        iteration: u32,
        role: Role,
        exit_code: Option<i32>,
        duration_ms: u64,
        promise_matched: bool,
    },
    RoleSkipped {
        iteration: u32,
        role: Role,
        reason: String,
    },
    RateLimited {
        label: String,
        attempt: u32,
        wait_secs: u64,
        resumable: bool,
    },
    ReportRestored {
        role: Role,
    },
    DelegationPlanned {
        role: Role,
        waves: usize,
        requested: usize,
    },
    ChildFinished {
        role: Role,
        wave_id: String,
        child_id: String,
        state: ChildState,
        attempts: u32,
    },
    Adaptation {
        role: Role,
        wave_id: String,
        decision: String,
        reason: String,
    },
    Gate {
        iteration: u32,
        #[serde(flatten)]
        status: GateStatus,
    },
    ApprovalRequested {
        iteration: u32,
    },
    ApprovalConsumed {
        iteration: u32,
        approved: bool,
    },
    RunCompleted {
        iteration: u32,
    },
    RunStopped {
        iteration: u32,
        #[serde(flatten)]
        stop: LoopStop,
    },
}

impl EventKind {
    pub fn phase(iteration: u32, phase: IterationPhase) -> Self {
        let (name, role) = match phase {
            IterationPhase::RunningRole(role) => ("running_role", Some(role)),
            IterationPhase::EvaluatingGates => ("evaluating_gates", None),
            IterationPhase::PendingApproval => ("pending_approval", None),
            IterationPhase::Complete => ("complete", None),
            IterationPhase::Stopped => ("stopped", None),
        };
        EventKind::Phase {
            iteration,
            phase: name.to_string(),
            role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: String,
    pub loop_id: String,
    pub run_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Appender for `events.jsonl`, bound to one loop run.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    loop_id: String,
    run_id: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, loop_id: &str, run_id: &str) -> Self {
        Self {
            path: path.into(),
            loop_id: loop_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, kind: EventKind) -> Result<()> {
        let event = Event {
            ts: now_rfc3339(),
            loop_id: self.loop_id.clone(),
            run_id: self.run_id.clone(),
            kind,
        };
        let line = serde_json::to_string(&event).context("serialize event")?;
        debug!(event = %line, "event");
        append_line(&self.path, &line)
    }
}

/// Read the events log in append order.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

/// Final state of one iteration as recorded in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationResult {
    Running,
    Continue,
    PendingApproval,
    Complete,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub run_id: String,
    pub iteration: u32,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub result: IterationResult,
    pub promise_matched: bool,
    #[serde(default)]
    pub gates: Vec<GateStatus>,
    /// Unmet gates and other feedback for the next iteration's prompts.
    #[serde(default)]
    pub notes: Vec<String>,
    /// Normalized failure lines from the tests gate, capped.
    #[serde(default)]
    pub test_failures: Vec<String>,
    pub code_signature: Option<String>,
    pub test_failure_signature: Option<String>,
    pub stuck_streak: u32,
    pub stop: Option<LoopStop>,
}

impl IterationSummary {
    pub fn started(run_id: &str, iteration: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            iteration,
            started_at: now_rfc3339(),
            ended_at: None,
            result: IterationResult::Running,
            promise_matched: false,
            gates: Vec::new(),
            notes: Vec::new(),
            test_failures: Vec::new(),
            code_signature: None,
            test_failure_signature: None,
            stuck_streak: 0,
            stop: None,
        }
    }
}

/// `run-summary.json`: every iteration of every run of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub loop_id: String,
    pub updated_at: Option<String>,
    #[serde(default)]
    pub iterations: Vec<IterationSummary>,
}

impl RunSummary {
    pub fn latest(&self) -> Option<&IterationSummary> {
        self.iterations.last()
    }
}

pub fn load_run_summary(path: &Path, loop_id: &str) -> Result<RunSummary> {
    Ok(read_json_opt::<RunSummary>(path)?.unwrap_or_else(|| RunSummary {
        loop_id: loop_id.to_string(),
        ..RunSummary::default()
    }))
}

/// Read-modify-write the summary, replacing the entry with the same run and
/// iteration or appending a new one.
pub fn upsert_iteration_summary(path: &Path, loop_id: &str, entry: &IterationSummary) -> Result<()> {
    let mut summary = load_run_summary(path, loop_id)?;
    match summary
        .iterations
        .iter_mut()
        .find(|e| e.run_id == entry.run_id && e.iteration == entry.iteration)
    {
        Some(existing) => *existing = entry.clone(),
        None => summary.iterations.push(entry.clone()),
    }
    summary.updated_at = Some(now_rfc3339());
    write_json(path, &summary)
}

/// Append a `- <ts> <text>` line to `timeline.md`.
pub fn append_timeline(path: &Path, text: &str) -> Result<()> {
    append_line(path, &format!("- {} {}", now_rfc3339(), text))
}
