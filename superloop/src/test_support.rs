//! Test doubles and fixtures shared by unit and integration tests.
//!
//! `ScriptedAgentRunner` and `ScriptedGateRunner` stand in for real agent
//! processes and gate commands; `TestRepo` is a throwaway workspace with
//! `.superloop/` scaffolding.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{ResumeHint, TimeoutReason};
use crate::io::agent::{AgentInvocation, AgentRequest, AgentRunner, RateLimitHit};
use crate::io::gates::{GateCommandRequest, GateCommandResult, GateCommandRunner};
use crate::io::init::{InitOptions, LoopPaths, SuperloopPaths, init_superloop};

/// Temporary git repository with `.superloop/` initialized.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path();
        // Signatures fall back to a directory walk when git is unavailable.
        if git(root, &["init", "-q"]).is_ok() {
            git(root, &["config", "user.email", "superloop@example.com"])?;
            git(root, &["config", "user.name", "Superloop Tests"])?;
        }
        init_superloop(root, &InitOptions { force: false })?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> SuperloopPaths {
        SuperloopPaths::new(self.root())
    }

    pub fn loop_paths(&self, loop_id: &str) -> LoopPaths {
        self.paths().loop_paths(loop_id)
    }

    /// Replace `.superloop/config.toml`.
    pub fn write_config(&self, toml: &str) -> Result<()> {
        self.write_file(".superloop/config.toml", toml)
    }

    /// Write `contents` to `rel` under the repo root, creating parents.
    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.root().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !status.success() {
        return Err(anyhow!("git {args:?} failed with {status}"));
    }
    Ok(())
}

/// One scripted agent response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub exit_code: Option<i32>,
    pub timed_out: Option<TimeoutReason>,
    pub rate_limited: bool,
    pub resume_hint: Option<ResumeHint>,
    pub last_message: Option<String>,
    /// Written to `AgentRequest::output_file` when the request names one.
    pub output_file: Option<String>,
    /// Files written relative to the request's workdir before returning.
    pub files: Vec<(String, String)>,
    pub delay: Duration,
}

impl ScriptedTurn {
    pub fn ok(message: &str) -> Self {
        Self {
            exit_code: Some(0),
            last_message: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Successful turn whose last message carries `<promise>promise</promise>`.
    pub fn promise(promise: &str) -> Self {
        Self::ok(&format!("All done.\n<promise>{promise}</promise>\n"))
    }

    pub fn failed(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn timed_out(reason: TimeoutReason) -> Self {
        Self {
            exit_code: None,
            timed_out: Some(reason),
            ..Self::default()
        }
    }

    pub fn rate_limited(hint: Option<ResumeHint>) -> Self {
        Self {
            exit_code: None,
            rate_limited: true,
            resume_hint: hint,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, rel: &str, contents: &str) -> Self {
        self.files.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn with_output_file(mut self, contents: &str) -> Self {
        self.output_file = Some(contents.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What the runner saw for one invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub label: String,
    pub prompt: String,
    pub resume: Option<ResumeHint>,
}

/// Agent runner returning queued turns per label.
///
/// Labels without queued turns fall back to the label's repeating default,
/// then to a successful turn with no last message.
#[derive(Default)]
pub struct ScriptedAgentRunner {
    queued: Mutex<HashMap<String, VecDeque<ScriptedTurn>>>,
    defaults: Mutex<HashMap<String, ScriptedTurn>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `turn` for the next invocation labelled `label`.
    pub fn push(&self, label: &str, turn: ScriptedTurn) -> &Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued.entry(label.to_string()).or_default().push_back(turn);
        }
        self
    }

    /// Response used whenever `label` has nothing queued.
    pub fn set_default(&self, label: &str, turn: ScriptedTurn) -> &Self {
        if let Ok(mut defaults) = self.defaults.lock() {
            defaults.insert(label.to_string(), turn);
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Labels in invocation order.
    pub fn labels(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.label).collect()
    }

    /// Highest number of concurrent invocations observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_turn(&self, label: &str) -> Result<ScriptedTurn> {
        let mut queued = self
            .queued
            .lock()
            .map_err(|_| anyhow!("scripted runner poisoned"))?;
        if let Some(turn) = queued.get_mut(label).and_then(VecDeque::pop_front) {
            return Ok(turn);
        }
        let defaults = self
            .defaults
            .lock()
            .map_err(|_| anyhow!("scripted runner poisoned"))?;
        Ok(defaults
            .get(label)
            .cloned()
            .unwrap_or_else(|| ScriptedTurn {
                exit_code: Some(0),
                ..ScriptedTurn::default()
            }))
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentInvocation> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                label: request.label.clone(),
                prompt: request.prompt.clone(),
                resume: request.resume.clone(),
            });
        }
        let turn = self.next_turn(&request.label)?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !turn.delay.is_zero() {
            thread::sleep(turn.delay);
        }
        let written = write_turn_files(request, &turn);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        written?;

        Ok(AgentInvocation {
            exit_code: turn.exit_code,
            timed_out: turn.timed_out,
            rate_limit: turn.rate_limited.then(|| RateLimitHit {
                message: "usage limit reached".to_string(),
                reset_hint: None,
                retry_after: None,
                context: Vec::new(),
            }),
            resume_hint: turn.resume_hint,
            output: turn.last_message.clone().unwrap_or_default(),
            last_message: turn.last_message,
            duration: turn.delay,
        })
    }
}

fn write_turn_files(request: &AgentRequest, turn: &ScriptedTurn) -> Result<()> {
    for (rel, contents) in &turn.files {
        write_with_parents(&request.workdir.join(rel), contents)?;
    }
    if let (Some(path), Some(contents)) = (&request.output_file, &turn.output_file) {
        write_with_parents(path, contents)?;
    }
    write_with_parents(
        &request.log_path,
        &format!("[scripted] label={}\n", request.label),
    )?;
    match &turn.last_message {
        Some(message) => write_with_parents(&request.last_message_path, message)?,
        None => match fs::remove_file(&request.last_message_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        },
    }
    Ok(())
}

fn write_with_parents(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Gate runner returning queued results per command; unscripted commands pass.
#[derive(Default)]
pub struct ScriptedGateRunner {
    queued: Mutex<HashMap<String, VecDeque<GateCommandResult>>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedGateRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: &str, result: GateCommandResult) -> &Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued
                .entry(command.to_string())
                .or_default()
                .push_back(result);
        }
        self
    }

    pub fn pass(output: &str) -> GateCommandResult {
        GateCommandResult {
            exit_code: Some(0),
            output: output.to_string(),
            timed_out: false,
        }
    }

    pub fn fail(code: i32, output: &str) -> GateCommandResult {
        GateCommandResult {
            exit_code: Some(code),
            output: output.to_string(),
            timed_out: false,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl GateCommandRunner for ScriptedGateRunner {
    fn run(&self, request: &GateCommandRequest) -> Result<GateCommandResult> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(request.command.clone());
        }
        let mut queued = self
            .queued
            .lock()
            .map_err(|_| anyhow!("scripted gate runner poisoned"))?;
        Ok(queued
            .get_mut(&request.command)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Self::pass("ok\n")))
    }
}
