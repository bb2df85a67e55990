//! One delegated child: prompt, invocation with retries, reconnaissance check.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::backoff::exponential_backoff;
use crate::core::delegation_plan::PlannedChild;
use crate::core::types::{ChildState, Role};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::config::{DelegationMode, DelegationPolicy, RateLimitPolicy, RunnerSpec};
use crate::io::fsutil::write_atomic;
use crate::io::prompt::{ChildPromptInputs, DEFAULT_PROMPT_BUDGET, render_child_prompt};
use crate::io::rate_limit::invoke_with_rate_limit_retries;
use crate::io::signature::fingerprint_tree;

/// Everything a child needs that is shared across its wave.
pub struct ChildEnv<'a> {
    pub runner: &'a dyn AgentRunner,
    pub runner_spec: &'a RunnerSpec,
    pub policy: &'a DelegationPolicy,
    pub rate_limit: &'a RateLimitPolicy,
    pub loop_id: &'a str,
    pub role: Role,
    pub workdir: &'a Path,
    /// `delegation/<role>/` inside the iteration directory.
    pub dir: &'a Path,
    pub ignore_globs: &'a [String],
    pub output_limit_bytes: usize,
}

/// Artifact paths of one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildArtifacts {
    pub prompt: PathBuf,
    pub log: PathBuf,
    pub last_message: PathBuf,
}

impl ChildArtifacts {
    pub fn new(dir: &Path, wave_id: &str, child_id: &str) -> Self {
        let base = dir.join(wave_id).join(child_id);
        Self {
            prompt: base.join("prompt.md"),
            log: base.join("child.log"),
            last_message: base.join("last-message.md"),
        }
    }
}

/// Terminal record for one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildOutcome {
    pub id: String,
    pub wave_id: String,
    pub state: ChildState,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub detail: String,
    pub duration_ms: u64,
    /// Paths a reconnaissance child touched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_paths: Vec<String>,
    pub artifacts: ChildArtifacts,
}

impl ChildOutcome {
    /// Outcome for a child that never ran.
    pub fn not_run(
        dir: &Path,
        wave_id: &str,
        child_id: &str,
        state: ChildState,
        detail: &str,
    ) -> Self {
        Self {
            id: child_id.to_string(),
            wave_id: wave_id.to_string(),
            state,
            attempts: 0,
            exit_code: None,
            detail: detail.to_string(),
            duration_ms: 0,
            changed_paths: Vec::new(),
            artifacts: ChildArtifacts::new(dir, wave_id, child_id),
        }
    }
}

/// Run a child until it completes, violates policy, or exhausts its retries.
#[instrument(skip_all, fields(role = %env.role, wave = wave_id, child = %child.id))]
pub fn run_child(env: &ChildEnv<'_>, wave_id: &str, child: &PlannedChild) -> Result<ChildOutcome> {
    let artifacts = ChildArtifacts::new(env.dir, wave_id, &child.id);
    let reconnaissance = env.policy.mode == DelegationMode::Reconnaissance;
    let prompt = render_child_prompt(
        &ChildPromptInputs {
            loop_id: env.loop_id.to_string(),
            role: env.role,
            wave_id: wave_id.to_string(),
            child_id: child.id.clone(),
            prompt: child.prompt.clone(),
            context_files: child.context_files.clone(),
            reconnaissance,
        },
        DEFAULT_PROMPT_BUDGET,
    )?;
    write_atomic(&artifacts.prompt, prompt.as_bytes())?;

    let (max_timeout, inactivity_timeout) = env.policy.child_timeouts();
    let request = AgentRequest {
        label: format!("{}/{}/{}", env.role, wave_id, child.id),
        runner: env.runner_spec.clone(),
        prompt,
        workdir: env.workdir.to_path_buf(),
        log_path: artifacts.log.clone(),
        last_message_path: artifacts.last_message.clone(),
        output_file: None,
        max_timeout,
        inactivity_timeout,
        resume: None,
        output_limit_bytes: env.output_limit_bytes,
        rate_limit_context_lines: env.rate_limit.context_lines,
    };

    let started = Instant::now();
    let backoff_base = Duration::from_secs(env.policy.retry_backoff_secs);
    let backoff_max = Duration::from_secs(env.policy.retry_backoff_max_secs);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let before = if reconnaissance {
            Some(
                fingerprint_tree(env.workdir, env.ignore_globs)
                    .context("fingerprint before child")?,
            )
        } else {
            None
        };
        let retried = invoke_with_rate_limit_retries(env.runner, &request, env.rate_limit, None)?;
        let invocation = &retried.invocation;

        let mut outcome = ChildOutcome {
            id: child.id.clone(),
            wave_id: wave_id.to_string(),
            state: ChildState::Completed,
            attempts,
            exit_code: Some(invocation.exit_status()),
            detail: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            changed_paths: Vec::new(),
            artifacts: artifacts.clone(),
        };

        if let Some(before) = before {
            let after = fingerprint_tree(env.workdir, env.ignore_globs)
                .context("fingerprint after child")?;
            let changed = before.changed_paths(&after);
            if !changed.is_empty() {
                warn!(changed = ?changed, "reconnaissance child modified the working tree");
                outcome.state = ChildState::PolicyViolation;
                outcome.detail =
                    format!("modified {} path(s): {}", changed.len(), changed.join(", "));
                outcome.changed_paths = changed;
                return Ok(outcome);
            }
        }

        if invocation.succeeded() {
            info!(attempts, "child completed");
            outcome.detail = "completed".to_string();
            return Ok(outcome);
        }

        (outcome.state, outcome.detail) = if let Some(reason) = invocation.timed_out {
            (ChildState::TimedOut, format!("timed out ({reason})"))
        } else if let Some(exhausted) = &retried.exhausted {
            (ChildState::Failed, format!("rate limited: {exhausted}"))
        } else {
            (
                ChildState::Failed,
                format!("exited with {}", invocation.exit_status()),
            )
        };

        if attempts > env.policy.retry_limit {
            warn!(attempts, state = outcome.state.as_str(), "child retries exhausted");
            return Ok(outcome);
        }
        let wait = exponential_backoff(attempts, backoff_base, backoff_max);
        warn!(
            attempts,
            wait_secs = wait.as_secs(),
            detail = %outcome.detail,
            "child failed, retrying"
        );
        thread::sleep(wait);
    }
}
