//! Delegation scheduler for planner and implementer roles.
//!
//! A delegating role first runs a handshake pass that may write a delegation
//! request. The normalized plan is dispatched wave by wave on a bounded
//! worker pool; waves never overlap. Results are aggregated into
//! `delegation/<role>/summary.json` and `delegation/<role>/index.json`.

pub mod child;
pub mod pool;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::delegation_plan::{
    AdaptationDecision, DelegationPlan, DelegationRequest, PlannedChild, normalize_request,
    parse_adaptation_decision,
};
use crate::core::error::LoopError;
use crate::core::types::{ChildState, Role};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::config::{
    DelegationMode, DelegationPolicy, DispatchMode, FailurePolicy, LoopConfig, RunnerSpec,
    WakePolicy,
};
use crate::io::events::{EventKind, EventLog, now_rfc3339};
use crate::io::fsutil::{write_atomic, write_json};
use crate::io::prompt::{
    AdaptationPromptInputs, ChildBrief, DEFAULT_PROMPT_BUDGET, HandshakePromptInputs,
    render_adaptation_prompt, render_handshake_prompt,
};
use crate::io::rate_limit::invoke_with_rate_limit_retries;

use self::child::{ChildEnv, ChildOutcome, run_child};
use self::pool::{Flow, run_pool};

/// Shared inputs for one role's delegation in one iteration.
pub struct DelegationEnv<'a> {
    pub runner: &'a dyn AgentRunner,
    pub runner_spec: &'a RunnerSpec,
    pub loop_cfg: &'a LoopConfig,
    pub policy: &'a DelegationPolicy,
    pub role: Role,
    pub iteration: u32,
    pub workdir: &'a Path,
    /// `delegation/<role>/` inside the iteration directory.
    pub dir: PathBuf,
    pub spec_path: &'a str,
    pub spec_text: &'a str,
    pub events: &'a EventLog,
}

/// Ask the role for a delegation request and normalize it.
///
/// A missing or unparsable request means no delegation. Only exhausted rate
/// limits are fatal; a failed or timed-out handshake is logged and skipped.
#[instrument(skip_all, fields(role = %env.role))]
pub fn request_delegation(env: &DelegationEnv<'_>) -> Result<DelegationPlan> {
    let request_path = env.dir.join("request.json");
    if request_path.exists() {
        fs::remove_file(&request_path)?;
    }
    let reconnaissance = env.policy.mode == DelegationMode::Reconnaissance;
    let prompt = render_handshake_prompt(
        &HandshakePromptInputs {
            loop_id: env.loop_cfg.id.clone(),
            iteration: env.iteration,
            role: env.role,
            spec_path: env.spec_path.to_string(),
            spec_text: env.spec_text.to_string(),
            request_path: request_path.display().to_string(),
            max_waves: env.policy.max_waves,
            max_children: env.policy.max_children,
            reconnaissance,
        },
        DEFAULT_PROMPT_BUDGET,
    )?;
    write_atomic(&env.dir.join("handshake-prompt.md"), prompt.as_bytes())?;

    let timeout = Duration::from_secs(env.policy.handshake_timeout_secs);
    let request = AgentRequest {
        label: format!("{}/handshake", env.role),
        runner: env.runner_spec.clone(),
        prompt,
        workdir: env.workdir.to_path_buf(),
        log_path: env.dir.join("handshake.log"),
        last_message_path: env.dir.join("handshake-last-message.md"),
        output_file: Some(request_path.clone()),
        max_timeout: timeout,
        inactivity_timeout: timeout,
        resume: None,
        output_limit_bytes: env.loop_cfg.output_limit_bytes,
        rate_limit_context_lines: env.loop_cfg.rate_limit.context_lines,
    };
    let retried =
        invoke_with_rate_limit_retries(env.runner, &request, &env.loop_cfg.rate_limit, None)?;
    if let Some(detail) = retried.exhausted {
        return Err(LoopError::RateLimitExhausted {
            role: env.role,
            attempts: retried.rate_limited_attempts,
            detail,
            resume_hint: None,
        }
        .into());
    }
    if !retried.invocation.succeeded() {
        warn!(
            exit = retried.invocation.exit_status(),
            "handshake did not succeed, skipping delegation"
        );
        return Ok(DelegationPlan::default());
    }

    let raw = match fs::read_to_string(&request_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("no delegation request written");
            return Ok(DelegationPlan::default());
        }
        Err(err) => return Err(err.into()),
    };
    let parsed: DelegationRequest = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(err = %err, "invalid delegation request, skipping delegation");
            return Ok(DelegationPlan::default());
        }
    };
    let plan = normalize_request(&parsed, env.policy.max_waves, env.policy.max_children);
    write_json(&env.dir.join("plan.json"), &plan)?;
    Ok(plan)
}

#[derive(Debug, Clone, Serialize)]
pub struct DelegationSummary {
    pub role: Role,
    pub mode: DelegationMode,
    pub dispatch_mode: DispatchMode,
    pub wake_policy: WakePolicy,
    pub failure_policy: FailurePolicy,
    pub max_parallel: usize,
    pub waves: usize,
    pub requested: usize,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub states: BTreeMap<ChildState, usize>,
    pub adaptations: u32,
    pub adaptation_aborts: u32,
    /// `wave/child` ids in the order children finished.
    pub completion_order: Vec<String>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub generated_at: String,
}

/// Every child of the plan with its terminal state and artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationIndex {
    pub role: Role,
    pub children: Vec<ChildOutcome>,
}

#[derive(Debug, Clone)]
pub struct DelegationReport {
    pub summary: DelegationSummary,
    pub index: DelegationIndex,
}

impl DelegationReport {
    /// Short digest for the parent role's prompt.
    pub fn digest(&self) -> String {
        let s = &self.summary;
        let mut out = format!(
            "{} child(ren) executed: {} succeeded, {} failed, {} skipped, {} cancelled.",
            s.executed, s.succeeded, s.failed, s.skipped, s.cancelled
        );
        if let Some(reason) = &s.halt_reason {
            out.push_str(&format!("\nDispatch halted: {reason}"));
        }
        for child in &self.index.children {
            out.push_str(&format!(
                "\n- `{}/{}`: {}",
                child.wave_id,
                child.id,
                child.state.as_str()
            ));
            if child.attempts > 0 {
                out.push_str(&format!(
                    " (result: `{}`)",
                    child.artifacts.last_message.display()
                ));
            } else if !child.detail.is_empty() {
                out.push_str(&format!(" ({})", child.detail));
            }
        }
        out
    }
}

enum Halt {
    Failure(String),
    Abort(String),
}

impl Halt {
    fn reason(&self) -> &str {
        match self {
            Halt::Failure(reason) | Halt::Abort(reason) => reason,
        }
    }
}

/// Dispatch a normalized plan and aggregate the results.
///
/// Under `fail_role`, the first failed or violating child halts dispatch and
/// the role fails with `LoopError::DelegationFailed` once in-flight children
/// have finished and the summary is written.
#[instrument(skip_all, fields(role = %env.role, waves = plan.waves.len()))]
pub fn run_delegation(env: &DelegationEnv<'_>, plan: &DelegationPlan) -> Result<DelegationReport> {
    let ignore_globs = env.loop_cfg.stuck.ignore.clone();
    let child_env = ChildEnv {
        runner: env.runner,
        runner_spec: env.runner_spec,
        policy: env.policy,
        rate_limit: &env.loop_cfg.rate_limit,
        loop_id: &env.loop_cfg.id,
        role: env.role,
        workdir: env.workdir,
        dir: &env.dir,
        ignore_globs: &ignore_globs,
        output_limit_bytes: env.loop_cfg.output_limit_bytes,
    };
    emit(env.events, EventKind::DelegationPlanned {
        role: env.role,
        waves: plan.waves.len(),
        requested: plan.requested(),
    });

    let mut children: Vec<ChildOutcome> = Vec::with_capacity(plan.requested());
    let mut completion_order = Vec::new();
    let mut halt: Option<Halt> = None;
    let mut adaptations = 0u32;
    let mut adaptation_aborts = 0u32;

    for (wave_index, wave) in plan.waves.iter().enumerate() {
        for skipped in wave.children.iter().filter(|c| c.skip_reason.is_some()) {
            children.push(ChildOutcome::not_run(
                &env.dir,
                &wave.id,
                &skipped.id,
                ChildState::Skipped,
                skipped.skip_reason.as_deref().unwrap_or_default(),
            ));
        }
        let jobs: Vec<PlannedChild> = wave.dispatchable().cloned().collect();
        if let Some(halt) = &halt {
            for job in &jobs {
                children.push(ChildOutcome::not_run(
                    &env.dir,
                    &wave.id,
                    &job.id,
                    ChildState::Cancelled,
                    halt.reason(),
                ));
            }
            continue;
        }
        if jobs.is_empty() {
            continue;
        }
        info!(
            wave = %wave.id,
            children = jobs.len(),
            workers = env.policy.parallelism(),
            "dispatching wave"
        );

        // Children of later waves, so a wave's last completions still offer
        // a decision point before the next wave starts.
        let later: Vec<String> = plan.waves[wave_index + 1..]
            .iter()
            .flat_map(|w| w.dispatchable().map(move |c| format!("{}/{}", w.id, c.id)))
            .collect();
        let mut wave_briefs: Vec<ChildBrief> = Vec::new();
        let mut wave_adaptations = 0u32;
        let run = run_pool(
            env.policy.parallelism(),
            jobs,
            |job| run_child(&child_env, &wave.id, job),
            |job, result, queue| {
                let outcome = outcome_from(&env.dir, &wave.id, job, result);
                emit(env.events, EventKind::ChildFinished {
                    role: env.role,
                    wave_id: wave.id.clone(),
                    child_id: outcome.id.clone(),
                    state: outcome.state,
                    attempts: outcome.attempts,
                });
                completion_order.push(format!("{}/{}", wave.id, outcome.id));
                wave_briefs.push(ChildBrief {
                    id: outcome.id.clone(),
                    state: outcome.state.as_str().to_string(),
                    detail: outcome.detail.clone(),
                });
                let failed = outcome.state.is_failure();
                let child_id = outcome.id.clone();
                let state = outcome.state;
                children.push(outcome);

                if halt.is_some() {
                    return Flow::Halt;
                }
                if failed && env.policy.failure_policy == FailurePolicy::FailRole {
                    warn!(child = %child_id, state = state.as_str(), "halting dispatch (fail_role)");
                    halt = Some(Halt::Failure(format!(
                        "child {}/{} {}",
                        wave.id,
                        child_id,
                        state.as_str()
                    )));
                    return Flow::Halt;
                }
                let may_adapt = env.policy.wake_policy == WakePolicy::OnChildComplete
                    && (!queue.is_empty() || !later.is_empty())
                    && wave_adaptations < env.policy.max_adaptations_per_wave
                    && adaptations < env.policy.max_adaptations_per_iteration;
                if !may_adapt {
                    return Flow::Continue;
                }
                wave_adaptations += 1;
                adaptations += 1;
                let remaining: Vec<String> = queue
                    .iter()
                    .map(|c| c.id.clone())
                    .chain(later.iter().cloned())
                    .collect();
                match adapt(env, &wave.id, adaptations, &wave_briefs, remaining) {
                    AdaptationDecision::Continue => Flow::Continue,
                    AdaptationDecision::Abort { reason } => {
                        adaptation_aborts += 1;
                        halt = Some(Halt::Abort(format!("adaptation abort: {reason}")));
                        Flow::Halt
                    }
                }
            },
        );

        let reason = halt.as_ref().map(Halt::reason).unwrap_or("dispatch halted");
        for job in run.not_started {
            children.push(ChildOutcome::not_run(
                &env.dir,
                &wave.id,
                &job.id,
                ChildState::Cancelled,
                reason,
            ));
        }
    }

    let report = aggregate(
        env,
        plan.waves.len(),
        children,
        completion_order,
        &halt,
        adaptations,
        adaptation_aborts,
    );
    write_json(&env.dir.join("summary.json"), &report.summary)?;
    write_json(&env.dir.join("index.json"), &report.index)?;
    info!(
        executed = report.summary.executed,
        failed = report.summary.failed,
        halted = report.summary.halted,
        "delegation finished"
    );

    if let Some(Halt::Failure(detail)) = halt {
        return Err(LoopError::DelegationFailed {
            role: env.role,
            detail,
        }
        .into());
    }
    Ok(report)
}

fn emit(events: &EventLog, kind: EventKind) {
    if let Err(err) = events.emit(kind) {
        warn!(err = %format!("{err:#}"), "failed to append event");
    }
}

fn outcome_from(
    dir: &Path,
    wave_id: &str,
    job: &PlannedChild,
    result: &Result<ChildOutcome>,
) -> ChildOutcome {
    match result {
        Ok(outcome) => outcome.clone(),
        Err(err) => {
            warn!(child = %job.id, err = %format!("{err:#}"), "child could not run");
            let mut outcome = ChildOutcome::not_run(
                dir,
                wave_id,
                &job.id,
                ChildState::Failed,
                &format!("{err:#}"),
            );
            outcome.attempts = 1;
            outcome
        }
    }
}

fn aggregate(
    env: &DelegationEnv<'_>,
    waves: usize,
    children: Vec<ChildOutcome>,
    completion_order: Vec<String>,
    halt: &Option<Halt>,
    adaptations: u32,
    adaptation_aborts: u32,
) -> DelegationReport {
    let mut states: BTreeMap<ChildState, usize> = BTreeMap::new();
    for child in &children {
        *states.entry(child.state).or_insert(0) += 1;
    }
    let count = |state: ChildState| states.get(&state).copied().unwrap_or(0);
    let summary = DelegationSummary {
        role: env.role,
        mode: env.policy.mode,
        dispatch_mode: env.policy.dispatch_mode,
        wake_policy: env.policy.wake_policy,
        failure_policy: env.policy.failure_policy,
        max_parallel: env.policy.parallelism(),
        waves,
        requested: children.len(),
        executed: children.iter().filter(|c| c.attempts > 0).count(),
        succeeded: count(ChildState::Completed),
        failed: children.iter().filter(|c| c.state.is_failure()).count(),
        skipped: count(ChildState::Skipped),
        cancelled: count(ChildState::Cancelled),
        states,
        adaptations,
        adaptation_aborts,
        completion_order,
        halted: halt.is_some(),
        halt_reason: halt.as_ref().map(|h| h.reason().to_string()),
        generated_at: now_rfc3339(),
    };
    DelegationReport {
        summary,
        index: DelegationIndex {
            role: env.role,
            children,
        },
    }
}

/// Wake the parent between completions. Anything but an explicit abort,
/// including errors and timeouts, continues.
fn adapt(
    env: &DelegationEnv<'_>,
    wave_id: &str,
    seq: u32,
    completed: &[ChildBrief],
    remaining: Vec<String>,
) -> AdaptationDecision {
    let dir = env.dir.join(wave_id);
    let decision_path = dir.join(format!("adapt-{seq}.json"));
    let prompt = match render_adaptation_prompt(
        &AdaptationPromptInputs {
            role: env.role,
            wave_id: wave_id.to_string(),
            decision_path: decision_path.display().to_string(),
            completed: completed.to_vec(),
            remaining,
        },
        DEFAULT_PROMPT_BUDGET,
    ) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "adaptation prompt failed, continuing");
            return AdaptationDecision::Continue;
        }
    };
    let timeout = Duration::from_secs(env.policy.adaptation_timeout_secs);
    let request = AgentRequest {
        label: format!("{}/adapt", env.role),
        runner: env.runner_spec.clone(),
        prompt,
        workdir: env.workdir.to_path_buf(),
        log_path: dir.join(format!("adapt-{seq}.log")),
        last_message_path: dir.join(format!("adapt-{seq}-last-message.md")),
        output_file: Some(decision_path.clone()),
        max_timeout: timeout,
        inactivity_timeout: timeout,
        resume: None,
        output_limit_bytes: env.loop_cfg.output_limit_bytes,
        rate_limit_context_lines: 0,
    };
    let decision = match env.runner.invoke(&request) {
        Ok(invocation) if invocation.timed_out.is_some() => {
            warn!(wave = wave_id, "adaptation timed out, continuing");
            AdaptationDecision::Continue
        }
        Ok(_) => parse_adaptation_decision(fs::read_to_string(&decision_path).ok().as_deref()),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "adaptation failed, continuing");
            AdaptationDecision::Continue
        }
    };
    let (name, reason) = match &decision {
        AdaptationDecision::Continue => ("continue", String::new()),
        AdaptationDecision::Abort { reason } => ("abort", reason.clone()),
    };
    info!(wave = wave_id, decision = name, "adaptation decided");
    emit(env.events, EventKind::Adaptation {
        role: env.role,
        wave_id: wave_id.to_string(),
        decision: name.to_string(),
        reason,
    });
    decision
}
