//! Gate engine and iteration controller: one pass through a loop's roles.
//!
//! Roles run strictly in canonical order. Delegating roles first run a
//! handshake pass and the scheduler, then their own invocation with the
//! delegation digest in the prompt. Gates are evaluated in a fixed order
//! (checklist, tests, validation, evidence, stuck) and combined into the
//! candidate-complete decision.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::completion::{
    CompletionInputs, is_candidate_complete, should_run_gate, unmet_gates,
};
use crate::core::error::LoopError;
use crate::core::promise::promise_matches;
use crate::core::stuck::{
    ProgressSignature, is_no_progress, is_stuck, update_no_progress, update_stuck_state,
};
use crate::core::types::{
    GateKind, GateMode, GateStatus, IterationOutcome, IterationPhase, LoopStop, Role, StopReason,
    canonical_roles, promise_role,
};
use crate::delegation::{DelegationEnv, request_delegation, run_delegation};
use crate::io::agent::{AgentInvocation, AgentRequest, AgentRunner};
use crate::io::approval::request_approval;
use crate::io::config::{LoopConfig, SuperloopConfig};
use crate::io::events::{
    EventKind, EventLog, IterationResult, IterationSummary, append_timeline, load_run_summary,
    now_rfc3339, upsert_iteration_summary,
};
use crate::io::fsutil::{write_atomic, write_json};
use crate::io::gates::{
    ChecklistScan, CommandGate, GateCommandRunner, evaluate_checklist, evaluate_command_gate,
    evaluate_evidence, scan_checklists, skip_gate, write_gate_status,
};
use crate::io::init::{IterationPaths, LoopPaths};
use crate::io::prompt::{
    DEFAULT_PROMPT_BUDGET, ReportRef, RolePromptInputs, ScriptedPromptInputs, render_role_prompt,
    render_scripted_prompt,
};
use crate::io::rate_limit::{RetryObserver, invoke_with_rate_limit_retries};
use crate::io::report_guard::ReportSnapshot;
use crate::io::run_state::{LoopRunState, PendingResume, write_run_state};
use crate::io::signature::{
    compute_code_signature, compute_test_failure_signature, failure_lines,
};

/// Failure lines carried into the next iteration's prompts.
const MAX_CARRIED_FAILURE_LINES: usize = 20;

/// Everything an iteration needs from the enclosing run.
pub struct LoopContext<'a> {
    pub root: &'a Path,
    pub config: &'a SuperloopConfig,
    pub loop_cfg: &'a LoopConfig,
    pub paths: &'a LoopPaths,
    pub runner: &'a dyn AgentRunner,
    pub gates: &'a dyn GateCommandRunner,
    pub events: &'a EventLog,
}

impl LoopContext<'_> {
    fn run_id(&self) -> &str {
        self.events.run_id()
    }

    fn emit(&self, kind: EventKind) {
        if let Err(err) = self.events.emit(kind) {
            warn!(err = %format!("{err:#}"), "failed to append event");
        }
    }

    fn cancel_requested(&self) -> bool {
        self.paths.cancel_path.exists()
    }
}

/// Prompt context shared by every role of an iteration.
struct IterationInputs {
    spec_text: String,
    previous_notes: Vec<String>,
    test_failures: Option<String>,
    checklist_remaining: Vec<String>,
}

/// `iteration.json`: the iteration summary plus what ran.
#[derive(Debug, Serialize)]
struct IterationRecord<'a> {
    #[serde(flatten)]
    summary: &'a IterationSummary,
    loop_id: &'a str,
    roles: Vec<Role>,
}

/// Run the current iteration of `state` to one of its terminal outcomes.
///
/// Role failures surface as `LoopError` inside the returned error; the state
/// already records every role that finished, so a rerun resumes at the first
/// incomplete role.
#[instrument(skip_all, fields(loop_id = %ctx.loop_cfg.id, iteration = state.current_iteration))]
pub fn run_iteration(ctx: &LoopContext<'_>, state: &mut LoopRunState) -> Result<IterationOutcome> {
    let loop_cfg = ctx.loop_cfg;
    let iteration = state.current_iteration;
    let paths = ctx.paths.iteration(ctx.run_id(), iteration);
    paths.create_dirs()?;

    let mut summary = load_run_summary(&ctx.paths.run_summary_path, &loop_cfg.id)?
        .iterations
        .into_iter()
        .find(|e| e.run_id == ctx.run_id() && e.iteration == iteration)
        .unwrap_or_else(|| IterationSummary::started(ctx.run_id(), iteration));
    summary.result = IterationResult::Running;
    upsert_iteration_summary(&ctx.paths.run_summary_path, &loop_cfg.id, &summary)?;
    if state.completed_roles.is_empty() {
        append_timeline(&ctx.paths.timeline_path, &format!("iteration {iteration} started"))?;
    }

    let inputs = gather_inputs(ctx, iteration)?;
    let roles = canonical_roles(&loop_cfg.roles);
    let promise_owner = promise_role(&roles);
    let mut promise_message: Option<String> = None;

    for role in roles.iter().copied() {
        if state.role_completed(role) {
            ctx.emit(EventKind::RoleSkipped {
                iteration,
                role,
                reason: "completed before resume".to_string(),
            });
            if Some(role) == promise_owner {
                promise_message = read_optional(&paths.last_message_path(role));
            }
            continue;
        }
        if ctx.cancel_requested() {
            return Ok(IterationOutcome::Stopped(LoopStop {
                reason: StopReason::Cancelled,
                detail: format!("cancel requested before {role}"),
            }));
        }
        ctx.emit(EventKind::phase(iteration, IterationPhase::RunningRole(role)));
        let message = run_role(ctx, state, role, &paths, &inputs)?;
        if Some(role) == promise_owner {
            promise_message = message;
        }
        state.mark_role_completed(role);
        state.clear_resume_for(role.as_str());
        write_run_state(&ctx.paths.run_state_path, state)?;
    }

    ctx.emit(EventKind::phase(iteration, IterationPhase::EvaluatingGates));
    let promise_matched = match promise_owner {
        Some(_) => promise_matches(promise_message.as_deref(), &loop_cfg.completion_promise),
        None => true,
    };
    summary.promise_matched = promise_matched;

    let evaluation = evaluate_gates(ctx, &paths, promise_matched)?;
    for status in &evaluation.gates {
        ctx.emit(EventKind::Gate {
            iteration,
            status: status.clone(),
        });
    }

    let code = compute_code_signature(ctx.root, &loop_cfg.stuck.ignore)?;
    let test_failures = compute_test_failure_signature(&evaluation.test_output);
    summary.code_signature = Some(code.clone());
    summary.test_failure_signature = Some(test_failures.clone());
    summary.test_failures = failure_lines(&evaluation.test_output)
        .into_iter()
        .take(MAX_CARRIED_FAILURE_LINES)
        .collect();
    state.stuck = update_stuck_state(
        &state.stuck,
        ProgressSignature {
            code: code.clone(),
            test_failures,
        },
    );
    summary.stuck_streak = state.stuck.streak;
    if loop_cfg.is_checklist_only() {
        state.no_progress =
            update_no_progress(&state.no_progress, evaluation.checklist.remaining_count(), &code);
    }

    let mut gates = evaluation.gates;
    let candidate = is_candidate_complete(&evaluation.completion);
    let stop = if candidate {
        None
    } else if is_stuck(&state.stuck, loop_cfg.stuck.threshold) {
        Some(LoopStop {
            reason: StopReason::Stuck,
            detail: format!(
                "no progress for {} iterations (threshold {})",
                state.stuck.streak, loop_cfg.stuck.threshold
            ),
        })
    } else if loop_cfg.is_checklist_only()
        && is_no_progress(&state.no_progress, loop_cfg.stuck.no_progress_threshold)
    {
        Some(LoopStop {
            reason: StopReason::NoProgress,
            detail: format!(
                "{} checklist item(s) unchanged for {} iterations",
                evaluation.checklist.remaining.len(),
                state.no_progress.streak
            ),
        })
    } else {
        None
    };
    let stuck_status = match &stop {
        Some(stop) => GateStatus::failed(GateKind::Stuck, stop.detail.clone()),
        None => GateStatus::passed(
            GateKind::Stuck,
            format!("streak {}/{}", state.stuck.streak, loop_cfg.stuck.threshold),
        ),
    };
    write_gate_status(&paths, &stuck_status)?;
    gates.push(stuck_status);
    summary.gates = gates.clone();

    let mut notes: Vec<String> = unmet_gates(&evaluation.completion)
        .into_iter()
        .map(|gate| format!("unmet gate: {gate}"))
        .collect();
    notes.extend(
        gates
            .iter()
            .filter(|g| !g.ok && !g.skipped && !g.detail.is_empty())
            .map(|g| format!("{}: {}", g.gate.as_str(), g.detail)),
    );
    summary.notes = notes;

    let outcome = if candidate {
        if loop_cfg.approval.required {
            let digest = gates
                .iter()
                .map(|g| format!("{}: {} ({})", g.gate.as_str(), ok_word(g), g.detail))
                .collect();
            request_approval(
                &ctx.paths.approval_path,
                &loop_cfg.id,
                ctx.run_id(),
                iteration,
                digest,
            )?;
            ctx.emit(EventKind::ApprovalRequested { iteration });
            ctx.emit(EventKind::phase(iteration, IterationPhase::PendingApproval));
            summary.result = IterationResult::PendingApproval;
            IterationOutcome::PendingApproval
        } else {
            ctx.emit(EventKind::phase(iteration, IterationPhase::Complete));
            summary.result = IterationResult::Complete;
            IterationOutcome::Complete
        }
    } else if let Some(stop) = stop {
        if stop.reason == StopReason::Stuck {
            write_stuck_report(ctx, state, &summary)?;
        }
        ctx.emit(EventKind::phase(iteration, IterationPhase::Stopped));
        summary.result = IterationResult::Stopped;
        summary.stop = Some(stop.clone());
        IterationOutcome::Stopped(stop)
    } else {
        summary.result = IterationResult::Continue;
        IterationOutcome::Continue
    };

    summary.ended_at = Some(now_rfc3339());
    write_json(
        &paths.iteration_path,
        &IterationRecord {
            summary: &summary,
            loop_id: &loop_cfg.id,
            roles,
        },
    )?;
    upsert_iteration_summary(&ctx.paths.run_summary_path, &loop_cfg.id, &summary)?;
    append_timeline(
        &ctx.paths.timeline_path,
        &format!(
            "iteration {iteration} {} (promise {}, stuck streak {})",
            outcome_word(&outcome),
            if promise_matched { "matched" } else { "missing" },
            state.stuck.streak
        ),
    )?;
    info!(outcome = outcome_word(&outcome), promise_matched, "iteration finished");
    Ok(outcome)
}

fn ok_word(status: &GateStatus) -> &'static str {
    match (status.skipped, status.ok) {
        (true, _) => "skipped",
        (false, true) => "ok",
        (false, false) => "failed",
    }
}

fn outcome_word(outcome: &IterationOutcome) -> &'static str {
    match outcome {
        IterationOutcome::Complete => "complete",
        IterationOutcome::PendingApproval => "pending approval",
        IterationOutcome::Stopped(_) => "stopped",
        IterationOutcome::Continue => "continues",
    }
}

fn read_optional(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn gather_inputs(ctx: &LoopContext<'_>, iteration: u32) -> Result<IterationInputs> {
    let spec_path = ctx.root.join(&ctx.loop_cfg.spec_file);
    let spec_text = fs::read_to_string(&spec_path)
        .with_context(|| format!("read spec {}", spec_path.display()))?;

    let previous = load_run_summary(&ctx.paths.run_summary_path, &ctx.loop_cfg.id)?
        .iterations
        .into_iter()
        .rev()
        .find(|e| e.iteration < iteration && e.result != IterationResult::Running);
    let (previous_notes, test_failures) = match previous {
        Some(prev) => {
            let failures = (!prev.test_failures.is_empty()).then(|| prev.test_failures.join("\n"));
            (prev.notes, failures)
        }
        None => (Vec::new(), None),
    };

    let checklist_remaining = if ctx.loop_cfg.checklist.patterns.is_empty() {
        Vec::new()
    } else {
        scan_checklists(ctx.root, &ctx.loop_cfg.checklist.patterns)?.remaining
    };

    Ok(IterationInputs {
        spec_text,
        previous_notes,
        test_failures,
        checklist_remaining,
    })
}

/// Run one role: delegation (when enabled), then the role's own invocation.
///
/// Returns the role's last message. Scripted roles return `None`.
#[instrument(skip_all, fields(role = %role))]
fn run_role(
    ctx: &LoopContext<'_>,
    state: &mut LoopRunState,
    role: Role,
    paths: &IterationPaths,
    inputs: &IterationInputs,
) -> Result<Option<String>> {
    let started = Instant::now();
    if role == Role::Scripted {
        run_scripted(ctx, state, paths)?;
        ctx.emit(EventKind::RoleFinished {
            iteration: state.current_iteration,
            role,
            exit_code: Some(0),
            duration_ms: started.elapsed().as_millis() as u64,
            promise_matched: false,
        });
        return Ok(None);
    }

    let loop_cfg = ctx.loop_cfg;
    let runner_spec = ctx.config.runner(loop_cfg.runner_for(role))?;

    let delegation_summary = match loop_cfg.delegation_for(role) {
        Some(policy) => {
            let env = DelegationEnv {
                runner: ctx.runner,
                runner_spec,
                loop_cfg,
                policy,
                role,
                iteration: state.current_iteration,
                workdir: ctx.root,
                dir: paths.role_delegation_dir(role),
                spec_path: &loop_cfg.spec_file,
                spec_text: &inputs.spec_text,
                events: ctx.events,
            };
            let plan = request_delegation(&env)?;
            if plan.requested() == 0 {
                None
            } else {
                Some(run_delegation(&env, &plan)?.digest())
            }
        }
        None => None,
    };

    let report_path = ctx.paths.report_path(role);
    let snapshot = report_path
        .as_deref()
        .map(ReportSnapshot::capture)
        .transpose()?;

    let reports = canonical_roles(&loop_cfg.roles)
        .into_iter()
        .filter_map(|r| ctx.paths.report_path(r).map(|p| (r, p)))
        .filter(|(_, p)| p.is_file())
        .map(|(r, p)| ReportRef {
            role: r,
            path: relative(ctx.root, &p),
        })
        .collect();
    let prompt = render_role_prompt(
        &RolePromptInputs {
            loop_id: loop_cfg.id.clone(),
            iteration: state.current_iteration,
            role,
            spec_path: loop_cfg.spec_file.clone(),
            spec_text: inputs.spec_text.clone(),
            completion_promise: loop_cfg.completion_promise.clone(),
            report_path: report_path.as_deref().map(|p| relative(ctx.root, p)),
            reports,
            previous_notes: inputs.previous_notes.clone(),
            rejection_note: state.rejection_note.clone(),
            test_failures: inputs.test_failures.clone(),
            checklist_remaining: inputs.checklist_remaining.clone(),
            delegation_summary,
        },
        DEFAULT_PROMPT_BUDGET,
    )?;
    write_atomic(&paths.prompt_path(role), prompt.as_bytes())?;

    let (max_timeout, inactivity_timeout) = loop_cfg.timeouts.for_role(role);
    let request = AgentRequest {
        label: role.as_str().to_string(),
        runner: runner_spec.clone(),
        prompt,
        workdir: ctx.root.to_path_buf(),
        log_path: paths.log_path(role),
        last_message_path: paths.last_message_path(role),
        output_file: None,
        max_timeout,
        inactivity_timeout,
        resume: state.resume_hint_for(role.as_str()),
        output_limit_bytes: loop_cfg.output_limit_bytes,
        rate_limit_context_lines: loop_cfg.rate_limit.context_lines,
    };
    let invocation = invoke_role(ctx, state, role, &request)?;

    if let Some(reason) = invocation.timed_out {
        if let Some(snapshot) = &snapshot {
            if snapshot.restore()? {
                ctx.emit(EventKind::ReportRestored { role });
            }
        }
        return Err(LoopError::Timeout { role, reason }.into());
    }
    if !invocation.succeeded() {
        return Err(LoopError::HardFailure {
            role,
            exit_code: invocation.exit_code,
        }
        .into());
    }

    let promise_matched =
        promise_matches(invocation.last_message.as_deref(), &loop_cfg.completion_promise);
    ctx.emit(EventKind::RoleFinished {
        iteration: state.current_iteration,
        role,
        exit_code: invocation.exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
        promise_matched,
    });
    debug!(promise_matched, "role finished");
    Ok(invocation.last_message)
}

/// Invoke with rate-limit retries; exhaustion records the resume hint.
fn invoke_role(
    ctx: &LoopContext<'_>,
    state: &mut LoopRunState,
    role: Role,
    request: &AgentRequest,
) -> Result<AgentInvocation> {
    let observer: RetryObserver<'_> = &|attempt, wait, invocation| {
        ctx.emit(EventKind::RateLimited {
            label: request.label.clone(),
            attempt,
            wait_secs: wait.as_secs(),
            resumable: invocation.resume_hint.is_some(),
        });
    };
    let retried = invoke_with_rate_limit_retries(
        ctx.runner,
        request,
        &ctx.loop_cfg.rate_limit,
        Some(observer),
    )?;
    if let Some(detail) = retried.exhausted {
        let resume_hint = retried.invocation.resume_hint.clone();
        if let Some(hint) = &resume_hint {
            state.pending_resume = Some(PendingResume {
                role,
                label: request.label.clone(),
                hint: hint.clone(),
            });
        }
        return Err(LoopError::RateLimitExhausted {
            role,
            attempts: retried.rate_limited_attempts,
            detail,
            resume_hint,
        }
        .into());
    }
    Ok(retried.invocation)
}

fn run_scripted(
    ctx: &LoopContext<'_>,
    state: &mut LoopRunState,
    paths: &IterationPaths,
) -> Result<()> {
    let role = Role::Scripted;
    let (max_timeout, inactivity_timeout) = ctx.loop_cfg.timeouts.for_role(role);
    for (index, session) in ctx.loop_cfg.scripted.sessions.iter().enumerate() {
        let number = index + 1;
        let label = format!("scripted/{number}");
        if state.scripted_completed(number) {
            ctx.emit(EventKind::RoleSkipped {
                iteration: state.current_iteration,
                role,
                reason: format!("{label} completed before resume"),
            });
            continue;
        }
        let runner_spec = ctx.config.runner(&session.runner)?;
        let prompt = render_scripted_prompt(
            &ScriptedPromptInputs {
                loop_id: ctx.loop_cfg.id.clone(),
                iteration: state.current_iteration,
                spec_path: ctx.loop_cfg.spec_file.clone(),
                session_index: number,
                instructions: session.prompt.clone(),
            },
            DEFAULT_PROMPT_BUDGET,
        )?;
        let name = format!("scripted-{number}");
        write_atomic(&paths.prompts_dir.join(format!("{name}.md")), prompt.as_bytes())?;
        let request = AgentRequest {
            label: label.clone(),
            runner: runner_spec.clone(),
            prompt,
            workdir: ctx.root.to_path_buf(),
            log_path: paths.logs_dir.join(format!("{name}.log")),
            last_message_path: paths.last_messages_dir.join(format!("{name}.md")),
            output_file: None,
            max_timeout,
            inactivity_timeout,
            resume: state.resume_hint_for(&label),
            output_limit_bytes: ctx.loop_cfg.output_limit_bytes,
            rate_limit_context_lines: ctx.loop_cfg.rate_limit.context_lines,
        };
        let invocation = invoke_role(ctx, state, role, &request)?;
        if let Some(reason) = invocation.timed_out {
            return Err(LoopError::Timeout { role, reason }.into());
        }
        if !invocation.succeeded() {
            return Err(LoopError::HardFailure {
                role,
                exit_code: invocation.exit_code,
            }
            .into());
        }
        state.mark_scripted_completed(number);
        state.clear_resume_for(&label);
        write_run_state(&ctx.paths.run_state_path, state)?;
    }
    Ok(())
}

struct GateEvaluation {
    gates: Vec<GateStatus>,
    checklist: ChecklistScan,
    test_output: String,
    completion: CompletionInputs,
}

fn evaluate_gates(
    ctx: &LoopContext<'_>,
    paths: &IterationPaths,
    promise_matched: bool,
) -> Result<GateEvaluation> {
    let loop_cfg = ctx.loop_cfg;
    let mut gates = Vec::with_capacity(5);

    let (checklist_status, checklist) = evaluate_checklist(ctx.root, &loop_cfg.checklist, paths)?;
    let checklist_complete = checklist_status.ok && !checklist_status.skipped;
    let checklist_ok = checklist_status.ok;
    gates.push(checklist_status);

    let mut test_output = String::new();
    let tests_status = if should_run_gate(loop_cfg.tests.mode, promise_matched, checklist_complete)
    {
        let outcome = evaluate_command_gate(
            &CommandGate {
                kind: GateKind::Tests,
                commands: &loop_cfg.tests.commands,
                timeout: Duration::from_secs(loop_cfg.tests.timeout_secs),
                workdir: ctx.root,
                output_path: &paths.test_output_path,
            },
            ctx.gates,
            paths,
        )?;
        test_output = outcome.output;
        outcome.status
    } else if loop_cfg.tests.mode == GateMode::Never {
        skip_gate(paths, GateKind::Tests, true, "tests disabled")?
    } else {
        skip_gate(paths, GateKind::Tests, false, "not run: promise missing")?
    };
    let tests_ok = tests_status.ok;
    gates.push(tests_status);

    let validation = &loop_cfg.validation;
    let validation_status = if !validation.enabled {
        skip_gate(paths, GateKind::Validation, true, "validation disabled")?
    } else if should_run_gate(validation.mode, promise_matched, checklist_complete) {
        evaluate_command_gate(
            &CommandGate {
                kind: GateKind::Validation,
                commands: &validation.commands,
                timeout: Duration::from_secs(validation.timeout_secs),
                workdir: ctx.root,
                output_path: &paths.validation_output_path,
            },
            ctx.gates,
            paths,
        )?
        .status
    } else {
        skip_gate(
            paths,
            GateKind::Validation,
            validation.mode == GateMode::Never,
            "not run this iteration",
        )?
    };
    let validation_ok = validation_status.ok;
    gates.push(validation_status);

    let evidence_status = evaluate_evidence(ctx.root, &loop_cfg.evidence, paths)?;
    let evidence_ok = evidence_status.ok;
    gates.push(evidence_status);

    Ok(GateEvaluation {
        gates,
        checklist,
        test_output,
        completion: CompletionInputs {
            promise_matched,
            tests_ok,
            validation_ok,
            validation_required: validation.enabled && validation.required,
            checklist_ok,
            evidence_ok,
            evidence_required: loop_cfg.evidence.required,
        },
    })
}

#[derive(Debug, Serialize)]
struct StuckReport<'a> {
    loop_id: &'a str,
    run_id: &'a str,
    iteration: u32,
    generated_at: String,
    streak: u32,
    threshold: u32,
    code_signature: Option<&'a str>,
    test_failure_signature: Option<&'a str>,
    test_failures: &'a [String],
    notes: &'a [String],
}

fn write_stuck_report(
    ctx: &LoopContext<'_>,
    state: &LoopRunState,
    summary: &IterationSummary,
) -> Result<()> {
    warn!(streak = state.stuck.streak, "loop is stuck, writing report");
    write_json(
        &ctx.paths.stuck_report_path,
        &StuckReport {
            loop_id: &ctx.loop_cfg.id,
            run_id: ctx.run_id(),
            iteration: state.current_iteration,
            generated_at: now_rfc3339(),
            streak: state.stuck.streak,
            threshold: ctx.loop_cfg.stuck.threshold,
            code_signature: summary.code_signature.as_deref(),
            test_failure_signature: summary.test_failure_signature.as_deref(),
            test_failures: &summary.test_failures,
            notes: &summary.notes,
        },
    )
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
