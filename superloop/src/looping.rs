//! Multi-iteration driver for `superloop run`.
//!
//! Owns the per-loop active lock, consumes approval decisions left by a
//! previous run, and maps `LoopError`s raised inside an iteration to stop
//! reasons so a rerun resumes where the loop halted.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::error::LoopError;
use crate::core::stuck::{NoProgressState, StuckState};
use crate::core::types::{ApprovalStatus, IterationOutcome, LoopStop, StopReason};
use crate::io::agent::AgentRunner;
use crate::io::approval::{consume_approval, load_approval};
use crate::io::config::load_config;
use crate::io::events::{
    EventKind, EventLog, IterationResult, append_timeline, load_run_summary, now_rfc3339,
    upsert_iteration_summary,
};
use crate::io::gates::GateCommandRunner;
use crate::io::init::{LoopPaths, SuperloopPaths};
use crate::io::run_state::{LoopRunState, acquire_active, release_active, write_run_state};
use crate::iteration::{LoopContext, run_iteration};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Remove a stale active lock left by a crashed run.
    pub force: bool,
}

/// How a `run` invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEnd {
    Complete { iteration: u32 },
    PendingApproval { iteration: u32 },
    Stopped(LoopStop),
}

/// Summary of one `run_loop` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub started_at_iteration: u32,
    pub iterations_run: u32,
    pub end: LoopEnd,
}

/// Command that continues a halted loop.
pub fn resume_command(loop_id: &str) -> String {
    format!("superloop run --loop {loop_id}")
}

/// Run iterations of `loop_id` until it completes, waits for approval or stops.
///
/// Errors other than `LoopError`s (config, filesystem, git) propagate. The
/// active lock is released on every exit path once it was acquired.
#[instrument(skip_all, fields(loop_id = %loop_id))]
pub fn run_loop(
    root: &Path,
    loop_id: &str,
    runner: &dyn AgentRunner,
    gates: &dyn GateCommandRunner,
    options: &RunOptions,
) -> Result<LoopOutcome> {
    let paths = SuperloopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let loop_cfg = config.find_loop(loop_id)?;
    let loop_paths = paths.loop_paths(loop_id);
    fs::create_dir_all(&loop_paths.dir)
        .with_context(|| format!("create directory {}", loop_paths.dir.display()))?;

    let mut state = acquire_active(&loop_paths.run_state_path, loop_id, options.force)?;
    clear_cancel(&loop_paths)?;

    let run_id = match &state.run_id {
        Some(run_id) if state.has_partial_progress() => run_id.clone(),
        _ => mint_run_id(),
    };
    let resumed = state.run_id.as_deref() == Some(run_id.as_str());
    state.run_id = Some(run_id.clone());
    let events = EventLog::new(&loop_paths.events_path, loop_id, &run_id);
    let ctx = LoopContext {
        root,
        config: &config,
        loop_cfg,
        paths: &loop_paths,
        runner,
        gates,
        events: &events,
    };

    let result = drive(&ctx, &mut state, resumed);
    if let Err(err) = release_active(&loop_paths.run_state_path, &mut state) {
        warn!(err = %format!("{err:#}"), "failed to release active lock");
    }
    result
}

fn mint_run_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &uuid[..8])
}

fn clear_cancel(paths: &LoopPaths) -> Result<()> {
    match fs::remove_file(&paths.cancel_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", paths.cancel_path.display())),
    }
}

fn emit(events: &EventLog, kind: EventKind) {
    if let Err(err) = events.emit(kind) {
        warn!(err = %format!("{err:#}"), "failed to append event");
    }
}

fn drive(ctx: &LoopContext<'_>, state: &mut LoopRunState, resumed: bool) -> Result<LoopOutcome> {
    let started_at_iteration = state.current_iteration;
    let outcome = |iterations_run: u32, end: LoopEnd| LoopOutcome {
        run_id: ctx.events.run_id().to_string(),
        started_at_iteration,
        iterations_run,
        end,
    };

    if state.completed {
        info!(iteration = state.current_iteration, "loop already complete");
        return Ok(outcome(0, LoopEnd::Complete {
            iteration: state.current_iteration,
        }));
    }

    if let Some(end) = consume_decision(ctx, state)? {
        return Ok(outcome(0, end));
    }

    emit(
        ctx.events,
        EventKind::RunStarted {
            iteration: state.current_iteration,
            resumed,
        },
    );
    write_run_state(&ctx.paths.run_state_path, state)?;

    let mut iterations_run = 0u32;
    loop {
        let iteration = state.current_iteration;
        if ctx.paths.cancel_path.exists() {
            let stop = LoopStop {
                reason: StopReason::Cancelled,
                detail: "cancel requested".to_string(),
            };
            return Ok(outcome(iterations_run, stop_run(ctx, state, iteration, stop)?));
        }
        if iteration > ctx.loop_cfg.max_iterations {
            let stop = LoopStop {
                reason: StopReason::MaxIterations,
                detail: format!(
                    "reached max_iterations ({})",
                    ctx.loop_cfg.max_iterations
                ),
            };
            return Ok(outcome(iterations_run, stop_run(ctx, state, iteration, stop)?));
        }

        let result = run_iteration(ctx, state);
        iterations_run += 1;
        match result {
            Ok(IterationOutcome::Complete) => {
                state.completed = true;
                state.last_stop = None;
                write_run_state(&ctx.paths.run_state_path, state)?;
                emit(ctx.events, EventKind::RunCompleted { iteration });
                info!(iteration, "loop complete");
                return Ok(outcome(iterations_run, LoopEnd::Complete { iteration }));
            }
            Ok(IterationOutcome::PendingApproval) => {
                write_run_state(&ctx.paths.run_state_path, state)?;
                info!(iteration, "waiting for approval");
                return Ok(outcome(
                    iterations_run,
                    LoopEnd::PendingApproval { iteration },
                ));
            }
            Ok(IterationOutcome::Stopped(stop)) => {
                match stop.reason {
                    // Cancelled between roles: resume the same iteration.
                    StopReason::Cancelled => {}
                    _ => {
                        state.advance_iteration();
                        state.stuck = StuckState::default();
                        state.no_progress = NoProgressState::default();
                    }
                }
                return Ok(outcome(iterations_run, stop_run(ctx, state, iteration, stop)?));
            }
            Ok(IterationOutcome::Continue) => {
                state.advance_iteration();
                state.rejection_note = None;
                write_run_state(&ctx.paths.run_state_path, state)?;
            }
            Err(err) => {
                let Some(stop) = err.downcast_ref::<LoopError>().and_then(loop_error_stop) else {
                    write_run_state(&ctx.paths.run_state_path, state)?;
                    return Err(err);
                };
                warn!(reason = stop.reason.code(), detail = %stop.detail, "iteration halted");
                mark_iteration_stopped(ctx, iteration, &stop)?;
                return Ok(outcome(iterations_run, stop_run(ctx, state, iteration, stop)?));
            }
        }
    }
}

fn loop_error_stop(err: &LoopError) -> Option<LoopStop> {
    err.stop_reason().map(|reason| LoopStop {
        reason,
        detail: err.to_string(),
    })
}

/// Record a stop in state, events and timeline.
fn stop_run(
    ctx: &LoopContext<'_>,
    state: &mut LoopRunState,
    iteration: u32,
    stop: LoopStop,
) -> Result<LoopEnd> {
    if stop.reason == StopReason::Cancelled {
        clear_cancel(ctx.paths)?;
    }
    state.last_stop = Some(stop.clone());
    write_run_state(&ctx.paths.run_state_path, state)?;
    emit(
        ctx.events,
        EventKind::RunStopped {
            iteration,
            stop: stop.clone(),
        },
    );
    append_timeline(
        &ctx.paths.timeline_path,
        &format!(
            "run stopped: {} ({}); resume with `{}`",
            stop.reason.code(),
            stop.detail,
            resume_command(&ctx.loop_cfg.id)
        ),
    )?;
    Ok(LoopEnd::Stopped(stop))
}

/// Close the summary entry of an iteration that halted on an error.
fn mark_iteration_stopped(ctx: &LoopContext<'_>, iteration: u32, stop: &LoopStop) -> Result<()> {
    let summary = load_run_summary(&ctx.paths.run_summary_path, &ctx.loop_cfg.id)?;
    let Some(mut entry) = summary
        .iterations
        .into_iter()
        .find(|e| e.run_id == ctx.events.run_id() && e.iteration == iteration)
    else {
        return Ok(());
    };
    entry.result = IterationResult::Stopped;
    entry.stop = Some(stop.clone());
    entry.ended_at = Some(now_rfc3339());
    upsert_iteration_summary(&ctx.paths.run_summary_path, &ctx.loop_cfg.id, &entry)
}

/// Apply an approval decision recorded since the last run.
///
/// Returns the end of this run when the decision settles it: still pending,
/// or approved (the loop completes without re-running roles).
fn consume_decision(ctx: &LoopContext<'_>, state: &mut LoopRunState) -> Result<Option<LoopEnd>> {
    let Some(request) = load_approval(&ctx.paths.approval_path)? else {
        return Ok(None);
    };
    let iteration = request.iteration;
    match request.status {
        ApprovalStatus::Pending => {
            info!(iteration, "approval still pending");
            Ok(Some(LoopEnd::PendingApproval { iteration }))
        }
        ApprovalStatus::Approved => {
            consume_approval(&ctx.paths.approval_path)?;
            emit(
                ctx.events,
                EventKind::ApprovalConsumed {
                    iteration,
                    approved: true,
                },
            );
            state.completed = true;
            state.last_stop = None;
            write_run_state(&ctx.paths.run_state_path, state)?;
            if let Some(mut entry) = load_run_summary(&ctx.paths.run_summary_path, &ctx.loop_cfg.id)?
                .iterations
                .into_iter()
                .find(|e| e.run_id == request.run_id && e.iteration == iteration)
            {
                entry.result = IterationResult::Complete;
                upsert_iteration_summary(&ctx.paths.run_summary_path, &ctx.loop_cfg.id, &entry)?;
            }
            let by = request.by.as_deref().unwrap_or("unknown");
            append_timeline(
                &ctx.paths.timeline_path,
                &format!("iteration {iteration} approved by {by}; loop complete"),
            )?;
            emit(ctx.events, EventKind::RunCompleted { iteration });
            Ok(Some(LoopEnd::Complete { iteration }))
        }
        ApprovalStatus::Rejected => {
            consume_approval(&ctx.paths.approval_path)?;
            emit(
                ctx.events,
                EventKind::ApprovalConsumed {
                    iteration,
                    approved: false,
                },
            );
            let note = request
                .note
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "rejected without a note".to_string());
            append_timeline(
                &ctx.paths.timeline_path,
                &format!("iteration {iteration} rejected: {note}"),
            )?;
            state.rejection_note = Some(note);
            if state.current_iteration == iteration {
                state.advance_iteration();
            }
            write_run_state(&ctx.paths.run_state_path, state)?;
            Ok(None)
        }
    }
}
