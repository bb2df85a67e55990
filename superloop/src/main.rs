//! Superloop CLI.
//!
//! Operates on the `.superloop/` directory of the current working directory.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use superloop::core::types::ApprovalStatus;
use superloop::exit_codes;
use superloop::io::agent::ProcessAgentRunner;
use superloop::io::gates::ShellGateRunner;
use superloop::io::init::{InitOptions, init_superloop};
use superloop::logging;
use superloop::looping::{LoopEnd, RunOptions, resume_command, run_loop};
use superloop::status::{cancel, decide, list_loops, loop_status, render_status};

#[derive(Parser)]
#[command(
    name = "superloop",
    version,
    about = "Resumable multi-role agent loop orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.superloop/` with a default config and spec.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// List configured loops and their state.
    List,
    /// Run a loop until it completes, waits for approval or stops.
    Run {
        #[arg(long = "loop")]
        loop_id: String,
        /// Remove a stale active lock left by a crashed run.
        #[arg(long)]
        force: bool,
        /// Echo agent output to stderr as it streams.
        #[arg(long)]
        stream: bool,
    },
    /// Show a loop's state, latest gates and pending approval.
    Status {
        #[arg(long = "loop")]
        loop_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Approve the pending approval request.
    Approve {
        #[arg(long = "loop")]
        loop_id: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject the pending approval request; the note is fed to the next iteration.
    Reject {
        #[arg(long = "loop")]
        loop_id: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Ask a running loop to stop at the next role boundary.
    Cancel {
        #[arg(long = "loop")]
        loop_id: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::List => cmd_list(&root),
        Command::Run {
            loop_id,
            force,
            stream,
        } => cmd_run(&root, &loop_id, force, stream),
        Command::Status { loop_id, json } => cmd_status(&root, &loop_id, json),
        Command::Approve { loop_id, by, note } => cmd_decide(
            &root,
            &loop_id,
            ApprovalStatus::Approved,
            by.as_deref(),
            note.as_deref(),
        ),
        Command::Reject { loop_id, by, note } => cmd_decide(
            &root,
            &loop_id,
            ApprovalStatus::Rejected,
            by.as_deref(),
            note.as_deref(),
        ),
        Command::Cancel { loop_id } => {
            cancel(&root, &loop_id)?;
            println!("cancel: loop={loop_id} requested");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_superloop(root, &InitOptions { force })?;
    println!("init: config={}", display_relative(root, &paths.config_path));
    Ok(exit_codes::OK)
}

fn cmd_list(root: &Path) -> Result<i32> {
    for listing in list_loops(root)? {
        let state = if listing.completed {
            "complete"
        } else if listing.active {
            "running"
        } else {
            "idle"
        };
        let approval = listing
            .approval
            .map(|a| format!(" approval={a:?}").to_lowercase())
            .unwrap_or_default();
        println!(
            "{} {state} iteration={} spec={}{approval}",
            listing.id, listing.current_iteration, listing.spec_file
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, loop_id: &str, force: bool, stream: bool) -> Result<i32> {
    let mut runner = ProcessAgentRunner::new();
    if stream {
        runner = runner.with_sink(Arc::new(|label: &str, line: &str| {
            eprintln!("[{label}] {line}");
        }));
    }
    let outcome = run_loop(
        root,
        loop_id,
        &runner,
        &ShellGateRunner::default(),
        &RunOptions { force },
    )?;
    match outcome.end {
        LoopEnd::Complete { iteration } => {
            println!(
                "complete: loop={loop_id} run={} iteration={iteration}",
                outcome.run_id
            );
            Ok(exit_codes::OK)
        }
        LoopEnd::PendingApproval { iteration } => {
            println!(
                "pending_approval: loop={loop_id} run={} iteration={iteration}",
                outcome.run_id
            );
            println!("decide with: superloop approve --loop {loop_id} (or reject --note ...)");
            Ok(exit_codes::PENDING_APPROVAL)
        }
        LoopEnd::Stopped(stop) => {
            println!(
                "stopped: loop={loop_id} run={} reason={} detail={}",
                outcome.run_id, stop.reason, stop.detail
            );
            println!("resume with: {}", resume_command(loop_id));
            Ok(exit_codes::STOPPED)
        }
    }
}

fn cmd_status(root: &Path, loop_id: &str, json: bool) -> Result<i32> {
    let status = loop_status(root, loop_id)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serialize status")?
        );
    } else {
        print!("{}", render_status(&status));
    }
    Ok(exit_codes::OK)
}

fn cmd_decide(
    root: &Path,
    loop_id: &str,
    decision: ApprovalStatus,
    by: Option<&str>,
    note: Option<&str>,
) -> Result<i32> {
    let request = decide(root, loop_id, decision, by, note)?;
    println!(
        "{}: loop={loop_id} iteration={}",
        format!("{:?}", request.status).to_lowercase(),
        request.iteration
    );
    println!("continue with: {}", resume_command(loop_id));
    Ok(exit_codes::OK)
}

fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["superloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_loop() {
        let cli = Cli::parse_from(["superloop", "run", "--loop", "main"]);
        match cli.command {
            Command::Run {
                loop_id,
                force,
                stream,
            } => {
                assert_eq!(loop_id, "main");
                assert!(!force);
                assert!(!stream);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_reject_with_note() {
        let cli = Cli::parse_from([
            "superloop",
            "reject",
            "--loop",
            "main",
            "--by",
            "ana",
            "--note",
            "missing docs",
        ]);
        match cli.command {
            Command::Reject { loop_id, by, note } => {
                assert_eq!(loop_id, "main");
                assert_eq!(by.as_deref(), Some("ana"));
                assert_eq!(note.as_deref(), Some("missing docs"));
            }
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn run_requires_loop_id() {
        assert!(Cli::try_parse_from(["superloop", "run"]).is_err());
    }
}
