//! Loop-level harness tests for full run lifecycle scenarios.
//!
//! These tests drive `run_loop` with scripted agents and gate commands to
//! verify end-to-end behavior: role ordering, gate evaluation, approval,
//! stuck detection, and resumption after every kind of halt.

use superloop::core::error::LoopError;
use superloop::core::types::{ApprovalStatus, ResumeHint, Role, StopReason, TimeoutReason};
use superloop::io::approval::load_approval;
use superloop::io::events::{EventKind, IterationResult, load_run_summary, read_events};
use superloop::io::run_state::{acquire_active, load_run_state};
use superloop::looping::{LoopEnd, LoopOutcome, RunOptions, run_loop};
use superloop::status::decide;
use superloop::test_support::{ScriptedAgentRunner, ScriptedGateRunner, ScriptedTurn, TestRepo};

const LOOP: &str = "demo";

const TESTS_ON_PROMISE: &str = "[loops.tests]\nmode = \"on_promise\"\ncommands = [\"cargo test\"]\n";

/// Config with one fake runner and a single `demo` loop. `loop_keys` lands
/// in the `[[loops]]` table; `tables` is appended after the tests table.
fn config(loop_keys: &str, tests: &str, tables: &str) -> String {
    format!(
        r#"
[runners.fake]
command = ["fake-agent"]

[[loops]]
id = "demo"
spec_file = "spec.md"
runner = "fake"
completion_promise = "DONE"
{loop_keys}

{tests}
[loops.rate_limit]
max_retries = 0
backoff_base_secs = 0

{tables}
"#
    )
}

fn repo_with_tests(loop_keys: &str, tests: &str, tables: &str) -> TestRepo {
    let repo = TestRepo::new().expect("repo");
    repo.write_config(&config(loop_keys, tests, tables))
        .expect("config");
    repo.write_file("spec.md", "# Demo\n\nBuild the demo.\n")
        .expect("spec");
    repo
}

fn repo_with(loop_keys: &str, tables: &str) -> TestRepo {
    repo_with_tests(loop_keys, TESTS_ON_PROMISE, tables)
}

fn run(repo: &TestRepo, runner: &ScriptedAgentRunner, gates: &ScriptedGateRunner) -> LoopOutcome {
    run_loop(repo.root(), LOOP, runner, gates, &RunOptions::default()).expect("run loop")
}

fn stop_reason(outcome: &LoopOutcome) -> Option<StopReason> {
    match &outcome.end {
        LoopEnd::Stopped(stop) => Some(stop.reason),
        _ => None,
    }
}

#[test]
fn completes_when_promise_matches_and_tests_pass() {
    let repo = repo_with("", "");
    let runner = ScriptedAgentRunner::new();
    runner.push("reviewer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(outcome.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(outcome.iterations_run, 1);
    assert_eq!(
        runner.labels(),
        vec!["planner", "implementer", "tester", "reviewer"]
    );
    assert_eq!(gates.commands(), vec!["cargo test"]);

    let paths = repo.loop_paths(LOOP);
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert!(state.completed);
    assert!(!state.active);
    assert!(
        paths
            .iteration(&outcome.run_id, 1)
            .iteration_path
            .is_file()
    );
    let summary = load_run_summary(&paths.run_summary_path, LOOP).expect("summary");
    let latest = summary.latest().expect("latest entry");
    assert_eq!(latest.result, IterationResult::Complete);
    assert!(latest.promise_matched);

    // A completed loop does not run again.
    let again = run(&repo, &runner, &gates);
    assert_eq!(again.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(again.iterations_run, 0);
    assert_eq!(runner.calls().len(), 4);
}

#[test]
fn failing_tests_feed_the_next_iteration() {
    let repo = repo_with("", "");
    let runner = ScriptedAgentRunner::new();
    runner.set_default("reviewer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();
    gates.push(
        "cargo test",
        ScriptedGateRunner::fail(101, "test parser::rejects_empty ... FAILED\n"),
    );

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(outcome.end, LoopEnd::Complete { iteration: 2 });
    assert_eq!(outcome.iterations_run, 2);
    let second_planner = runner
        .calls()
        .into_iter()
        .filter(|c| c.label == "planner")
        .nth(1)
        .expect("second planner call");
    assert!(second_planner.prompt.contains("parser::rejects_empty"));
    assert!(second_planner.prompt.contains("unmet gate"));
}

#[test]
fn missing_promise_skips_tests_and_continues() {
    let repo = repo_with(
        "max_iterations = 2",
        "[loops.stuck]\nthreshold = 0\nno_progress_threshold = 0\n",
    );
    let runner = ScriptedAgentRunner::new();
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(stop_reason(&outcome), Some(StopReason::MaxIterations));
    assert_eq!(outcome.iterations_run, 2);
    assert!(gates.commands().is_empty());
}

#[test]
fn approval_is_requested_and_approve_completes_without_rerunning_roles() {
    let repo = repo_with("", "[loops.approval]\nrequired = true\n");
    let runner = ScriptedAgentRunner::new();
    runner.push("reviewer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();

    let first = run(&repo, &runner, &gates);
    assert_eq!(first.end, LoopEnd::PendingApproval { iteration: 1 });
    let paths = repo.loop_paths(LOOP);
    let request = load_approval(&paths.approval_path)
        .expect("load")
        .expect("approval request");
    assert_eq!(request.status, ApprovalStatus::Pending);

    // Still pending: nothing runs.
    let waiting = run(&repo, &runner, &gates);
    assert_eq!(waiting.end, LoopEnd::PendingApproval { iteration: 1 });
    assert_eq!(runner.calls().len(), 4);

    decide(repo.root(), LOOP, ApprovalStatus::Approved, Some("ana"), None).expect("approve");
    let approved = run(&repo, &runner, &gates);
    assert_eq!(approved.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(runner.calls().len(), 4);
    assert!(load_approval(&paths.approval_path).expect("load").is_none());
    assert!(
        load_run_state(&paths.run_state_path, LOOP)
            .expect("state")
            .completed
    );
}

#[test]
fn rejection_note_is_injected_into_the_next_iteration() {
    let repo = repo_with("", "[loops.approval]\nrequired = true\n");
    let runner = ScriptedAgentRunner::new();
    runner.set_default("reviewer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();

    assert_eq!(
        run(&repo, &runner, &gates).end,
        LoopEnd::PendingApproval { iteration: 1 }
    );
    decide(
        repo.root(),
        LOOP,
        ApprovalStatus::Rejected,
        Some("ana"),
        Some("document the public API"),
    )
    .expect("reject");

    let second = run(&repo, &runner, &gates);
    assert_eq!(second.end, LoopEnd::PendingApproval { iteration: 2 });
    let calls = runner.calls();
    assert!(!calls[0].prompt.contains("document the public API"));
    let retried: Vec<_> = calls[4..].iter().map(|c| c.label.as_str()).collect();
    assert_eq!(retried, ["planner", "implementer", "tester", "reviewer"]);
    assert!(
        calls[4..]
            .iter()
            .all(|c| c.prompt.contains("document the public API"))
    );
}

#[test]
fn unchanged_workspace_stops_as_stuck_with_report() {
    let repo = repo_with(
        r#"roles = ["implementer"]"#,
        "[loops.stuck]\nthreshold = 2\nno_progress_threshold = 0\n",
    );
    let runner = ScriptedAgentRunner::new();
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(stop_reason(&outcome), Some(StopReason::Stuck));
    assert_eq!(outcome.iterations_run, 2);
    let paths = repo.loop_paths(LOOP);
    let report = repo
        .read_file(".superloop/loops/demo/stuck-report.json")
        .expect("stuck report");
    assert!(report.contains("\"streak\": 2"));

    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert_eq!(state.current_iteration, 3);
    assert_eq!(state.stuck.streak, 0);
    assert_eq!(
        state.last_stop.map(|s| s.reason),
        Some(StopReason::Stuck)
    );
}

#[test]
fn code_changes_keep_the_loop_from_being_stuck() {
    let repo = repo_with(
        r#"roles = ["implementer"]
max_iterations = 3"#,
        "[loops.stuck]\nthreshold = 2\nno_progress_threshold = 0\n",
    );
    let runner = ScriptedAgentRunner::new();
    for n in 1..=3 {
        runner.push(
            "implementer",
            ScriptedTurn::ok("progress").with_file("src/lib.rs", &format!("// step {n}\n")),
        );
    }
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(stop_reason(&outcome), Some(StopReason::MaxIterations));
    assert_eq!(outcome.iterations_run, 3);
}

#[test]
fn checklist_only_loop_stops_without_progress() {
    let repo = repo_with_tests(
        r#"roles = ["implementer"]"#,
        "[loops.tests]\nmode = \"never\"\n",
        r#"[loops.checklist]
patterns = ["spec.md"]

[loops.stuck]
threshold = 3
no_progress_threshold = 2
"#,
    );
    repo.write_file("spec.md", "# Demo\n\n- [x] parse input\n- [ ] print output\n")
        .expect("spec");
    let runner = ScriptedAgentRunner::new();
    runner.set_default("implementer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(stop_reason(&outcome), Some(StopReason::NoProgress));
    assert_eq!(outcome.iterations_run, 2);
    assert!(gates.commands().is_empty());
    let first_prompt = &runner.calls()[0].prompt;
    assert!(first_prompt.contains("print output"));
}

#[test]
fn checklist_completion_counts_toward_done() {
    let repo = repo_with(
        r#"roles = ["implementer"]"#,
        "[loops.checklist]\npatterns = [\"spec.md\"]\n",
    );
    repo.write_file("spec.md", "# Demo\n\n- [ ] print output\n")
        .expect("spec");
    let runner = ScriptedAgentRunner::new();
    runner.push("implementer", ScriptedTurn::promise("DONE"));
    runner.push(
        "implementer",
        ScriptedTurn::promise("DONE").with_file("spec.md", "# Demo\n\n- [x] print output\n"),
    );
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(outcome.end, LoopEnd::Complete { iteration: 2 });
    // Tests run on promise in both iterations; the checklist held back the first.
    assert_eq!(gates.commands().len(), 2);
}

#[test]
fn rate_limit_exhaustion_resumes_the_session_on_rerun() {
    let repo = repo_with(r#"roles = ["implementer", "reviewer"]"#, "");
    let runner = ScriptedAgentRunner::new();
    runner.push("implementer", ScriptedTurn::ok("implemented"));
    runner.push(
        "reviewer",
        ScriptedTurn::rate_limited(Some(ResumeHint::SessionId("sess-7".to_string()))),
    );
    let gates = ScriptedGateRunner::new();

    let first = run(&repo, &runner, &gates);
    assert_eq!(stop_reason(&first), Some(StopReason::RateLimit));
    let paths = repo.loop_paths(LOOP);
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert_eq!(state.completed_roles, vec![Role::Implementer]);
    assert_eq!(
        state.pending_resume.as_ref().map(|p| p.role),
        Some(Role::Reviewer)
    );

    runner.push("reviewer", ScriptedTurn::promise("DONE"));
    let second = run(&repo, &runner, &gates);
    assert_eq!(second.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(second.run_id, first.run_id);

    let resumed = &runner.calls()[2..];
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].label, "reviewer");
    assert_eq!(
        resumed[0].resume,
        Some(ResumeHint::SessionId("sess-7".to_string()))
    );
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert!(state.pending_resume.is_none());
}

#[test]
fn hard_failure_resumes_at_first_incomplete_role() {
    let repo = repo_with("", "");
    let runner = ScriptedAgentRunner::new();
    runner.push("tester", ScriptedTurn::failed(2));
    runner.push("reviewer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();

    let first = run(&repo, &runner, &gates);
    assert_eq!(stop_reason(&first), Some(StopReason::RoleFailed));
    let paths = repo.loop_paths(LOOP);
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert_eq!(state.completed_roles, vec![Role::Planner, Role::Implementer]);
    assert_eq!(state.current_iteration, 1);

    let second = run(&repo, &runner, &gates);
    assert_eq!(second.end, LoopEnd::Complete { iteration: 1 });
    let labels = runner.labels();
    assert_eq!(&labels[3..], ["tester", "reviewer"]);

    let events = read_events(&paths.events_path).expect("events");
    assert!(
        events
            .iter()
            .any(|e| matches!(e.kind, EventKind::RoleSkipped { role: Role::Planner, .. }))
    );
}

#[test]
fn timed_out_role_restores_its_report() {
    let repo = repo_with(r#"roles = ["implementer"]"#, "");
    repo.write_file(".superloop/loops/demo/implementer.md", "previous report\n")
        .expect("report");
    let runner = ScriptedAgentRunner::new();
    runner.push(
        "implementer",
        ScriptedTurn::timed_out(TimeoutReason::Inactivity)
            .with_file(".superloop/loops/demo/implementer.md", "half-writ"),
    );
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(stop_reason(&outcome), Some(StopReason::RoleTimeout));
    assert_eq!(
        repo.read_file(".superloop/loops/demo/implementer.md")
            .expect("report"),
        "previous report\n"
    );
    let summary = load_run_summary(&repo.loop_paths(LOOP).run_summary_path, LOOP).expect("summary");
    assert_eq!(
        summary.latest().map(|e| e.result),
        Some(IterationResult::Stopped)
    );
}

#[test]
fn cancel_marker_stops_between_roles_and_resumes_same_iteration() {
    let repo = repo_with("", "");
    let runner = ScriptedAgentRunner::new();
    runner.push(
        "planner",
        ScriptedTurn::ok("planned").with_file(".superloop/loops/demo/cancel.request", "now"),
    );
    runner.push("reviewer", ScriptedTurn::promise("DONE"));
    let gates = ScriptedGateRunner::new();

    let first = run(&repo, &runner, &gates);
    assert_eq!(stop_reason(&first), Some(StopReason::Cancelled));
    let paths = repo.loop_paths(LOOP);
    assert!(!paths.cancel_path.exists());
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert_eq!(state.current_iteration, 1);
    assert_eq!(state.completed_roles, vec![Role::Planner]);

    let second = run(&repo, &runner, &gates);
    assert_eq!(second.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(&runner.labels()[1..], ["implementer", "tester", "reviewer"]);
}

const TWO_SCRIPTED_SESSIONS: &str = r#"[[loops.scripted.sessions]]
runner = "fake"
prompt = "Run the migration script."

[[loops.scripted.sessions]]
runner = "fake"
prompt = "Summarize the results."
"#;

#[test]
fn scripted_sessions_complete_without_a_promise() {
    let repo = repo_with(r#"roles = ["scripted"]"#, TWO_SCRIPTED_SESSIONS);
    let runner = ScriptedAgentRunner::new();
    let gates = ScriptedGateRunner::new();

    let outcome = run(&repo, &runner, &gates);

    assert_eq!(outcome.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(runner.labels(), vec!["scripted/1", "scripted/2"]);
    assert!(runner.calls()[0].prompt.contains("Run the migration script."));
    assert_eq!(gates.commands(), vec!["cargo test"]);
}

#[test]
fn rate_limited_scripted_session_resumes_alone() {
    let repo = repo_with(r#"roles = ["scripted"]"#, TWO_SCRIPTED_SESSIONS);
    let runner = ScriptedAgentRunner::new();
    runner.push(
        "scripted/2",
        ScriptedTurn::rate_limited(Some(ResumeHint::SessionId("s2".to_string()))),
    );
    let gates = ScriptedGateRunner::new();

    let first = run(&repo, &runner, &gates);
    assert_eq!(stop_reason(&first), Some(StopReason::RateLimit));
    let paths = repo.loop_paths(LOOP);
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert_eq!(state.completed_scripted, vec![1]);
    assert_eq!(
        state.pending_resume.as_ref().map(|p| p.label.as_str()),
        Some("scripted/2")
    );

    let second = run(&repo, &runner, &gates);
    assert_eq!(second.end, LoopEnd::Complete { iteration: 1 });
    assert_eq!(second.run_id, first.run_id);

    let resumed = &runner.calls()[2..];
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].label, "scripted/2");
    assert_eq!(
        resumed[0].resume,
        Some(ResumeHint::SessionId("s2".to_string()))
    );
    let state = load_run_state(&paths.run_state_path, LOOP).expect("state");
    assert!(state.pending_resume.is_none());
}

#[test]
fn concurrent_runs_admit_only_one() {
    let repo = repo_with(r#"roles = ["implementer"]"#, "");
    let runner = ScriptedAgentRunner::new();
    runner.set_default(
        "implementer",
        ScriptedTurn::promise("DONE").with_delay(std::time::Duration::from_millis(300)),
    );
    let gates = ScriptedGateRunner::new();
    let barrier = std::sync::Barrier::new(2);
    let (repo, runner, gates, barrier) = (&repo, &runner, &gates, &barrier);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(move || {
                    barrier.wait();
                    run_loop(repo.root(), LOOP, runner, gates, &RunOptions::default())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect()
    });

    let completed = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Ok(LoopOutcome {
                    end: LoopEnd::Complete { iteration: 1 },
                    ..
                })
            )
        })
        .count();
    assert_eq!(completed, 1);
    let refused = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .filter(|e| {
            matches!(
                e.downcast_ref::<LoopError>(),
                Some(LoopError::AlreadyRunning { .. })
            )
        })
        .count();
    assert_eq!(refused, 1);
    assert_eq!(runner.labels(), vec!["implementer"]);
}

#[test]
fn second_run_is_refused_while_active() {
    let repo = repo_with("", "");
    let paths = repo.loop_paths(LOOP);
    acquire_active(&paths.run_state_path, LOOP, false).expect("acquire");
    let runner = ScriptedAgentRunner::new();
    let gates = ScriptedGateRunner::new();

    let err = run_loop(repo.root(), LOOP, &runner, &gates, &RunOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::AlreadyRunning { .. })
    ));
    assert!(runner.calls().is_empty());

    runner.push("reviewer", ScriptedTurn::promise("DONE"));
    let forced = run_loop(
        repo.root(),
        LOOP,
        &runner,
        &gates,
        &RunOptions { force: true },
    )
    .expect("forced run");
    assert_eq!(forced.end, LoopEnd::Complete { iteration: 1 });
}
