//! `ProcessAgentRunner` against real `sh` processes: prompt delivery, both
//! deadlines, rate-limit detection and last-message capture.
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use superloop::core::types::{ResumeHint, ResumeStrategy, TimeoutReason};
use superloop::io::agent::{
    AgentRequest, AgentRunner, ProcessAgentRunner, RATE_LIMIT_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use superloop::io::config::{PromptMode, RunnerSpec};

fn spec(script: &str) -> RunnerSpec {
    RunnerSpec {
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        ..RunnerSpec::default()
    }
}

fn request(dir: &Path, runner: RunnerSpec) -> AgentRequest {
    AgentRequest {
        label: "implementer".to_string(),
        runner,
        prompt: "do the thing".to_string(),
        workdir: dir.to_path_buf(),
        log_path: dir.join("logs/implementer.log"),
        last_message_path: dir.join("last/implementer.md"),
        output_file: None,
        max_timeout: Duration::from_secs(10),
        inactivity_timeout: Duration::from_secs(10),
        resume: None,
        output_limit_bytes: 64 * 1024,
        rate_limit_context_lines: 1,
    }
}

fn runner() -> ProcessAgentRunner {
    ProcessAgentRunner::new().with_grace(Duration::from_millis(200))
}

#[test]
fn prompt_is_delivered_on_stdin_and_output_is_logged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(temp.path(), spec("cat; echo; echo finished"));

    let invocation = runner().invoke(&req).expect("invoke");

    assert!(invocation.succeeded());
    assert!(invocation.output.contains("do the thing"));
    // No last-message file written: the output tail stands in.
    let message = invocation.last_message.expect("fallback message");
    assert!(message.contains("finished"));
    assert!(req.last_message_path.is_file());
    let log = fs::read_to_string(&req.log_path).expect("log");
    assert!(log.starts_with("[superloop] start label=implementer"));
    assert!(log.contains("do the thing"));
    assert!(log.contains("[superloop] end exit_code=Some(0)"));
}

#[test]
fn prompt_can_be_passed_as_last_argument() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut runner_spec = spec(r#"echo "got: $1""#);
    runner_spec.command.push("sh".to_string());
    runner_spec.prompt_mode = PromptMode::Arg;

    let invocation = runner()
        .invoke(&request(temp.path(), runner_spec))
        .expect("invoke");

    assert!(invocation.output.contains("got: do the thing"));
}

#[test]
fn last_message_file_written_by_the_agent_wins() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut runner_spec = spec(r#"echo noise; printf 'final <promise>DONE</promise>' > "$0""#);
    runner_spec.last_message_args = vec!["{last_message_file}".to_string()];

    let invocation = runner()
        .invoke(&request(temp.path(), runner_spec))
        .expect("invoke");

    assert_eq!(
        invocation.last_message.as_deref(),
        Some("final <promise>DONE</promise>")
    );
}

#[test]
fn non_zero_exit_is_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let invocation = runner()
        .invoke(&request(temp.path(), spec("echo broken >&2; exit 7")))
        .expect("invoke");

    assert!(!invocation.succeeded());
    assert_eq!(invocation.exit_code, Some(7));
    assert_eq!(invocation.exit_status(), 7);
    assert!(invocation.output.contains("broken"));
}

#[test]
fn silent_agent_hits_inactivity_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut req = request(temp.path(), spec("echo start; sleep 10"));
    req.inactivity_timeout = Duration::from_millis(300);

    let invocation = runner().invoke(&req).expect("invoke");

    assert_eq!(invocation.timed_out, Some(TimeoutReason::Inactivity));
    assert_eq!(invocation.exit_status(), TIMEOUT_EXIT_CODE);
    assert!(invocation.duration < Duration::from_secs(5));
}

#[test]
fn chatty_agent_hits_max_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut req = request(
        temp.path(),
        spec("while true; do echo tick; sleep 0.05; done"),
    );
    req.max_timeout = Duration::from_millis(500);
    req.inactivity_timeout = Duration::from_secs(5);

    let invocation = runner().invoke(&req).expect("invoke");

    assert_eq!(invocation.timed_out, Some(TimeoutReason::MaxTimeout));
    assert!(invocation.output.contains("tick"));
    assert!(invocation.duration < Duration::from_secs(4));
}

#[test]
fn rate_limit_line_stops_the_agent_early() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        spec(
            "echo working; echo 'Error: usage limit reached, try again in 30 seconds'; \
             echo 'see plan settings'; sleep 10",
        ),
    );

    let invocation = runner().invoke(&req).expect("invoke");

    let hit = invocation.rate_limit.clone().expect("rate limit detected");
    assert_eq!(hit.retry_after, Some(Duration::from_secs(30)));
    assert_eq!(hit.context, vec!["see plan settings".to_string()]);
    assert_eq!(invocation.exit_status(), RATE_LIMIT_EXIT_CODE);
    assert!(invocation.timed_out.is_none());
    assert!(invocation.duration < Duration::from_secs(5));
}

#[test]
fn session_id_runner_gets_a_minted_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut runner_spec = spec(r#"echo "session=$0""#);
    runner_spec.resume = ResumeStrategy::SessionId;
    runner_spec.session_args = vec!["{session_id}".to_string()];

    let invocation = runner()
        .invoke(&request(temp.path(), runner_spec))
        .expect("invoke");

    let Some(ResumeHint::SessionId(id)) = invocation.resume_hint else {
        panic!("expected a minted session id");
    };
    assert!(invocation.output.contains(&format!("session={id}")));
}

#[test]
fn resuming_passes_resume_args_and_resume_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut runner_spec = spec(r#"echo "resume=$0"; cat"#);
    runner_spec.resume = ResumeStrategy::SessionId;
    runner_spec.session_args = vec!["{session_id}".to_string()];
    runner_spec.resume_args = vec!["{resume_id}".to_string()];
    let mut req = request(temp.path(), runner_spec);
    req.resume = Some(ResumeHint::SessionId("sess-42".to_string()));

    let invocation = runner().invoke(&req).expect("invoke");

    assert!(invocation.output.contains("resume=sess-42"));
    assert!(invocation.output.contains("Continue the task"));
    assert!(!invocation.output.contains("do the thing"));
    assert_eq!(
        invocation.resume_hint,
        Some(ResumeHint::SessionId("sess-42".to_string()))
    );
}
