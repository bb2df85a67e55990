//! CLI tests: spawn the superloop binary and verify exit codes and output
//! for the run, status and human-control commands.

use std::path::Path;
use std::process::{Command, Output};

use superloop::exit_codes;
use superloop::io::init::{InitOptions, init_superloop};

fn superloop(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_superloop"))
        .current_dir(root)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn superloop")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Workspace whose single loop runs `script` through `sh -c` as the implementer.
fn workspace(script: &str, extra: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
    let config = format!(
        r#"
[runners.sh]
command = ["sh", "-c", {script:?}]

[[loops]]
id = "demo"
spec_file = "spec.md"
runner = "sh"
roles = ["implementer"]
completion_promise = "DONE"
max_iterations = 2

[loops.tests]
mode = "never"

[loops.stuck]
threshold = 0
no_progress_threshold = 0
{extra}
"#
    );
    std::fs::write(temp.path().join(".superloop/config.toml"), config).expect("config");
    std::fs::write(temp.path().join("spec.md"), "# Demo\n").expect("spec");
    temp
}

#[test]
fn init_then_status_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = superloop(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(stdout(&init).contains("config=.superloop/config.toml"));

    let status = superloop(temp.path(), &["status", "--loop", "main"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(stdout(&status).contains("loop: main (idle)"));

    let again = superloop(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn unknown_loop_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_superloop(temp.path(), &InitOptions { force: false }).expect("init");

    let output = superloop(temp.path(), &["run", "--loop", "ghost"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown loop"));
}

#[test]
fn cancel_of_idle_loop_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_superloop(temp.path(), &InitOptions { force: false }).expect("init");

    let output = superloop(temp.path(), &["cancel", "--loop", "main"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[cfg(unix)]
#[test]
fn run_completes_with_promise() {
    let temp = workspace("cat > /dev/null; echo '<promise>DONE</promise>'", "");

    let output = superloop(temp.path(), &["run", "--loop", "demo"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).contains("complete: loop=demo"));

    let status = superloop(temp.path(), &["status", "--loop", "demo", "--json"]);
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).expect("status json");
    assert_eq!(json["completed"], true);
    assert_eq!(json["latest"]["promise_matched"], true);

    let list = superloop(temp.path(), &["list"]);
    assert!(stdout(&list).contains("demo complete"));
}

#[cfg(unix)]
#[test]
fn failing_role_stops_with_resume_hint() {
    let temp = workspace("cat > /dev/null; exit 4", "");

    let output = superloop(temp.path(), &["run", "--loop", "demo"]);
    assert_eq!(output.status.code(), Some(exit_codes::STOPPED));
    let text = stdout(&output);
    assert!(text.contains("reason=role_failed"));
    assert!(text.contains("resume with: superloop run --loop demo"));
}

#[cfg(unix)]
#[test]
fn approval_round_trip_through_the_cli() {
    let temp = workspace(
        "cat > /dev/null; echo '<promise>DONE</promise>'",
        "\n[loops.approval]\nrequired = true\n",
    );

    let run = superloop(temp.path(), &["run", "--loop", "demo"]);
    assert_eq!(run.status.code(), Some(exit_codes::PENDING_APPROVAL));

    let status = superloop(temp.path(), &["status", "--loop", "demo"]);
    assert!(stdout(&status).contains("approval: Pending for iteration 1"));

    let approve = superloop(temp.path(), &["approve", "--loop", "demo", "--by", "ana"]);
    assert_eq!(approve.status.code(), Some(exit_codes::OK));
    assert!(stdout(&approve).contains("approved: loop=demo iteration=1"));

    let finish = superloop(temp.path(), &["run", "--loop", "demo"]);
    assert_eq!(finish.status.code(), Some(exit_codes::OK));
}
