//! Canonical `.superloop/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::types::{GateKind, Role};

/// Workspace-level paths under `.superloop/`.
#[derive(Debug, Clone)]
pub struct SuperloopPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub specs_dir: PathBuf,
    pub loops_dir: PathBuf,
}

impl SuperloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(".superloop");
        Self {
            root: root.clone(),
            dir: dir.clone(),
            config_path: dir.join("config.toml"),
            gitignore_path: dir.join(".gitignore"),
            specs_dir: dir.join("specs"),
            loops_dir: dir.join("loops"),
        }
    }

    pub fn loop_paths(&self, loop_id: &str) -> LoopPaths {
        LoopPaths::new(&self.root, loop_id)
    }
}

/// Per-loop state and artifact paths.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub dir: PathBuf,
    pub run_state_path: PathBuf,
    pub events_path: PathBuf,
    pub run_summary_path: PathBuf,
    pub timeline_path: PathBuf,
    pub approval_path: PathBuf,
    pub stuck_report_path: PathBuf,
    /// Marker written by `superloop cancel`, honored between roles.
    pub cancel_path: PathBuf,
    pub runs_dir: PathBuf,
}

impl LoopPaths {
    pub fn new(root: &Path, loop_id: &str) -> Self {
        let dir = root.join(".superloop").join("loops").join(loop_id);
        Self {
            dir: dir.clone(),
            run_state_path: dir.join("run_state.json"),
            events_path: dir.join("events.jsonl"),
            run_summary_path: dir.join("run-summary.json"),
            timeline_path: dir.join("timeline.md"),
            approval_path: dir.join("approval.json"),
            stuck_report_path: dir.join("stuck-report.json"),
            cancel_path: dir.join("cancel.request"),
            runs_dir: dir.join("runs"),
        }
    }

    /// Canonical report path for roles that own one.
    pub fn report_path(&self, role: Role) -> Option<PathBuf> {
        role.report_file().map(|name| self.dir.join(name))
    }

    pub fn iteration(&self, run_id: &str, iteration: u32) -> IterationPaths {
        IterationPaths::new(&self.runs_dir, run_id, iteration)
    }
}

/// Artifacts owned by one `(loop, run, iteration)`.
#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub last_messages_dir: PathBuf,
    pub gates_dir: PathBuf,
    pub delegation_dir: PathBuf,
    pub iteration_path: PathBuf,
    pub test_output_path: PathBuf,
    pub validation_output_path: PathBuf,
}

impl IterationPaths {
    pub fn new(runs_dir: &Path, run_id: &str, iteration: u32) -> Self {
        let dir = runs_dir.join(run_id).join(format!("iter-{iteration}"));
        Self {
            dir: dir.clone(),
            prompts_dir: dir.join("prompts"),
            logs_dir: dir.join("logs"),
            last_messages_dir: dir.join("last_messages"),
            gates_dir: dir.join("gates"),
            delegation_dir: dir.join("delegation"),
            iteration_path: dir.join("iteration.json"),
            test_output_path: dir.join("gates").join("test-output.txt"),
            validation_output_path: dir.join("gates").join("validation-output.txt"),
        }
    }

    pub fn prompt_path(&self, role: Role) -> PathBuf {
        self.prompts_dir.join(format!("{role}.md"))
    }

    pub fn log_path(&self, role: Role) -> PathBuf {
        self.logs_dir.join(format!("{role}.log"))
    }

    pub fn last_message_path(&self, role: Role) -> PathBuf {
        self.last_messages_dir.join(format!("{role}.md"))
    }

    pub fn gate_status_path(&self, gate: GateKind) -> PathBuf {
        self.gates_dir.join(format!("{}-status.json", gate.as_str()))
    }

    pub fn role_delegation_dir(&self, role: Role) -> PathBuf {
        self.delegation_dir.join(role.as_str())
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.dir,
            &self.prompts_dir,
            &self.logs_dir,
            &self.last_messages_dir,
            &self.gates_dir,
        ] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

/// Options for `init_superloop`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing scaffolding files.
    pub force: bool,
}

/// Create `.superloop/` scaffolding in `root`.
///
/// Fails if `.superloop/config.toml` already exists unless `options.force` is set.
pub fn init_superloop(root: &Path, options: &InitOptions) -> Result<SuperloopPaths> {
    let paths = SuperloopPaths::new(root);
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "superloop init: .superloop exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "superloop init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.dir)?;
    create_dir(&paths.specs_dir)?;
    create_dir(&paths.loops_dir)?;

    write_file(&paths.gitignore_path, SUPERLOOP_GITIGNORE)?;
    write_file(&paths.config_path, DEFAULT_CONFIG)?;
    let spec_path = paths.specs_dir.join("main.md");
    if options.force || !spec_path.exists() {
        write_file(&spec_path, SPEC_PLACEHOLDER)?;
    }

    Ok(paths)
}

pub(crate) fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const SUPERLOOP_GITIGNORE: &str = "loops/*/runs/\nloops/*/run_state.json\nloops/*/*.tmp\n";

const SPEC_PLACEHOLDER: &str = "# Feature spec\n\nDescribe the feature and its acceptance checklist here.\n\n- [ ] first acceptance item\n";

const DEFAULT_CONFIG: &str = r#"# Superloop configuration.

[runners.codex]
command = ["codex", "exec", "--sandbox", "workspace-write", "--json"]
prompt_mode = "stdin"
resume = "thread_discovery"
resume_args = ["resume", "{resume_id}"]
last_message_args = ["--output-last-message", "{last_message_file}"]
transcripts_dir = "~/.codex/sessions"

[runners.claude]
command = ["claude", "-p", "--output-format", "stream-json", "--verbose"]
prompt_mode = "arg"
resume = "session_id"
session_args = ["--session-id", "{session_id}"]
resume_args = ["--resume", "{resume_id}"]

[[loops]]
id = "main"
spec_file = ".superloop/specs/main.md"
roles = ["planner", "implementer", "tester", "reviewer"]
completion_promise = "SUPERLOOP_COMPLETE"
max_iterations = 20
runner = "codex"

[loops.tests]
mode = "on_promise"
commands = []

[loops.checklist]
patterns = [".superloop/specs/main.md"]

[loops.stuck]
threshold = 3
no_progress_threshold = 2
ignore = ["target/**", "node_modules/**"]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_superloop(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.dir.is_dir());
        assert!(paths.specs_dir.is_dir());
        assert!(paths.loops_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert!(paths.gitignore_path.is_file());
        assert!(paths.specs_dir.join("main.md").is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            SUPERLOOP_GITIGNORE
        );
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_superloop(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_rewrites_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "custom").expect("write custom");
        init_superloop(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(
            fs::read_to_string(&paths.config_path).expect("read"),
            DEFAULT_CONFIG
        );
    }

    #[test]
    fn iteration_paths_are_stable() {
        let loop_paths = LoopPaths::new(Path::new("/repo"), "demo");
        let iter = loop_paths.iteration("run-1", 3);
        assert!(
            iter.dir
                .ends_with(Path::new(".superloop/loops/demo/runs/run-1/iter-3"))
        );
        assert!(iter.prompt_path(Role::Planner).ends_with("prompts/planner.md"));
        assert!(
            iter.gate_status_path(GateKind::Tests)
                .ends_with("gates/tests-status.json")
        );
        assert_eq!(
            loop_paths.report_path(Role::Reviewer),
            Some(PathBuf::from("/repo/.superloop/loops/demo/review.md"))
        );
        assert_eq!(loop_paths.report_path(Role::Scripted), None);
    }

    #[test]
    fn default_config_parses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
        let cfg = crate::io::config::load_config(&paths.config_path).expect("load");
        assert_eq!(cfg.loops.len(), 1);
        assert_eq!(cfg.loops[0].id, "main");
    }
}
