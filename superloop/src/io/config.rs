//! Superloop configuration stored under `.superloop/config.toml`.
//!
//! Loading is two-step: the TOML document is checked against the embedded JSON
//! schema, then deserialized into typed structs and validated semantically.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::{GateMode, ResumeStrategy, Role};

const CONFIG_SCHEMA: &str = include_str!("../../schemas/config.schema.json");

static CONFIG_SCHEMA_VALUE: LazyLock<serde_json::Value> = LazyLock::new(|| {
    serde_json::from_str(CONFIG_SCHEMA).expect("embedded config schema is valid JSON")
});

/// Top-level configuration: named runners plus loop definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SuperloopConfig {
    pub runners: BTreeMap<String, RunnerSpec>,
    pub loops: Vec<LoopConfig>,
}

/// How the prompt reaches the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    #[default]
    Stdin,
    /// Appended as the final argument.
    Arg,
}

/// One agent CLI invocation template.
///
/// Argument lists may contain `{session_id}`, `{resume_id}`,
/// `{last_message_file}` and `{workdir}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerSpec {
    pub command: Vec<String>,
    pub prompt_mode: PromptMode,
    pub resume: ResumeStrategy,
    /// Injected on fresh sessions when `resume = "session_id"`.
    pub session_args: Vec<String>,
    /// Injected instead of `session_args` when resuming.
    pub resume_args: Vec<String>,
    pub last_message_args: Vec<String>,
    /// Transcript root scanned by `thread_discovery` (supports `~/`).
    pub transcripts_dir: Option<String>,
    /// Prompt delivered when resuming a session instead of the full prompt.
    pub resume_prompt: String,
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerSpec {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            prompt_mode: PromptMode::Stdin,
            resume: ResumeStrategy::None,
            session_args: Vec::new(),
            resume_args: Vec::new(),
            last_message_args: Vec::new(),
            transcripts_dir: None,
            resume_prompt: "Continue the task from where you left off.".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl RunnerSpec {
    pub fn transcripts_root(&self) -> Option<PathBuf> {
        let raw = self.transcripts_dir.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            let home = std::env::var_os("HOME")?;
            return Some(PathBuf::from(home).join(rest));
        }
        Some(PathBuf::from(raw))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            bail!("runners.{name}.command must be a non-empty array");
        }
        if self.resume != ResumeStrategy::None && self.resume_args.is_empty() {
            bail!("runners.{name}.resume_args is required when resume is enabled");
        }
        if self.resume == ResumeStrategy::SessionId
            && !self.session_args.iter().any(|a| a.contains("{session_id}"))
        {
            bail!("runners.{name}.session_args must contain {{session_id}} for resume = session_id");
        }
        if self.resume == ResumeStrategy::ThreadDiscovery && self.transcripts_root().is_none() {
            bail!("runners.{name}.transcripts_dir is required for resume = thread_discovery");
        }
        Ok(())
    }
}

/// One loop definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub id: String,
    pub spec_file: String,
    pub roles: Vec<Role>,
    pub completion_promise: String,
    pub max_iterations: u32,
    /// Default runner for every role without an explicit binding.
    pub runner: String,
    pub role_runners: BTreeMap<Role, String>,
    pub timeouts: TimeoutConfig,
    pub tests: TestsGate,
    pub validation: ValidationGate,
    pub checklist: ChecklistGate,
    pub evidence: EvidenceGate,
    pub approval: ApprovalGate,
    pub stuck: StuckConfig,
    pub rate_limit: RateLimitPolicy,
    pub delegation: BTreeMap<Role, DelegationPolicy>,
    pub scripted: ScriptedConfig,
    /// Bound on in-memory output kept per process (logs are never truncated).
    pub output_limit_bytes: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            spec_file: String::new(),
            roles: vec![Role::Planner, Role::Implementer, Role::Tester, Role::Reviewer],
            completion_promise: "SUPERLOOP_COMPLETE".to_string(),
            max_iterations: 20,
            runner: String::new(),
            role_runners: BTreeMap::new(),
            timeouts: TimeoutConfig::default(),
            tests: TestsGate::default(),
            validation: ValidationGate::default(),
            checklist: ChecklistGate::default(),
            evidence: EvidenceGate::default(),
            approval: ApprovalGate::default(),
            stuck: StuckConfig::default(),
            rate_limit: RateLimitPolicy::default(),
            delegation: BTreeMap::new(),
            scripted: ScriptedConfig::default(),
            output_limit_bytes: 200_000,
        }
    }
}

impl LoopConfig {
    pub fn runner_for(&self, role: Role) -> &str {
        self.role_runners
            .get(&role)
            .map(String::as_str)
            .unwrap_or(&self.runner)
    }

    /// Enabled delegation policy for roles that may delegate.
    pub fn delegation_for(&self, role: Role) -> Option<&DelegationPolicy> {
        if !role.capabilities().can_delegate {
            return None;
        }
        self.delegation.get(&role).filter(|p| p.enabled)
    }

    /// Tests never run, validation is off and a checklist drives completion.
    pub fn is_checklist_only(&self) -> bool {
        self.tests.mode == GateMode::Never
            && !self.validation.enabled
            && !self.checklist.patterns.is_empty()
    }

    fn validate(&self, runners: &BTreeMap<String, RunnerSpec>) -> Result<()> {
        let id = &self.id;
        if !is_valid_loop_id(id) {
            bail!("loop id {id:?} must be non-empty and use only [A-Za-z0-9_-]");
        }
        if self.spec_file.trim().is_empty() {
            bail!("loops.{id}.spec_file must be set");
        }
        if self.roles.is_empty() {
            bail!("loops.{id}.roles must not be empty");
        }
        if self.completion_promise.trim().is_empty() {
            bail!("loops.{id}.completion_promise must not be empty");
        }
        if self.max_iterations == 0 {
            bail!("loops.{id}.max_iterations must be > 0");
        }
        if self.output_limit_bytes == 0 {
            bail!("loops.{id}.output_limit_bytes must be > 0");
        }
        for role in &self.roles {
            let runner = self.runner_for(*role);
            if runner.is_empty() {
                bail!("loops.{id}: role {role} has no runner (set `runner` or `role_runners.{role}`)");
            }
            if !runners.contains_key(runner) {
                bail!("loops.{id}: role {role} references unknown runner {runner:?}");
            }
        }
        self.timeouts.validate(id)?;
        if self.tests.timeout_secs == 0 || self.validation.timeout_secs == 0 {
            bail!("loops.{id}: gate timeout_secs must be > 0");
        }
        if self.evidence.required && self.evidence.artifacts.is_empty() {
            bail!("loops.{id}.evidence.artifacts must not be empty when evidence is required");
        }
        if self.stuck.threshold > 0
            && self.stuck.no_progress_threshold > 0
            && self.stuck.no_progress_threshold >= self.stuck.threshold
        {
            bail!(
                "loops.{id}.stuck.no_progress_threshold ({}) must be below stuck.threshold ({})",
                self.stuck.no_progress_threshold,
                self.stuck.threshold
            );
        }
        for pattern in self.stuck.ignore.iter().chain(&self.checklist.patterns) {
            glob::Pattern::new(pattern)
                .with_context(|| format!("loops.{id}: invalid glob pattern {pattern:?}"))?;
        }
        for (role, policy) in &self.delegation {
            if !role.capabilities().can_delegate {
                bail!("loops.{id}.delegation.{role}: role {role} cannot delegate");
            }
            policy
                .validate()
                .with_context(|| format!("loops.{id}.delegation.{role}"))?;
        }
        if self.roles.contains(&Role::Scripted) {
            if self.scripted.sessions.is_empty() {
                bail!("loops.{id}.scripted.sessions must not be empty when the scripted role is enabled");
            }
            for session in &self.scripted.sessions {
                if !runners.contains_key(&session.runner) {
                    bail!(
                        "loops.{id}.scripted: unknown runner {:?}",
                        session.runner
                    );
                }
            }
        }
        Ok(())
    }
}

fn is_valid_loop_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Absolute and inactivity deadlines, with per-role overrides keyed by role name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    pub inactivity_secs: u64,
    pub roles: BTreeMap<String, RoleTimeout>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RoleTimeout {
    pub max_secs: Option<u64>,
    pub inactivity_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 30 * 60,
            inactivity_secs: 10 * 60,
            roles: BTreeMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// `(max_timeout, inactivity_timeout)` for a role.
    pub fn for_role(&self, role: Role) -> (Duration, Duration) {
        let key = role.capabilities().timeout_key;
        let overrides = self.roles.get(key);
        let max = overrides
            .and_then(|o| o.max_secs)
            .unwrap_or(self.default_secs);
        let idle = overrides
            .and_then(|o| o.inactivity_secs)
            .unwrap_or(self.inactivity_secs);
        (Duration::from_secs(max), Duration::from_secs(idle))
    }

    fn validate(&self, loop_id: &str) -> Result<()> {
        if self.default_secs == 0 || self.inactivity_secs == 0 {
            bail!("loops.{loop_id}.timeouts must be > 0");
        }
        for (key, timeout) in &self.roles {
            if !Role::CANONICAL_ORDER
                .iter()
                .any(|r| r.capabilities().timeout_key == key)
            {
                bail!("loops.{loop_id}.timeouts.roles: unknown role {key:?}");
            }
            if timeout.max_secs == Some(0) || timeout.inactivity_secs == Some(0) {
                bail!("loops.{loop_id}.timeouts.roles.{key} must be > 0");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsGate {
    pub mode: GateMode,
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for TestsGate {
    fn default() -> Self {
        Self {
            mode: GateMode::OnPromise,
            commands: Vec::new(),
            timeout_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationGate {
    pub enabled: bool,
    /// When false, validation results are recorded but never block completion.
    pub required: bool,
    pub mode: GateMode,
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self {
            enabled: false,
            required: true,
            mode: GateMode::OnPromise,
            commands: Vec::new(),
            timeout_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ChecklistGate {
    /// Glob patterns (relative to the repo root) of markdown files to scan.
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EvidenceGate {
    pub required: bool,
    /// Glob patterns; each must match at least one file.
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ApprovalGate {
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StuckConfig {
    /// 0 disables stuck detection.
    pub threshold: u32,
    /// 0 disables the no-progress rule.
    pub no_progress_threshold: u32,
    /// Globs excluded from the code signature.
    pub ignore: Vec<String>,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            no_progress_threshold: 2,
            ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub max_total_wait_secs: u64,
    /// Trailing lines captured after a rate-limit line.
    pub context_lines: usize,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 60,
            backoff_max_secs: 15 * 60,
            max_total_wait_secs: 60 * 60,
            context_lines: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ScriptedConfig {
    pub sessions: Vec<ScriptedSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ScriptedSession {
    pub runner: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    #[default]
    Standard,
    /// Children must leave the working tree untouched.
    Reconnaissance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum WakePolicy {
    #[default]
    OnWaveComplete,
    /// Parent is woken for an adaptation pass after every child completion.
    OnChildComplete,
}

impl WakePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            WakePolicy::OnWaveComplete => "on_wave_complete",
            WakePolicy::OnChildComplete => "on_child_complete",
        }
    }
}

impl FromStr for WakePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "on_wave_complete" => Ok(WakePolicy::OnWaveComplete),
            "on_child_complete" => Ok(WakePolicy::OnChildComplete),
            "after_all" => {
                warn!("wake_policy \"after_all\" is deprecated; use \"on_wave_complete\"");
                Ok(WakePolicy::OnWaveComplete)
            }
            "immediate" => {
                warn!("wake_policy \"immediate\" is deprecated; use \"on_child_complete\"");
                Ok(WakePolicy::OnChildComplete)
            }
            other => Err(format!("unknown wake_policy {other:?}")),
        }
    }
}

impl TryFrom<String> for WakePolicy {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl fmt::Display for WakePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    WarnAndContinue,
    /// Halt new dispatch at the first failed child and fail the role.
    FailRole,
}

/// Per-role delegation policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DelegationPolicy {
    pub enabled: bool,
    pub mode: DelegationMode,
    pub dispatch_mode: DispatchMode,
    pub max_children: usize,
    pub max_parallel: usize,
    pub max_waves: usize,
    pub wake_policy: WakePolicy,
    pub failure_policy: FailurePolicy,
    pub retry_limit: u32,
    pub retry_backoff_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub child_timeout_secs: u64,
    pub child_inactivity_secs: u64,
    pub max_adaptations_per_wave: u32,
    pub max_adaptations_per_iteration: u32,
    pub adaptation_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: DelegationMode::Standard,
            dispatch_mode: DispatchMode::Serial,
            max_children: 4,
            max_parallel: 2,
            max_waves: 3,
            wake_policy: WakePolicy::OnWaveComplete,
            failure_policy: FailurePolicy::WarnAndContinue,
            retry_limit: 1,
            retry_backoff_secs: 5,
            retry_backoff_max_secs: 60,
            child_timeout_secs: 15 * 60,
            child_inactivity_secs: 5 * 60,
            max_adaptations_per_wave: 2,
            max_adaptations_per_iteration: 4,
            adaptation_timeout_secs: 5 * 60,
            handshake_timeout_secs: 5 * 60,
        }
    }
}

impl DelegationPolicy {
    /// Worker count: 1 for serial dispatch.
    pub fn parallelism(&self) -> usize {
        match self.dispatch_mode {
            DispatchMode::Serial => 1,
            DispatchMode::Parallel => self.max_parallel.max(1),
        }
    }

    pub fn child_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.child_timeout_secs),
            Duration::from_secs(self.child_inactivity_secs),
        )
    }

    fn validate(&self) -> Result<()> {
        if self.max_children == 0 || self.max_waves == 0 || self.max_parallel == 0 {
            bail!("max_children, max_waves and max_parallel must be > 0");
        }
        if self.max_parallel > self.max_children {
            bail!(
                "max_parallel ({}) must not exceed max_children ({})",
                self.max_parallel,
                self.max_children
            );
        }
        if self.child_timeout_secs == 0
            || self.child_inactivity_secs == 0
            || self.adaptation_timeout_secs == 0
            || self.handshake_timeout_secs == 0
        {
            bail!("delegation timeouts must be > 0");
        }
        Ok(())
    }
}

impl SuperloopConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, runner) in &self.runners {
            runner.validate(name)?;
        }
        let mut seen = HashSet::new();
        for lp in &self.loops {
            if !seen.insert(lp.id.as_str()) {
                bail!("duplicate loop id {:?}", lp.id);
            }
            lp.validate(&self.runners)?;
        }
        Ok(())
    }

    pub fn find_loop(&self, loop_id: &str) -> Result<&LoopConfig> {
        self.loops
            .iter()
            .find(|lp| lp.id == loop_id)
            .ok_or_else(|| anyhow!("unknown loop {loop_id:?}"))
    }

    pub fn runner(&self, name: &str) -> Result<&RunnerSpec> {
        self.runners
            .get(name)
            .ok_or_else(|| anyhow!("unknown runner {name:?}"))
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<SuperloopConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read {} (run `superloop init` first?)", path.display()))?;
    parse_config(&contents).with_context(|| format!("load {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<SuperloopConfig> {
    let document: serde_json::Value = toml::from_str(contents).context("parse config toml")?;
    validate_schema(&document)?;
    let cfg: SuperloopConfig = toml::from_str(contents).context("decode config")?;
    cfg.validate()?;
    Ok(cfg)
}

fn validate_schema(document: &serde_json::Value) -> Result<()> {
    let validator = jsonschema::options()
        .with_draft(jsonschema::Draft::Draft202012)
        .build(&CONFIG_SCHEMA_VALUE)
        .context("compile config schema")?;
    let messages: Vec<String> = validator
        .iter_errors(document)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "config schema validation failed:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SuperloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fsutil::write_atomic(path, buf.as_bytes())
}
