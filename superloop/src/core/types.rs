//! Shared deterministic types for loop orchestration.
//!
//! These types define stable contracts between the controller, the delegation
//! scheduler and the persisted artifacts. They must not depend on external
//! state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed role taxonomy. Declaration order is the canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Implementer,
    Tester,
    Reviewer,
    /// Optional multi-session role driven by configured scripts.
    Scripted,
}

/// Static capability table entry for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCapabilities {
    /// Role may author a delegation request before its main execution.
    pub can_delegate: bool,
    /// Role owns a canonical report file protected by the report guard.
    pub has_canonical_report: bool,
    /// Key into the loop's `timeouts` table.
    pub timeout_key: &'static str,
    /// Role's last message is eligible for promise extraction.
    pub emits_promise: bool,
}

impl Role {
    pub const CANONICAL_ORDER: [Role; 5] = [
        Role::Planner,
        Role::Implementer,
        Role::Tester,
        Role::Reviewer,
        Role::Scripted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Implementer => "implementer",
            Role::Tester => "tester",
            Role::Reviewer => "reviewer",
            Role::Scripted => "scripted",
        }
    }

    pub fn capabilities(self) -> RoleCapabilities {
        match self {
            Role::Planner => RoleCapabilities {
                can_delegate: true,
                has_canonical_report: true,
                timeout_key: "planner",
                emits_promise: true,
            },
            Role::Implementer => RoleCapabilities {
                can_delegate: true,
                has_canonical_report: true,
                timeout_key: "implementer",
                emits_promise: true,
            },
            Role::Tester => RoleCapabilities {
                can_delegate: false,
                has_canonical_report: true,
                timeout_key: "tester",
                emits_promise: true,
            },
            Role::Reviewer => RoleCapabilities {
                can_delegate: false,
                has_canonical_report: true,
                timeout_key: "reviewer",
                emits_promise: true,
            },
            Role::Scripted => RoleCapabilities {
                can_delegate: false,
                has_canonical_report: false,
                timeout_key: "scripted",
                emits_promise: false,
            },
        }
    }

    /// Canonical report file name (relative to the loop directory).
    pub fn report_file(self) -> Option<&'static str> {
        if !self.capabilities().has_canonical_report {
            return None;
        }
        match self {
            Role::Planner => Some("plan.md"),
            Role::Implementer => Some("implementer.md"),
            Role::Tester => Some("test-report.md"),
            Role::Reviewer => Some("review.md"),
            Role::Scripted => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplicate and order roles canonically regardless of configured order.
pub fn canonical_roles(roles: &[Role]) -> Vec<Role> {
    let mut ordered: Vec<Role> = roles.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

/// Last role in the sequence whose message is checked for the promise.
pub fn promise_role(roles: &[Role]) -> Option<Role> {
    canonical_roles(roles)
        .into_iter()
        .rev()
        .find(|role| role.capabilities().emits_promise)
}

/// When a command-backed gate (tests, validation) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Always,
    /// Only when the promise matched or the checklist is complete.
    #[default]
    OnPromise,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Tests,
    Checklist,
    Validation,
    Evidence,
    Approval,
    Stuck,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Tests => "tests",
            GateKind::Checklist => "checklist",
            GateKind::Validation => "validation",
            GateKind::Evidence => "evidence",
            GateKind::Approval => "approval",
            GateKind::Stuck => "stuck",
        }
    }
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub gate: GateKind,
    pub ok: bool,
    /// Gate was not evaluated this iteration (mode or toggle).
    pub skipped: bool,
    pub detail: String,
}

impl GateStatus {
    pub fn passed(gate: GateKind, detail: impl Into<String>) -> Self {
        Self {
            gate,
            ok: true,
            skipped: false,
            detail: detail.into(),
        }
    }

    pub fn failed(gate: GateKind, detail: impl Into<String>) -> Self {
        Self {
            gate,
            ok: false,
            skipped: false,
            detail: detail.into(),
        }
    }

    pub fn skipped(gate: GateKind, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            gate,
            ok,
            skipped: true,
            detail: detail.into(),
        }
    }
}

/// Terminal state of a delegated child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    Completed,
    Failed,
    TimedOut,
    /// Never launched because dispatch was halted (fail_role or adaptation abort).
    Cancelled,
    /// Reconnaissance child mutated the working tree.
    PolicyViolation,
    /// Dropped before dispatch (caps, empty prompt).
    Skipped,
}

impl ChildState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChildState::Completed => "completed",
            ChildState::Failed => "failed",
            ChildState::TimedOut => "timed_out",
            ChildState::Cancelled => "cancelled",
            ChildState::PolicyViolation => "policy_violation",
            ChildState::Skipped => "skipped",
        }
    }

    /// Counts toward the `failed` aggregate and triggers `fail_role`.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ChildState::Failed | ChildState::TimedOut | ChildState::PolicyViolation
        )
    }
}

/// Which deadline terminated an agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    MaxTimeout,
    Inactivity,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReason::MaxTimeout => f.write_str("max_timeout"),
            TimeoutReason::Inactivity => f.write_str("inactivity"),
        }
    }
}

/// Vendor resume strategy for rate-limited sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    /// Restart from scratch.
    #[default]
    None,
    /// Orchestrator mints a session id up front and injects it.
    SessionId,
    /// Thread id discovered after the fact from the tool's own transcripts.
    ThreadDiscovery,
}

/// Opaque handle used to continue an interrupted agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResumeHint {
    SessionId(String),
    ThreadId(String),
}

impl ResumeHint {
    pub fn id(&self) -> &str {
        match self {
            ResumeHint::SessionId(id) | ResumeHint::ThreadId(id) => id,
        }
    }
}

/// Why a loop run halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    Stuck,
    NoProgress,
    RoleFailed,
    RoleTimeout,
    RateLimit,
    DelegationFailed,
    Cancelled,
}

impl StopReason {
    pub fn code(self) -> &'static str {
        match self {
            StopReason::MaxIterations => "max_iterations",
            StopReason::Stuck => "stuck",
            StopReason::NoProgress => "no_progress",
            StopReason::RoleFailed => "role_failed",
            StopReason::RoleTimeout => "role_timeout",
            StopReason::RateLimit => "rate_limit",
            StopReason::DelegationFailed => "delegation_failed",
            StopReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A halted run: reason code plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStop {
    pub reason: StopReason,
    pub detail: String,
}

/// How one iteration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Complete,
    PendingApproval,
    Stopped(LoopStop),
    /// Gates unmet; advance to the next iteration.
    Continue,
}

/// Controller phase, recorded in the events log as transitions happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "role", rename_all = "snake_case")]
pub enum IterationPhase {
    RunningRole(Role),
    EvaluatingGates,
    PendingApproval,
    Complete,
    Stopped,
}

/// Approval request lifecycle (`none` is the absence of a record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}
