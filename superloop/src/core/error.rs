//! Orchestration error taxonomy.
//!
//! These errors travel inside `anyhow::Error` and are recovered with
//! `downcast_ref` by the loop driver to pick a stop reason. Gate failures are
//! not errors: they only prevent completion.

use thiserror::Error;

use crate::core::types::{ResumeHint, Role, StopReason, TimeoutReason};

#[derive(Debug, Error)]
pub enum LoopError {
    /// A role's own process exceeded its absolute or inactivity deadline.
    #[error("role {role} timed out ({reason})")]
    Timeout { role: Role, reason: TimeoutReason },

    /// Rate-limit retries exceeded the retry count or total wait ceiling.
    #[error("role {role} still rate limited after {attempts} attempts ({detail})")]
    RateLimitExhausted {
        role: Role,
        attempts: u32,
        detail: String,
        resume_hint: Option<ResumeHint>,
    },

    /// Unexpected non-zero exit from a role's own process.
    #[error("role {role} failed with exit code {exit_code:?}")]
    HardFailure { role: Role, exit_code: Option<i32> },

    /// A delegated child failed under the `fail_role` policy.
    #[error("delegation for role {role} failed: {detail}")]
    DelegationFailed { role: Role, detail: String },

    /// Another run holds the loop's active lock.
    #[error("loop '{loop_id}' is already running (use --force to clear a stale active lock)")]
    AlreadyRunning { loop_id: String },
}

impl LoopError {
    /// Stop reason for errors that halt a run; `None` for entry errors.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            LoopError::Timeout { .. } => Some(StopReason::RoleTimeout),
            LoopError::RateLimitExhausted { .. } => Some(StopReason::RateLimit),
            LoopError::HardFailure { .. } => Some(StopReason::RoleFailed),
            LoopError::DelegationFailed { .. } => Some(StopReason::DelegationFailed),
            LoopError::AlreadyRunning { .. } => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            LoopError::Timeout { role, .. }
            | LoopError::RateLimitExhausted { role, .. }
            | LoopError::HardFailure { role, .. }
            | LoopError::DelegationFailed { role, .. } => Some(*role),
            LoopError::AlreadyRunning { .. } => None,
        }
    }
}
