//! Stuck and no-progress tracking over progress signatures.
//!
//! Signatures are computed by `io::signature`; this module only compares them.

use serde::{Deserialize, Serialize};

/// Content-addressed snapshot of repository and test state for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressSignature {
    pub code: String,
    /// Empty when the last test output had no failure lines.
    pub test_failures: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StuckState {
    pub last: Option<ProgressSignature>,
    pub streak: u32,
}

/// Compute the next stuck streak.
///
/// The streak grows when the code signature is unchanged, or when the
/// test-failure signature is unchanged and non-empty. Anything else resets
/// it to 1. The first observation is 1.
pub fn next_streak(
    prev: Option<&ProgressSignature>,
    prev_streak: u32,
    current: &ProgressSignature,
) -> u32 {
    let Some(prev) = prev else {
        return 1;
    };
    let code_same = prev.code == current.code;
    let failures_same =
        !current.test_failures.is_empty() && prev.test_failures == current.test_failures;
    if code_same || failures_same {
        prev_streak.max(1) + 1
    } else {
        1
    }
}

pub fn update_stuck_state(prev: &StuckState, current: ProgressSignature) -> StuckState {
    let streak = next_streak(prev.last.as_ref(), prev.streak, &current);
    StuckState {
        last: Some(current),
        streak,
    }
}

/// A threshold of 0 disables stuck detection.
pub fn is_stuck(state: &StuckState, threshold: u32) -> bool {
    threshold > 0 && state.streak >= threshold
}

/// Remainder tracking for checklist-only loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NoProgressState {
    pub last_remaining: Option<u32>,
    pub last_code: Option<String>,
    pub streak: u32,
}

/// Count consecutive iterations where both the checklist remainder and the
/// code signature stayed the same while work remained.
pub fn update_no_progress(prev: &NoProgressState, remaining: u32, code: &str) -> NoProgressState {
    let stable = remaining > 0
        && prev.last_remaining == Some(remaining)
        && prev.last_code.as_deref() == Some(code);
    NoProgressState {
        last_remaining: Some(remaining),
        last_code: Some(code.to_string()),
        streak: if stable { prev.streak.max(1) + 1 } else { 1 },
    }
}

/// No-progress fires at its own threshold, which sits below the stuck threshold.
pub fn is_no_progress(state: &NoProgressState, threshold: u32) -> bool {
    threshold > 1 && state.last_remaining.unwrap_or(0) > 0 && state.streak >= threshold
}
