//! Stable exit codes for superloop CLI commands.

/// Command succeeded, or the loop completed.
pub const OK: i32 = 0;
/// Invalid config, unknown loop, loop already running, or any other error.
pub const INVALID: i32 = 1;
/// `superloop run` ended with an approval request waiting for a human.
pub const PENDING_APPROVAL: i32 = 2;
/// `superloop run` stopped (stuck, max iterations, role failure, ...).
pub const STOPPED: i32 = 3;
