//! Retry backoff arithmetic shared by rate-limit and child retries.

use std::time::Duration;

/// Exponential backoff for the `attempt`-th retry (1-indexed): `base * 2^(attempt-1)`,
/// capped at `max`.
pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }
    let shift = (attempt - 1).min(16);
    base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
}
