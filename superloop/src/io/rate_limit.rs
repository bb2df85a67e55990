//! Rate-limit retry loop around an `AgentRunner`.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::backoff::exponential_backoff;
use crate::io::agent::{AgentInvocation, AgentRequest, AgentRunner};
use crate::io::config::RateLimitPolicy;

/// Outcome of an invocation with rate-limit retries applied.
#[derive(Debug, Clone)]
pub struct RetriedInvocation {
    /// Final invocation; still rate limited when `exhausted` is set.
    pub invocation: AgentInvocation,
    /// Rate-limited attempts observed.
    pub rate_limited_attempts: u32,
    pub total_wait: Duration,
    /// Why retries stopped while still rate limited.
    pub exhausted: Option<String>,
}

/// Callback invoked before each backoff sleep: `(attempt, wait, invocation)`.
pub type RetryObserver<'a> = &'a dyn Fn(u32, Duration, &AgentInvocation);

/// Invoke, retrying rate-limited attempts with backoff.
///
/// Each retry resumes through the latest resume hint when the vendor produced
/// one, and restarts the prompt from scratch otherwise. The wait for an
/// attempt is the larger of the exponential backoff and the parsed reset wait,
/// capped at `backoff_max_secs`.
pub fn invoke_with_rate_limit_retries<R: AgentRunner + ?Sized>(
    runner: &R,
    request: &AgentRequest,
    policy: &RateLimitPolicy,
    observer: Option<RetryObserver<'_>>,
) -> Result<RetriedInvocation> {
    let base = Duration::from_secs(policy.backoff_base_secs);
    let cap = Duration::from_secs(policy.backoff_max_secs);
    let ceiling = Duration::from_secs(policy.max_total_wait_secs);

    let mut req = request.clone();
    let mut attempts = 0u32;
    let mut total_wait = Duration::ZERO;

    loop {
        let invocation = runner.invoke(&req)?;
        let Some(hit) = invocation.rate_limit.clone() else {
            if attempts > 0 {
                info!(label = %req.label, attempts, "recovered from rate limit");
            }
            return Ok(RetriedInvocation {
                invocation,
                rate_limited_attempts: attempts,
                total_wait,
                exhausted: None,
            });
        };
        attempts += 1;

        if attempts > policy.max_retries {
            let detail = format!("max_retries ({}) reached: {}", policy.max_retries, hit.message);
            warn!(label = %req.label, attempts, "rate limit retries exhausted");
            return Ok(RetriedInvocation {
                invocation,
                rate_limited_attempts: attempts,
                total_wait,
                exhausted: Some(detail),
            });
        }

        let backoff = exponential_backoff(attempts, base, cap);
        let wait = hit
            .retry_after
            .map_or(backoff, |after| after.max(backoff))
            .min(cap.max(backoff));
        if total_wait.saturating_add(wait) > ceiling {
            let detail = format!(
                "next wait {}s would exceed max_total_wait_secs ({}): {}",
                wait.as_secs(),
                policy.max_total_wait_secs,
                hit.message
            );
            warn!(label = %req.label, attempts, "rate limit wait ceiling reached");
            return Ok(RetriedInvocation {
                invocation,
                rate_limited_attempts: attempts,
                total_wait,
                exhausted: Some(detail),
            });
        }

        if let Some(observe) = observer {
            observe(attempts, wait, &invocation);
        }
        warn!(
            label = %req.label,
            attempt = attempts,
            wait_secs = wait.as_secs(),
            reset = ?hit.reset_hint,
            resume = invocation.resume_hint.is_some(),
            "rate limited, backing off"
        );
        thread::sleep(wait);
        total_wait += wait;

        req.resume = invocation.resume_hint.clone().or(req.resume);
    }
}
