//! Diagnostic tracing on stderr.
//!
//! Tracing is for whoever is watching a run. The durable record of a loop
//! lives in its artifacts (`events.jsonl`, `run-summary.json`, `timeline.md`
//! and the per-iteration directories), which are written regardless of the
//! filter chosen here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "SUPERLOOP_LOG";

const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber.
///
/// `SUPERLOOP_LOG` wins over `RUST_LOG`; both take `EnvFilter` directives,
/// e.g. `SUPERLOOP_LOG=superloop::delegation=debug superloop run --loop main`.
/// Invalid directives fall back to `warn`.
pub fn init() {
    let filter = filter_from(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok());
    // Tests and embedders may have installed a subscriber already.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

fn filter_from(superloop: Option<String>, rust_log: Option<String>) -> EnvFilter {
    superloop
        .into_iter()
        .chain(rust_log)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .find_map(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}
