//! Superloop: a resumable orchestrator that drives AI coding agents through
//! planner → implementer → tester → reviewer iterations until a loop's gates
//! pass.
//!
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (role taxonomy, stuck tracking,
//!   completion decision, delegation normalization). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem layout, config, agent
//!   processes, gates, persisted artifacts). Isolated behind traits so tests
//!   can script them.
//!
//! Orchestration modules ([`delegation`], [`iteration`], [`looping`],
//! [`status`]) combine the two to implement the CLI commands.

pub mod core;
pub mod delegation;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
