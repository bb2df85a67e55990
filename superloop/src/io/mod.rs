//! Side-effecting adapters: filesystem layout, config, processes, git and
//! the persisted loop artifacts.

pub mod agent;
pub mod approval;
pub mod config;
pub mod events;
pub mod fsutil;
pub mod gates;
pub mod git;
pub mod init;
pub mod process;
pub mod prompt;
pub mod rate_limit;
pub mod report_guard;
pub mod run_state;
pub mod signature;
pub mod transcript;
