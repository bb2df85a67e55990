//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod completion;
pub mod delegation_plan;
pub mod error;
pub mod promise;
pub mod stuck;
pub mod types;
