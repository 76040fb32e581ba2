//! Test management tool: plans from a metadata tree run through six steps.
//!
//! The crate keeps the same separation throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (durations, results, environment
//!   precedence, phase ordering, filters). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting helpers (processes, git, persistence, HTTP,
//!   workdirs, cancellation, user output).
//! - **[`fmf`]** reads the metadata tree, **[`guest`]** models execution
//!   targets, **[`steps`]** holds the six steps and their plugins.
//!
//! Orchestration modules ([`plan`], [`run`], [`metadata`]) coordinate steps
//! with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod fmf;
pub mod guest;
pub mod io;
pub mod logging;
pub mod metadata;
pub mod options;
pub mod plan;
pub mod run;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
