//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod duration;
pub mod environment;
pub mod filter;
pub mod ordering;
pub mod result;
pub mod step_name;
