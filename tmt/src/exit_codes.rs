//! Stable exit codes for `tmt` commands.

/// All tests passed (or the command succeeded).
pub const OK: i32 = 0;
/// At least one test failed (or warned).
pub const FAILED: i32 = 1;
/// Infrastructure or specification error, or a test result of `error`.
pub const ERROR: i32 = 2;
/// Interrupted by a signal.
pub const INTERRUPTED: i32 = 3;
