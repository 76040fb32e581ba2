//! Semantic error kinds used to decide exit codes and cleanup policy.
//!
//! Errors travel as `anyhow::Error`; a [`TmtError`] anywhere in the context
//! chain classifies the failure. Anything unclassified is `General`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid metadata, unknown `how`, missing required configuration.
    Specification,
    /// Legacy-format parsing failed.
    Convert,
    /// A guest could not be obtained.
    Provision,
    /// A prepare (or finish) phase failed.
    Prepare,
    /// Test execution infrastructure failed (not a failing test).
    Execute,
    /// A report sink failed.
    Report,
    /// I/O or unexpected subprocess failure.
    General,
    /// A terminating signal was received.
    Interrupted,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct TmtError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TmtError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Shorthand for a specification error wrapped in `anyhow`.
pub fn specification(message: impl Into<String>) -> anyhow::Error {
    TmtError::new(ErrorKind::Specification, message).into()
}

/// Shorthand for an interruption error wrapped in `anyhow`.
pub fn interrupted() -> anyhow::Error {
    TmtError::new(ErrorKind::Interrupted, "interrupted by signal").into()
}

/// Attach a kind to an existing error unless it is already classified.
pub fn classify(err: anyhow::Error, kind: ErrorKind) -> anyhow::Error {
    if kind_of(&err) != ErrorKind::General {
        return err;
    }
    let message = format!("{err:#}");
    err.context(TmtError::new(kind, message))
}

/// Find the kind of an error by searching its whole chain.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    if let Some(tmt) = err.downcast_ref::<TmtError>() {
        return tmt.kind;
    }
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TmtError>())
        .map(|tmt| tmt.kind)
        .unwrap_or(ErrorKind::General)
}
