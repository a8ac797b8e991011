//! Error taxonomy for the dumper's public boundary.
//!
//! Internals (`Worker`, `Coordinator`, `Chunker`, ...) propagate
//! `anyhow::Result` the way the rest of this codebase does; `DumpError` exists
//! only at the `dump::run` boundary so a caller can match on the kind of
//! failure without downcasting.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DumpError {
    /// Bad output URL, conflicting options. Fails before `INIT`, no side effects.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing privilege, unsupported server version. Fails before `DUMPING`.
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// Neither the strong instance lock nor the table-level fallback could be acquired.
    #[error("could not acquire a consistent lock: {0}")]
    LockAcquisitionFailed(String),

    /// Unfixable compatibility issues were found for the requested target version.
    #[error("compatibility check failed: {0}")]
    CompatibilityError(String),

    /// The operator requested cancellation.
    #[error("dump cancelled")]
    Cancelled,

    /// A worker recorded an exception; this wraps the first one raised.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DumpError>;
