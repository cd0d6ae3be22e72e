//! Error types for the verification pool.
//!
//! Two layers of failure are kept apart:
//!
//! - [`Error`] describes why a submission could not be answered at all (the
//!   pool is closed, the caller gave up, the pool was misconfigured).
//! - [`VerifyError`] describes why a single credential pair could not be
//!   verified (malformed stored hash, a verifier that panicked or was
//!   aborted). It never escapes as an [`Error`]; it travels inside
//!   [`Verdict::Unverifiable`](crate::Verdict::Unverifiable).
//!
//! ## Error Cases
//! - `InvalidWorkerCount`: The pool was built with zero workers.
//! - `InvalidConfig`: Some other construction parameter was out of range.
//! - `NoRuntime`: The pool was built outside of a Tokio runtime.
//! - `PoolClosed`: The pool is shutting down or already stopped.
//! - `Cancelled`: The caller's cancellation token fired before a result.
//! - `DeadlineExceeded`: The caller's deadline elapsed before a result.
//! - `ChannelError`: An internal channel failed unexpectedly.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for pool construction and submission.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The pool needs at least one worker.
    #[error("Worker count must be at least 1 (got {0})")]
    InvalidWorkerCount(usize),

    /// A construction parameter was rejected.
    #[error("Invalid pool configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Workers are Tokio tasks; there was no runtime to spawn them on.
    #[error("No Tokio runtime available to spawn workers")]
    NoRuntime,

    /// The pool no longer accepts or answers submissions.
    #[error("Verifier pool is closed")]
    PoolClosed,

    /// The submission was cancelled by the caller.
    #[error("Verification cancelled by caller")]
    Cancelled,

    /// The submission did not complete within the caller's deadline.
    #[error("Verification did not complete within {0:?}")]
    DeadlineExceeded(Duration),

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

/// Why a stored hash could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MalformedHashKind {
    /// The stored hash is not valid UTF-8.
    Encoding,
    /// Unknown or missing algorithm prefix (e.g. not `$2a$`/`$2b$`/`$2y$`).
    Prefix,
    /// The cost field is missing, unparseable or out of range.
    Cost,
    /// The hash has the wrong overall length or layout.
    Length,
    /// The salt or digest is not valid bcrypt base64.
    Salt,
    /// Any other parse failure reported by the hashing backend.
    Other,
}

impl core::fmt::Display for MalformedHashKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self {
            Self::Encoding => "encoding",
            Self::Prefix => "prefix",
            Self::Cost => "cost",
            Self::Length => "length",
            Self::Salt => "salt",
            Self::Other => "other",
        };
        f.write_str(kind)
    }
}

/// A single verification could not produce a match/mismatch answer.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Malformed stored hash ({0})")]
    MalformedHash(MalformedHashKind),

    /// The verifier panicked; the worker survived and kept serving.
    #[error("Verifier panicked: {message}")]
    Panicked { message: String },

    /// The verification task was cancelled before it finished, e.g. because
    /// the runtime is shutting down.
    #[error("Verification aborted")]
    Aborted,
}
