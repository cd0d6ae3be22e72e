//! Credential verification.
//!
//! A [`Verifier`] compares a plaintext candidate against a stored hash. It is
//! the only CPU-heavy piece of the crate and is always invoked from a worker,
//! never from the submitting task.
//!
//! Malformed hashes are answered with [`VerifyError::MalformedHash`] rather
//! than a panic. [`Verdict`] is what callers get back from the pool.

use crate::error::{MalformedHashKind, VerifyError};

/// Compares a candidate against a stored hash.
///
/// Implementations must be pure: the same inputs always produce the same
/// answer, and no state is shared between calls. A verifier may be called
/// from several workers at once.
pub trait Verifier: Send + Sync + 'static {
    /// Returns `Ok(true)` iff `candidate` hashes to `stored_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedHash`] when `stored_hash` cannot be
    /// parsed.
    fn verify(&self, stored_hash: &[u8], candidate: &[u8]) -> Result<bool, VerifyError>;
}

impl<F> Verifier for F
where
    F: Fn(&[u8], &[u8]) -> Result<bool, VerifyError> + Send + Sync + 'static,
{
    fn verify(&self, stored_hash: &[u8], candidate: &[u8]) -> Result<bool, VerifyError> {
        self(stored_hash, candidate)
    }
}

/// The default [`Verifier`], backed by the `bcrypt` crate.
///
/// Accepts `$2a$`, `$2b$`, `$2x$` and `$2y$` hashes. Candidates longer than 72
/// bytes are truncated, which is how bcrypt has always behaved.
#[derive(Clone, Copy, Debug, Default)]
pub struct BcryptVerifier;

impl Verifier for BcryptVerifier {
    fn verify(&self, stored_hash: &[u8], candidate: &[u8]) -> Result<bool, VerifyError> {
        let hash = core::str::from_utf8(stored_hash)
            .map_err(|_| VerifyError::MalformedHash(MalformedHashKind::Encoding))?;

        bcrypt::verify(candidate, hash).map_err(|e| VerifyError::MalformedHash(classify(&e)))
    }
}

fn classify(err: &bcrypt::BcryptError) -> MalformedHashKind {
    use bcrypt::BcryptError;

    match err {
        BcryptError::InvalidPrefix(_) => MalformedHashKind::Prefix,
        BcryptError::InvalidCost(_) | BcryptError::CostNotAllowed(_) => MalformedHashKind::Cost,
        BcryptError::InvalidHash(_) => MalformedHashKind::Length,
        BcryptError::InvalidSaltLen(_) | BcryptError::InvalidBase64(_) => MalformedHashKind::Salt,
        _ => MalformedHashKind::Other,
    }
}

/// Outcome of a single verification as seen by the submitting caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The candidate hashes to the stored hash.
    Match,
    /// The candidate does not hash to the stored hash.
    Mismatch,
    /// No answer could be produced for this pair.
    Unverifiable(VerifyError),
}

impl Verdict {
    /// `true` only for [`Verdict::Match`]; unverifiable input is never a match.
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    /// Short, low-cardinality label suitable for metric attributes.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Match => "true",
            Self::Mismatch => "false",
            Self::Unverifiable(VerifyError::MalformedHash(_)) => "malformed",
            Self::Unverifiable(VerifyError::Panicked { .. }) => "panicked",
            Self::Unverifiable(VerifyError::Aborted) => "aborted",
        }
    }
}

impl From<Result<bool, VerifyError>> for Verdict {
    fn from(res: Result<bool, VerifyError>) -> Self {
        match res {
            Ok(true) => Self::Match,
            Ok(false) => Self::Mismatch,
            Err(e) => Self::Unverifiable(e),
        }
    }
}
