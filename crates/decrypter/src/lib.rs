#![doc = include_str!("../README.md")]

mod credentials;
mod error;
mod observer;
mod pool;
mod verifier;

pub use credentials::Credentials;
pub use error::{Error, MalformedHashKind, Result, VerifyError};
pub use observer::{NoopObserver, PoolObserver};
pub use pool::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_TIMEOUT, PoolBuilder, PoolStats, VerifierPool,
};
pub use verifier::{BcryptVerifier, Verdict, Verifier};
// Re-exported so callers can build tokens for `VerifierPool::check_until`
// without depending on `tokio-util` themselves.
pub use tokio_util::sync::CancellationToken;
