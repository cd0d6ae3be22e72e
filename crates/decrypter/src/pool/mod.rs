//! Bounded verification pool.
//!
//! ## Structure
//!
//! - [`manager`] - the [`VerifierPool`] handle and its [`PoolBuilder`].
//! - `worker` - the worker loop servicing the shared intake queue.
//! - `request` - work items and the counters that track them.

pub mod manager;
mod request;
mod worker;

#[cfg(test)]
mod tests;

pub use manager::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_TIMEOUT, PoolBuilder, VerifierPool};

/// Snapshot of a pool's state returned by [`VerifierPool::stats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker count fixed at construction.
    pub workers: usize,
    /// Worker tasks that have not exited. Equals `workers` until shutdown.
    pub live_workers: usize,
    /// Items waiting for a worker.
    pub queued: usize,
    /// Items currently being verified.
    pub busy: usize,
}
