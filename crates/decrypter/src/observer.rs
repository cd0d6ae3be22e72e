//! Instrumentation hooks.
//!
//! The pool never talks to a metrics backend. Instead, a [`PoolObserver`] is
//! injected at construction and called at two boundaries:
//!
//! - **Submit**: [`PoolObserver::on_enqueue`] when an item enters the intake
//!   queue and [`PoolObserver::on_submit`] when the submitting call returns.
//! - **Completion**: [`PoolObserver::on_dequeue`] when a worker picks an item up
//!   and [`PoolObserver::on_verified`] once the verifier has produced a
//!   [`Verdict`].
//!
//! Every method has a no-op default, so implementors only override what they
//! record. Observers are called inline on the hot path and must not block.

use crate::{Verdict, error::Error};
use core::time::Duration;

pub trait PoolObserver: Send + Sync + 'static {
    /// An item was accepted by the intake queue. `queued` is the number of
    /// items waiting for a worker, including this one.
    fn on_enqueue(&self, _queued: usize) {}

    /// A worker took an item off the queue. `queued` is the number still
    /// waiting.
    fn on_dequeue(&self, _queued: usize) {}

    /// A worker finished running the verifier for one item.
    fn on_verified(&self, _verdict: &Verdict, _elapsed: Duration) {}

    /// A submission returned to its caller, successfully or not. `elapsed`
    /// covers queueing and verification.
    fn on_submit(&self, _result: &Result<Verdict, Error>, _elapsed: Duration) {}
}

/// Observer that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {}
