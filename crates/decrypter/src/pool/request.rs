//! Work items passed from submitters to workers.

use crate::{Credentials, Verdict};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::oneshot;

/// One unit of verification work and the slot its answer is written to.
///
/// The submitter keeps the receiving half of `result` and reads it once; the
/// worker that dequeues the item writes to it at most once. The `_pending`
/// guard keeps the item counted until the item itself is dropped, wherever
/// that happens (serviced, discarded, or flushed on shutdown).
pub(crate) struct WorkItem {
    pub(crate) credentials: Credentials,
    pub(crate) result: oneshot::Sender<Verdict>,
    pub(crate) _pending: PendingGuard,
}

impl WorkItem {
    pub(crate) fn new(
        credentials: Credentials,
        counters: &Arc<Counters>,
    ) -> (Self, oneshot::Receiver<Verdict>) {
        let (tx, rx) = oneshot::channel();
        let item = Self {
            credentials,
            result: tx,
            _pending: PendingGuard::acquire(counters),
        };
        (item, rx)
    }
}

/// Live item counts shared between the pool handle and its workers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    /// Items created by a submitter and not yet dropped.
    pending: AtomicUsize,
    /// Items currently inside the verifier.
    busy: AtomicUsize,
}

impl Counters {
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Items waiting for a worker, including submitters still blocked on a
    /// full intake queue.
    pub(crate) fn queued(&self) -> usize {
        self.pending().saturating_sub(self.busy())
    }

    pub(crate) fn begin_service(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_service(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts an item as pending for as long as the guard lives.
pub(crate) struct PendingGuard(Arc<Counters>);

impl PendingGuard {
    fn acquire(counters: &Arc<Counters>) -> Self {
        counters.pending.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counters))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
