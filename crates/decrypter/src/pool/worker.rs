use super::request::{Counters, WorkItem};
use crate::{PoolObserver, Verdict, Verifier, VerifyError};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinError,
};
use tokio_util::sync::CancellationToken;

/// State shared by every worker of one pool.
pub(crate) struct Shared {
    /// The single intake queue. Whichever idle worker holds the lock is the
    /// one waiting on `recv`; the others queue up behind it on the mutex.
    pub(crate) intake: Mutex<mpsc::Receiver<WorkItem>>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) observer: Arc<dyn PoolObserver>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) shutdown_token: CancellationToken,
}

/// Long-lived worker task: `Idle -> Servicing -> Idle` until shut down.
///
/// While idle the worker waits on the shared intake queue. Each dequeued
/// [`WorkItem`] is serviced to completion before the next one is taken, so a
/// worker never holds more than one item.
///
/// The loop exits when:
/// - the pool's shutdown token is cancelled (checked between items, never
///   mid-verification),
/// - every sender of the intake queue has been dropped and the queue is
///   empty.
///
/// # Arguments
///
/// - `worker_id`: Index of this worker (used for logs/tracing).
/// - `shared`: Queue, verifier and observer shared with the rest of the pool.
pub(crate) async fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    loop {
        let work = {
            let mut intake = tokio::select! {
                biased;
                () = shared.shutdown_token.cancelled() => break,
                intake = shared.intake.lock() => intake,
            };
            tokio::select! {
                biased;
                () = shared.shutdown_token.cancelled() => break,
                work = intake.recv() => work,
            }
        };

        match work {
            Some(item) => service(worker_id, &shared, item).await,
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} intake closed");
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}

/// Runs the verifier for one item and writes the verdict to its result slot.
///
/// The verifier runs on Tokio's blocking thread pool so that CPU-bound hashing
/// does not stall the async workers. A panic inside the verifier is caught at
/// the task boundary and turned into [`VerifyError::Panicked`]; observer hooks
/// are run through [`notify`]. Either way the worker itself keeps running.
async fn service(worker_id: usize, shared: &Shared, item: WorkItem) {
    let WorkItem {
        credentials,
        result,
        _pending,
    } = item;

    let queued = shared.counters.queued().saturating_sub(1);
    notify(|| shared.observer.on_dequeue(queued));

    // The submitter gave up (deadline, cancellation, dropped future) before we
    // got here. Nobody will read the verdict.
    if result.is_closed() {
        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {worker_id} discarding abandoned item");
        return;
    }

    shared.counters.begin_service();
    let start = Instant::now();
    let verifier = Arc::clone(&shared.verifier);
    let joined = tokio::task::spawn_blocking(move || {
        verifier.verify(credentials.stored_hash(), credentials.candidate())
    })
    .await;

    let verdict = verdict_from_join(worker_id, joined);
    let elapsed = start.elapsed();
    // Leave service before releasing the pending slot so `queued` never dips
    // below the number of items actually waiting.
    shared.counters.end_service();
    drop(_pending);
    notify(|| shared.observer.on_verified(&verdict, elapsed));

    // Best effort: the caller may have timed out while we were hashing.
    if result.send(verdict).is_err() {
        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {worker_id} result dropped, caller went away");
    }
}

fn verdict_from_join(
    _worker_id: usize,
    joined: Result<Result<bool, VerifyError>, JoinError>,
) -> Verdict {
    match joined {
        Ok(res) => Verdict::from(res),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {_worker_id} contained verifier panic: {message}");
            Verdict::Unverifiable(VerifyError::Panicked { message })
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {_worker_id} verification aborted: {_e}");
            Verdict::Unverifiable(VerifyError::Aborted)
        }
    }
}

/// Runs an observer hook, swallowing any panic it raises.
///
/// Hooks run inline on workers and submitters; a faulty observer must not take
/// either down with it.
pub(crate) fn notify(hook: impl FnOnce()) {
    if let Err(_payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
        #[cfg(feature = "tracing")]
        tracing::error!("Pool observer panicked: {}", panic_message(_payload));
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
