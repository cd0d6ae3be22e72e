//! The verifier pool handle.
//!
//! [`VerifierPool`] owns a fixed number of worker tasks and a single bounded
//! intake queue. Callers submit [`Credentials`] and wait for a [`Verdict`];
//! the pool guarantees that no more than `workers` verifications run at once,
//! however many callers are waiting. Excess callers wait first for room in the
//! intake queue and then for their result.
//!
//! Shutdown is explicit and cooperative: see [`VerifierPool::shutdown`].

use super::{
    PoolStats,
    request::{Counters, WorkItem},
    worker::{Shared, notify, worker_loop},
};
use crate::{
    BcryptVerifier, Credentials, NoopObserver, PoolObserver, Verdict, Verifier,
    error::{Error, Result},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Default capacity of the intake queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default time [`VerifierPool::shutdown`] waits for in-flight items.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopping worker may take to exit before it is aborted.
const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the drain phase of shutdown re-checks the pending count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configures and starts a [`VerifierPool`].
///
/// ```no_run
/// # async fn run() -> decrypter::Result<()> {
/// use decrypter::VerifierPool;
///
/// let pool = VerifierPool::builder().workers(4).queue_capacity(32).build()?;
/// let ok = pool
///     .verify(decrypter::Credentials::new("$2b$04$...", "hunter2"))
///     .await?;
/// # let _ = ok;
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder {
    workers: usize,
    queue_capacity: usize,
    shutdown_timeout: Duration,
    verifier: Arc<dyn Verifier>,
    observer: Arc<dyn PoolObserver>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            verifier: Arc::new(BcryptVerifier),
            observer: Arc::new(NoopObserver),
        }
    }
}

impl PoolBuilder {
    /// Number of worker tasks. Must be at least 1. Defaults to the number of
    /// logical CPUs.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Capacity of the intake queue. Must be at least 1.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Upper bound on how long [`VerifierPool::shutdown`] waits for queued and
    /// running items before stopping the workers anyway.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn verifier(mut self, verifier: impl Verifier) -> Self {
        self.verifier = Arc::new(verifier);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl PoolObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Like [`observer`](Self::observer) for an observer that is also held
    /// elsewhere.
    #[must_use]
    pub fn shared_observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validates the configuration and spawns every worker.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidWorkerCount`] if `workers` is 0.
    /// - [`Error::InvalidConfig`] if `queue_capacity` is 0.
    /// - [`Error::NoRuntime`] if called outside a Tokio runtime.
    pub fn build(self) -> Result<VerifierPool> {
        if self.workers == 0 {
            return Err(Error::InvalidWorkerCount(self.workers));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "queue capacity must be at least 1".to_string(),
            });
        }
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let counters = Arc::new(Counters::default());
        let shared = Arc::new(Shared {
            intake: tokio::sync::Mutex::new(receiver),
            verifier: self.verifier,
            observer: self.observer,
            counters: Arc::clone(&counters),
            shutdown_token: CancellationToken::new(),
        });

        let workers = (0..self.workers)
            .map(|worker_id| handle.spawn(worker_loop(worker_id, Arc::clone(&shared))))
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Started verifier pool with {} workers (queue capacity {})",
            self.workers,
            self.queue_capacity
        );

        Ok(VerifierPool {
            sender,
            shared,
            counters,
            workers: Mutex::new(workers),
            num_workers: self.workers,
            closing: CancellationToken::new(),
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A fixed-size pool of verification workers fed from one shared queue.
///
/// The number of workers is set at construction and never changes; a
/// verifier that panics costs one [`Verdict::Unverifiable`], not a worker.
/// Share the pool between tasks by wrapping it in an [`Arc`].
pub struct VerifierPool {
    sender: mpsc::Sender<WorkItem>,
    shared: Arc<Shared>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    closing: CancellationToken,
    shutdown_timeout: Duration,
}

impl VerifierPool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Starts a bcrypt pool with `workers` workers and default settings.
    ///
    /// # Errors
    ///
    /// See [`PoolBuilder::build`].
    pub fn new(workers: usize) -> Result<Self> {
        Self::builder().workers(workers).build()
    }

    /// Submits `credentials` and waits for the answer, collapsing unverifiable
    /// input (such as a malformed stored hash) to `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if the pool is shutting down.
    pub async fn verify(&self, credentials: Credentials) -> Result<bool> {
        self.check(credentials).await.map(|v| v.is_match())
    }

    /// Submits `credentials` and waits for the full [`Verdict`].
    ///
    /// Waits indefinitely while every worker is busy; use
    /// [`check_timeout`](Self::check_timeout) or
    /// [`check_until`](Self::check_until) to bound the wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if the pool is shutting down, or stops
    /// before this item is serviced.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub async fn check(&self, credentials: Credentials) -> Result<Verdict> {
        let start = Instant::now();
        let res = self.submit(credentials).await;
        self.observe(&res, start);
        res
    }

    /// Like [`check`](Self::check), giving up once `deadline` elapses.
    ///
    /// An item abandoned this way is discarded by the worker that eventually
    /// dequeues it, or its verdict is dropped if verification already began.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`] on expiry, plus the errors of
    /// [`check`](Self::check).
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub async fn check_timeout(
        &self,
        credentials: Credentials,
        deadline: Duration,
    ) -> Result<Verdict> {
        let start = Instant::now();
        let res = match timeout(deadline, self.submit(credentials)).await {
            Ok(res) => res,
            Err(_) => Err(Error::DeadlineExceeded(deadline)),
        };
        self.observe(&res, start);
        res
    }

    /// Like [`check`](Self::check), giving up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first, plus the errors of
    /// [`check`](Self::check).
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub async fn check_until(
        &self,
        credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        let start = Instant::now();
        let res = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            res = self.submit(credentials) => res,
        };
        self.observe(&res, start);
        res
    }

    /// Blocking counterpart of [`verify`](Self::verify) for plain threads.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn verify_blocking(&self, credentials: Credentials) -> Result<bool> {
        self.check_blocking(credentials).map(|v| v.is_match())
    }

    /// Blocking counterpart of [`check`](Self::check) for plain threads.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn check_blocking(&self, credentials: Credentials) -> Result<Verdict> {
        let start = Instant::now();
        let res = self.prepare(credentials).and_then(|(item, rx)| {
            self.sender
                .blocking_send(item)
                .map_err(|_| Error::PoolClosed)?;
            notify(|| self.shared.observer.on_enqueue(self.counters.queued()));
            rx.blocking_recv().map_err(|_| self.dropped_result())
        });
        self.observe(&res, start);
        res
    }

    async fn submit(&self, credentials: Credentials) -> Result<Verdict> {
        let (item, rx) = self.prepare(credentials)?;
        self.sender.send(item).await.map_err(|_| Error::PoolClosed)?;
        notify(|| self.shared.observer.on_enqueue(self.counters.queued()));
        rx.await.map_err(|_| self.dropped_result())
    }

    fn prepare(
        &self,
        credentials: Credentials,
    ) -> Result<(WorkItem, oneshot::Receiver<Verdict>)> {
        // The item is counted as pending before the closing check so that a
        // concurrent shutdown either sees it in its drain or refuses it here.
        let (item, rx) = WorkItem::new(credentials, &self.counters);
        if self.closing.is_cancelled() {
            return Err(Error::PoolClosed);
        }
        Ok((item, rx))
    }

    /// Maps a result slot that closed without a verdict. Outside of shutdown a
    /// worker never drops an item it is still expected to answer.
    fn dropped_result(&self) -> Error {
        if self.closing.is_cancelled() {
            Error::PoolClosed
        } else {
            Error::ChannelError {
                context: "worker dropped a result slot without answering".to_string(),
            }
        }
    }

    fn observe(&self, res: &Result<Verdict>, start: Instant) {
        notify(|| self.shared.observer.on_submit(res, start.elapsed()));
    }

    /// The fixed number of workers this pool was built with.
    pub const fn workers(&self) -> usize {
        self.num_workers
    }

    /// `true` once [`shutdown`](Self::shutdown) has started.
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Point-in-time counters, for health checks and tests.
    pub fn stats(&self) -> PoolStats {
        let live_workers = self
            .workers
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count();
        PoolStats {
            workers: self.num_workers,
            live_workers,
            queued: self.counters.queued(),
            busy: self.counters.busy(),
        }
    }

    /// Gracefully shuts down the pool.
    ///
    /// - Refuses new submissions with [`Error::PoolClosed`].
    /// - Waits up to the configured shutdown timeout for queued and running
    ///   items to finish.
    /// - Signals every worker to stop and waits up to 3 seconds per worker for
    ///   it to exit, aborting stragglers.
    /// - Drops whatever is still queued; the callers waiting on those items get
    ///   [`Error::PoolClosed`].
    ///
    /// Calling it again after it has completed is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new submissions ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new verification requests");
        self.closing.cancel();

        // === Phase 1: Let queued and running items finish ===
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining verifier pool ({} pending)",
            self.counters.pending()
        );
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.counters.pending() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All pending verifications drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Drain timed out ({} verifications still pending)",
                    self.counters.pending()
                );
            }
        }

        // === Phase 2: Stop the workers ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Signalling workers to stop");
        self.shared.shutdown_token.cancel();

        let handles = core::mem::take(&mut *self.workers.lock());
        let exits = handles.into_iter().enumerate().map(|(_i, handle)| async move {
            let abort = handle.abort_handle();
            match timeout(WORKER_EXIT_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} exited");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_i} failed: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} did not exit in time, aborting");
                    abort.abort();
                }
            }
        });
        futures::future::join_all(exits).await;

        // === Phase 3: Release anything left behind ===
        let mut intake = self.shared.intake.lock().await;
        intake.close();
        let mut _dropped = 0_usize;
        while let Ok(item) = intake.try_recv() {
            drop(item);
            _dropped += 1;
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Verifier pool shutdown complete ({_dropped} queued items dropped)");

        Ok(())
    }
}
