use crate::{
    CancellationToken, Credentials, Error, MalformedHashKind, PoolObserver, Verdict, VerifierPool,
    VerifyError,
};
use core::time::Duration;
use futures::future::join_all;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

const COST: u32 = 4;

fn hashed(password: &str) -> String {
    bcrypt::hash(password, COST).unwrap()
}

/// Test verifier that tracks how many calls overlap.
#[derive(Default)]
struct Probe {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    calls: AtomicUsize,
}

impl Probe {
    /// Equality "hash", slowed down so that calls have a chance to overlap.
    /// Panics on the candidate `boom`.
    fn run(&self, hash: &[u8], candidate: &[u8], delay: Duration) -> Result<bool, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(delay);
        self.current.fetch_sub(1, Ordering::SeqCst);
        if candidate == b"boom" {
            panic!("verifier exploded");
        }
        Ok(hash == candidate)
    }

    fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn probed_pool(workers: usize, delay: Duration) -> (Arc<VerifierPool>, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let p = Arc::clone(&probe);
    let pool = VerifierPool::builder()
        .workers(workers)
        .verifier(move |hash: &[u8], candidate: &[u8]| p.run(hash, candidate, delay))
        .build()
        .unwrap();
    (Arc::new(pool), probe)
}

async fn wait_until_idle(pool: &VerifierPool) {
    for _ in 0..200 {
        let stats = pool.stats();
        if stats.queued == 0 && stats.busy == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool never became idle: {:?}", pool.stats());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bcrypt_pool_answers_precomputed_pairs() {
    let pool = VerifierPool::new(2).unwrap();
    let alpha = hashed("alpha");
    let bravo = hashed("bravo");
    let cases = [
        (&alpha, "alpha", true),
        (&alpha, "bravo", false),
        (&bravo, "bravo", true),
        (&bravo, "Bravo", false),
        (&bravo, "", false),
    ];
    for (hash, candidate, expected) in cases {
        let creds = Credentials::new(hash.clone(), candidate.to_string());
        assert_eq!(pool.verify(creds).await, Ok(expected), "{candidate}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn known_hash_does_not_match_wrong_password() {
    let pool = VerifierPool::new(1).unwrap();
    let creds = Credentials::new(
        "$2b$10$//DXiVVE59p7G5k/4Klx/ezF7BI42QZKmoOD0NDvUuqxRE5bFFBLy",
        "nomatch",
    );
    assert_eq!(pool.verify(creds).await, Ok(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_worker_count() {
    let workers = 3;
    let (pool, probe) = probed_pool(workers, Duration::from_millis(20));

    let calls = (0..12).map(|i| {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.verify(Credentials::new(format!("{i}"), format!("{i}"))).await })
    });
    let results = join_all(calls).await;

    assert!(results.into_iter().all(|r| r.unwrap() == Ok(true)));
    assert_eq!(probe.calls(), 12);
    assert!(probe.max_seen() <= workers, "saw {} overlapping", probe.max_seen());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_serializes() {
    let (pool, probe) = probed_pool(1, Duration::from_millis(30));

    let a = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.verify(Credentials::new("a", "a")).await }
    });
    let b = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.verify(Credentials::new("b", "x")).await }
    });

    assert_eq!(a.await.unwrap(), Ok(true));
    assert_eq!(b.await.unwrap(), Ok(false));
    assert_eq!(probe.max_seen(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_submission_gets_its_own_answer() {
    let (pool, probe) = probed_pool(4, Duration::ZERO);

    let calls = (0..64_usize).map(|i| {
        let pool = Arc::clone(&pool);
        // Even requests carry a matching candidate, odd ones do not.
        let candidate = if i % 2 == 0 { format!("req-{i}") } else { format!("req-{i}-wrong") };
        tokio::spawn(async move {
            let res = pool.verify(Credentials::new(format!("req-{i}"), candidate)).await;
            (i, res)
        })
    });

    let results = join_all(calls).await;
    assert_eq!(results.len(), 64);
    for joined in results {
        let (i, res) = joined.unwrap();
        assert_eq!(res, Ok(i % 2 == 0), "request {i}");
    }
    assert_eq!(probe.calls(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_hash_is_false_and_harmless() {
    let pool = VerifierPool::new(1).unwrap();

    assert_eq!(pool.verify(Credentials::new("not-a-hash", "pw")).await, Ok(false));
    assert_eq!(
        pool.check(Credentials::new("not-a-hash", "pw")).await,
        Ok(Verdict::Unverifiable(VerifyError::MalformedHash(
            MalformedHashKind::Length
        )))
    );
    assert_eq!(
        pool.check(Credentials::new(vec![0xff_u8, 0x00], "pw")).await,
        Ok(Verdict::Unverifiable(VerifyError::MalformedHash(
            MalformedHashKind::Encoding
        )))
    );

    let hash = hashed("after");
    assert_eq!(pool.verify(Credentials::new(hash, "after")).await, Ok(true));
    assert_eq!(pool.stats().live_workers, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_batch_on_four_workers() {
    let pool = Arc::new(VerifierPool::new(4).unwrap());
    let good = hashed("correct horse");
    let other = hashed("battery staple");

    let calls = (0..10).map(|i| {
        let pool = Arc::clone(&pool);
        let creds = if i < 6 {
            Credentials::new(good.clone(), "correct horse")
        } else {
            Credentials::new(other.clone(), "correct horse")
        };
        tokio::spawn(async move { pool.verify(creds).await })
    });

    let results: Vec<bool> = join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();
    assert_eq!(results.iter().filter(|m| **m).count(), 6);
    assert_eq!(results.iter().filter(|m| !**m).count(), 4);

    let stats = pool.stats();
    assert_eq!(stats.workers, 4);
    assert_eq!(stats.live_workers, 4);

    assert_eq!(
        pool.verify(Credentials::new(other, "battery staple")).await,
        Ok(true)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verifier_panic_does_not_shrink_pool() {
    let (pool, _probe) = probed_pool(2, Duration::ZERO);

    // More panics than workers: if a panic killed its worker the pool would
    // be empty before the last of these was serviced.
    for _ in 0..5 {
        let res = pool.check(Credentials::new("h", "boom")).await.unwrap();
        assert!(
            matches!(res, Verdict::Unverifiable(VerifyError::Panicked { ref message }) if message.contains("exploded")),
            "{res:?}"
        );
    }

    assert_eq!(pool.stats().live_workers, 2);
    assert_eq!(pool.verify(Credentials::new("ok", "ok")).await, Ok(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn construction_rejects_bad_parameters() {
    assert_eq!(
        VerifierPool::new(0).err(),
        Some(Error::InvalidWorkerCount(0))
    );
    assert!(matches!(
        VerifierPool::builder().workers(1).queue_capacity(0).build(),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn construction_requires_a_runtime() {
    assert_eq!(VerifierPool::new(1).err(), Some(Error::NoRuntime));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_after_shutdown_fails_fast() {
    let (pool, _probe) = probed_pool(2, Duration::ZERO);
    assert_eq!(pool.verify(Credentials::new("x", "x")).await, Ok(true));

    pool.shutdown().await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(pool.stats().live_workers, 0);
    assert_eq!(
        pool.verify(Credentials::new("x", "x")).await,
        Err(Error::PoolClosed)
    );

    // Idempotent.
    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_in_flight_items() {
    let (pool, probe) = probed_pool(2, Duration::from_millis(100));

    let in_flight: Vec<_> = (0..4)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.verify(Credentials::new(format!("{i}"), format!("{i}"))).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.shutdown().await.unwrap();

    for handle in in_flight {
        assert_eq!(handle.await.unwrap(), Ok(true));
    }
    assert_eq!(probe.calls(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_shutdown_releases_queued_callers() {
    let probe = Arc::new(Probe::default());
    let p = Arc::clone(&probe);
    let pool = Arc::new(
        VerifierPool::builder()
            .workers(1)
            .queue_capacity(8)
            .shutdown_timeout(Duration::from_millis(50))
            .verifier(move |h: &[u8], c: &[u8]| p.run(h, c, Duration::from_millis(300)))
            .build()
            .unwrap(),
    );

    let first = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.verify(Credentials::new("1", "1")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.verify(Credentials::new("q", "q")).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.shutdown().await.unwrap();

    // The running item always completes; the queued ones never start.
    assert_eq!(first.await.unwrap(), Ok(true));
    for handle in queued {
        assert_eq!(handle.await.unwrap(), Err(Error::PoolClosed));
    }
    assert_eq!(probe.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_abandons_without_burning_a_worker() {
    let (pool, probe) = probed_pool(1, Duration::from_millis(150));

    let busy = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.verify(Credentials::new("a", "a")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let deadline = Duration::from_millis(20);
    assert_eq!(
        pool.check_timeout(Credentials::new("b", "b"), deadline).await,
        Err(Error::DeadlineExceeded(deadline))
    );

    assert_eq!(busy.await.unwrap(), Ok(true));
    wait_until_idle(&pool).await;

    // The abandoned item was discarded instead of verified.
    assert_eq!(probe.calls(), 1);
    assert_eq!(pool.verify(Credentials::new("c", "c")).await, Ok(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_token_ends_the_wait() {
    let (pool, _probe) = probed_pool(1, Duration::from_millis(100));
    let busy = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.verify(Credentials::new("a", "a")).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    assert_eq!(
        pool.check_until(Credentials::new("b", "b"), &cancel).await,
        Err(Error::Cancelled)
    );
    assert_eq!(busy.await.unwrap(), Ok(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_submit_from_plain_threads() {
    let (pool, _probe) = probed_pool(2, Duration::from_millis(5));

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                pool.verify_blocking(Credentials::new(format!("{i}"), "1"))
            })
        })
        .collect();

    let results: Vec<_> = tokio::task::spawn_blocking(move || {
        threads.into_iter().map(|t| t.join().unwrap()).collect()
    })
    .await
    .unwrap();

    assert_eq!(results, vec![Ok(false), Ok(true), Ok(false), Ok(false)]);
}

#[derive(Default)]
struct Recorder {
    enqueued: AtomicUsize,
    dequeued: AtomicUsize,
    verified: AtomicUsize,
    matched: AtomicUsize,
    submitted: AtomicUsize,
    failed: AtomicUsize,
}

impl PoolObserver for Recorder {
    fn on_enqueue(&self, _queued: usize) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dequeue(&self, _queued: usize) {
        self.dequeued.fetch_add(1, Ordering::SeqCst);
    }

    fn on_verified(&self, verdict: &Verdict, _elapsed: Duration) {
        self.verified.fetch_add(1, Ordering::SeqCst);
        if verdict.is_match() {
            self.matched.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_submit(&self, result: &Result<Verdict, Error>, _elapsed: Duration) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if result.is_err() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn observer_sees_both_boundaries() {
    let recorder = Arc::new(Recorder::default());
    let pool = VerifierPool::builder()
        .workers(2)
        .verifier(|h: &[u8], c: &[u8]| -> Result<bool, VerifyError> { Ok(h == c) })
        .shared_observer(Arc::clone(&recorder) as Arc<dyn PoolObserver>)
        .build()
        .unwrap();

    assert_eq!(pool.verify(Credentials::new("a", "a")).await, Ok(true));
    assert_eq!(pool.verify(Credentials::new("a", "b")).await, Ok(false));
    assert_eq!(pool.verify(Credentials::new("c", "c")).await, Ok(true));
    pool.shutdown().await.unwrap();
    assert_eq!(
        pool.verify(Credentials::new("d", "d")).await,
        Err(Error::PoolClosed)
    );

    assert_eq!(recorder.enqueued.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.dequeued.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.verified.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.matched.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.submitted.load(Ordering::SeqCst), 4);
    assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
}

/// Observer whose every hook panics.
struct Faulty;

impl PoolObserver for Faulty {
    fn on_enqueue(&self, _queued: usize) {
        panic!("enqueue hook exploded");
    }

    fn on_dequeue(&self, _queued: usize) {
        panic!("dequeue hook exploded");
    }

    fn on_verified(&self, _verdict: &Verdict, _elapsed: Duration) {
        panic!("verified hook exploded");
    }

    fn on_submit(&self, _result: &Result<Verdict, Error>, _elapsed: Duration) {
        panic!("submit hook exploded");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_observer_does_not_shrink_pool() {
    let pool = VerifierPool::builder()
        .workers(2)
        .verifier(|h: &[u8], c: &[u8]| -> Result<bool, VerifyError> { Ok(h == c) })
        .observer(Faulty)
        .build()
        .unwrap();

    // More submissions than workers: a hook panic that killed its worker
    // would leave nobody to answer the later ones.
    for i in 0..5 {
        let candidate = if i % 2 == 0 { "x" } else { "y" };
        assert_eq!(
            pool.verify(Credentials::new("x", candidate)).await,
            Ok(i % 2 == 0),
            "submission {i}"
        );
    }

    let stats = pool.stats();
    assert_eq!(stats.live_workers, 2);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.busy, 0);
}

#[derive(Default)]
struct DepthLog {
    enqueued: parking_lot::Mutex<Vec<usize>>,
    dequeued: parking_lot::Mutex<Vec<usize>>,
}

impl PoolObserver for DepthLog {
    fn on_enqueue(&self, queued: usize) {
        self.enqueued.lock().push(queued);
    }

    fn on_dequeue(&self, queued: usize) {
        self.dequeued.lock().push(queued);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn observer_sees_queue_depth_of_saturated_pool() {
    let log = Arc::new(DepthLog::default());
    let probe = Arc::new(Probe::default());
    let p = Arc::clone(&probe);
    let pool = Arc::new(
        VerifierPool::builder()
            .workers(1)
            .verifier(move |h: &[u8], c: &[u8]| p.run(h, c, Duration::from_millis(150)))
            .shared_observer(Arc::clone(&log) as Arc<dyn PoolObserver>)
            .build()
            .unwrap(),
    );

    let mut calls = Vec::new();
    for i in 0..3 {
        let pool = Arc::clone(&pool);
        calls.push(tokio::spawn(async move {
            pool.verify(Credentials::new(format!("{i}"), format!("{i}")))
                .await
        }));
        // Let each submission land before the next one.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = pool.stats();
    assert_eq!(stats.busy, 1);
    assert_eq!(stats.queued, 2);

    for call in calls {
        assert_eq!(call.await.unwrap(), Ok(true));
    }
    assert_eq!(probe.calls(), 3);

    // The first item may already be in service when its enqueue is reported;
    // the other two queue up behind it.
    let enqueued = log.enqueued.lock().clone();
    assert_eq!(enqueued.len(), 3);
    assert_eq!(enqueued[1..].to_vec(), vec![1, 2]);
    assert_eq!(*log.dequeued.lock(), vec![0, 1, 0]);
}
