use crate::{
    ComputeError, Error, MemoryMonitor, PoolConfig, PoolStats, ProofPool, ProofProvider,
    ProofRequest, ProofResponse,
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Instant,
};

type ProveFn =
    dyn Fn(&ProofRequest) -> core::result::Result<ProofResponse, ComputeError> + Send + Sync;
type InitFn = dyn Fn(usize) -> core::result::Result<(), ComputeError> + Send + Sync;

/// Closure-backed provider with an initialization counter, so tests can
/// observe how many distinct workers warmed up. The warm-up closure receives
/// the zero-based ordinal of the attempt.
struct FnProvider {
    init_count: AtomicUsize,
    init_fn: Box<InitFn>,
    prove_fn: Box<ProveFn>,
}

impl FnProvider {
    fn new(
        prove_fn: impl Fn(&ProofRequest) -> core::result::Result<ProofResponse, ComputeError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Self::with_init(|_| Ok(()), prove_fn)
    }

    fn with_init(
        init_fn: impl Fn(usize) -> core::result::Result<(), ComputeError> + Send + Sync + 'static,
        prove_fn: impl Fn(&ProofRequest) -> core::result::Result<ProofResponse, ComputeError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            init_count: AtomicUsize::new(0),
            init_fn: Box::new(init_fn),
            prove_fn: Box::new(prove_fn),
        })
    }

    fn echo() -> Arc<Self> {
        Self::new(|request| Ok(ProofResponse::new(request.payload.clone())))
    }

    fn inits(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }
}

impl ProofProvider for FnProvider {
    fn initialize(&self) -> core::result::Result<(), ComputeError> {
        let attempt = self.init_count.fetch_add(1, Ordering::SeqCst);
        (self.init_fn)(attempt)
    }

    fn prove(
        &self,
        request: &ProofRequest,
    ) -> core::result::Result<ProofResponse, ComputeError> {
        (self.prove_fn)(request)
    }
}

/// Memory probe returning a test-controlled reading.
struct FixedMemory {
    used: AtomicU64,
}

impl FixedMemory {
    fn new(used: u64) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicU64::new(used),
        })
    }

    fn set(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl MemoryMonitor for FixedMemory {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

fn test_config() -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 2,
        max_jobs_per_worker: 100,
        worker_timeout: Duration::from_secs(5),
        memory_threshold_bytes: 1_000_000,
        spawn_timeout: Duration::from_secs(5),
        scale_interval: Duration::from_millis(50),
        health_check_interval: Duration::from_millis(50),
        max_payload_bytes: 1024 * 1024,
        event_buffer_size: 64,
    }
}

/// Builds a pool with a fixed zero memory reading, so admission never
/// interferes with tests that are not about memory pressure.
fn spawn_pool(config: PoolConfig, provider: Arc<dyn ProofProvider>) -> ProofPool {
    ProofPool::with_memory_monitor(config, provider, FixedMemory::new(0)).expect("valid config")
}

/// Polls `stats` until the predicate holds or the deadline passes.
async fn wait_until(pool: &ProofPool, deadline: Duration, pred: impl Fn(&PoolStats) -> bool) {
    let start = Instant::now();
    loop {
        let stats = pool.stats().await.expect("stats");
        if pred(&stats) {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not reached in time, last stats: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn completes_a_single_job() {
    let pool = spawn_pool(test_config(), FnProvider::echo());

    let response = pool
        .submit(ProofRequest::new(vec![1, 2, 3]))
        .await
        .expect("job should complete");
    assert_eq!(response.proof.as_ref(), &[1, 2, 3]);

    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.queue_length, 0);
    assert!(stats.average_duration_ms >= 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_invalid_requests_before_queueing() {
    let pool = spawn_pool(test_config(), FnProvider::echo());

    let empty = pool.submit(ProofRequest::new(Bytes::new())).await;
    assert!(matches!(empty, Err(Error::Validation { .. })));

    let oversized = pool
        .submit(ProofRequest::new(vec![0_u8; 2 * 1024 * 1024]))
        .await;
    assert!(matches!(oversized, Err(Error::Validation { .. })));

    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.total_completed, 0);
    assert_eq!(stats.total_errors, 2);
    assert_eq!(stats.queue_length, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatches_queued_tasks_in_fifo_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let provider = FnProvider::new(move |request| {
        thread::sleep(Duration::from_millis(20));
        seen.lock().push(request.payload[0]);
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let mut handles = Vec::new();
    for i in 0..6_u8 {
        let submitter = pool.clone();
        handles.push(tokio::spawn(async move {
            submitter.submit(ProofRequest::new(vec![i])).await
        }));
        // Wait for this submission to register before issuing the next one,
        // so arrival order is deterministic.
        let registered = (i + 1) as usize;
        wait_until(&pool, Duration::from_secs(5), |stats| {
            stats.total_completed as usize + stats.busy_workers + stats.queue_length >= registered
        })
        .await;
    }
    for handle in handles {
        handle.await.expect("join").expect("job should complete");
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_fails_only_the_stuck_task() {
    let provider = FnProvider::new(|request| {
        if request.payload[0] == 255 {
            // Stuck job; longer than the deadline but bounded so the runtime
            // shuts down cleanly.
            thread::sleep(Duration::from_millis(1_000));
        } else {
            thread::sleep(Duration::from_millis(10));
        }
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 4,
        max_workers: 4,
        worker_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let mut handles = Vec::new();
    handles.push(tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(ProofRequest::new(vec![255])).await }
    }));
    for i in 0..9_u8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.submit(ProofRequest::new(vec![i])).await
        }));
    }

    let mut timeouts = 0;
    let mut completed = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => completed += 1,
            Err(Error::Timeout { timeout_ms }) => {
                assert_eq!(timeout_ms, 300);
                timeouts += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(timeouts, 1);
    assert_eq!(completed, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn never_runs_more_jobs_than_max_workers() {
    let provider = FnProvider::new(|request| {
        thread::sleep(Duration::from_millis(100));
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 2,
        max_workers: 2,
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..10_u8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.submit(ProofRequest::new(vec![i])).await
        }));
    }

    let mut max_busy = 0;
    let mut max_workers = 0;
    loop {
        let stats = pool.stats().await.expect("stats");
        max_busy = max_busy.max(stats.busy_workers);
        max_workers = max_workers.max(stats.workers);
        if stats.total_completed == 10 {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "jobs never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.expect("join").expect("job should complete");
    }

    assert!(max_busy <= 2, "observed {max_busy} concurrent jobs");
    assert!(max_workers <= 2, "observed {max_workers} workers");
    // Two workers over ten 100ms jobs is at least five sequential batches.
    assert!(start.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(flavor = "multi_thread")]
async fn recycles_workers_at_their_job_quota() {
    let provider = FnProvider::echo();
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        max_jobs_per_worker: 2,
        ..test_config()
    };
    let pool = spawn_pool(config, Arc::clone(&provider) as Arc<dyn ProofProvider>);

    for i in 0..6_u8 {
        pool.submit(ProofRequest::new(vec![i]))
            .await
            .expect("job should complete");
    }

    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.total_completed, 6);
    // Six jobs at two per worker means at least the third worker has warmed
    // up by now.
    assert!(provider.inits() >= 3, "only {} workers warmed up", provider.inits());
    wait_until(&pool, Duration::from_secs(5), |stats| stats.workers == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_crash_fails_one_task_and_recovers() {
    let provider = FnProvider::new(|request| {
        if request.payload[0] == 0xBB {
            panic!("compute function crashed");
        }
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let crashed = pool.submit(ProofRequest::new(vec![0xBB])).await;
    assert!(matches!(crashed, Err(Error::WorkerCrash)));

    // The replacement worker picks up new work as if nothing happened.
    let response = pool
        .submit(ProofRequest::new(vec![7]))
        .await
        .expect("pool should recover");
    assert_eq!(response.proof.as_ref(), &[7]);

    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_errors, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn compute_failure_keeps_the_worker_alive() {
    let provider = FnProvider::new(|request| {
        if request.payload[0] == 9 {
            Err(ComputeError::new("bad witness"))
        } else {
            Ok(ProofResponse::new(request.payload.clone()))
        }
    });
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = spawn_pool(config, Arc::clone(&provider) as Arc<dyn ProofProvider>);

    let failed = pool.submit(ProofRequest::new(vec![9])).await;
    match failed {
        Err(Error::Compute(err)) => assert_eq!(err.reason, "bad witness"),
        other => panic!("expected a compute error, got {other:?}"),
    }

    pool.submit(ProofRequest::new(vec![1]))
        .await
        .expect("worker should still be alive");

    // Same worker served both jobs; no replacement was spawned.
    assert_eq!(provider.inits(), 1);
    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_errors, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_and_rejects_queued() {
    let provider = FnProvider::new(|request| {
        if request.payload[0] == 1 {
            thread::sleep(Duration::from_millis(300));
        }
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let in_flight = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(ProofRequest::new(vec![1])).await }
    });
    wait_until(&pool, Duration::from_secs(5), |stats| stats.busy_workers == 1).await;

    let mut queued = Vec::new();
    for i in 2..4_u8 {
        let pool = pool.clone();
        queued.push(tokio::spawn(async move {
            pool.submit(ProofRequest::new(vec![i])).await
        }));
    }
    wait_until(&pool, Duration::from_secs(5), |stats| stats.queue_length == 2).await;

    pool.shutdown(Duration::from_secs(2))
        .await
        .expect("shutdown");

    // The in-flight job finished inside the drain window.
    let response = in_flight.await.expect("join").expect("in-flight job");
    assert_eq!(response.proof.as_ref(), &[1]);
    // Queued tasks never ran.
    for handle in queued {
        assert!(matches!(handle.await.expect("join"), Err(Error::Shutdown)));
    }
    // Late submissions reject immediately.
    assert!(matches!(
        pool.submit(ProofRequest::new(vec![5])).await,
        Err(Error::Shutdown)
    ));
    // Stats remain answerable after shutdown; both queued rejections count as
    // errors.
    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.workers, 0);
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_errors, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_window_expiry_force_terminates_stragglers() {
    let provider = FnProvider::new(|request| {
        thread::sleep(Duration::from_millis(700));
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let straggler = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(ProofRequest::new(vec![1])).await }
    });
    wait_until(&pool, Duration::from_secs(5), |stats| stats.busy_workers == 1).await;

    let start = Instant::now();
    pool.shutdown(Duration::from_millis(100))
        .await
        .expect("shutdown");
    assert!(
        start.elapsed() < Duration::from_millis(600),
        "shutdown waited for the straggler instead of force-terminating it"
    );

    assert!(matches!(
        straggler.await.expect("join"),
        Err(Error::Shutdown)
    ));
    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.workers, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_shutdown_calls_all_resolve() {
    let pool = spawn_pool(test_config(), FnProvider::echo());

    let mut calls = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        calls.push(tokio::spawn(async move {
            pool.shutdown(Duration::from_secs(1)).await
        }));
    }
    for call in calls {
        call.await.expect("join").expect("shutdown");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_pressure_rejects_new_submissions() {
    let memory = FixedMemory::new(960_000);
    let pool = ProofPool::with_memory_monitor(
        test_config(),
        FnProvider::echo(),
        Arc::clone(&memory) as Arc<dyn MemoryMonitor>,
    )
    .expect("valid config");

    // 960k of a 1M threshold is past the critical fraction.
    let rejected = pool.submit(ProofRequest::new(vec![1])).await;
    assert!(matches!(rejected, Err(Error::ResourceExhausted)));
    let stats = pool.stats().await.expect("stats");
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.total_errors, 1);

    // Once pressure subsides, submissions are admitted again.
    memory.set(100_000);
    pool.submit(ProofRequest::new(vec![1]))
        .await
        .expect("admitted after pressure subsides");
}

#[tokio::test(flavor = "multi_thread")]
async fn critical_pressure_sheds_queued_tasks() {
    let provider = FnProvider::new(|request| {
        if request.payload[0] == 1 {
            thread::sleep(Duration::from_millis(400));
        }
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let memory = FixedMemory::new(0);
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = ProofPool::with_memory_monitor(
        config,
        provider,
        Arc::clone(&memory) as Arc<dyn MemoryMonitor>,
    )
    .expect("valid config");

    let blocker = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(ProofRequest::new(vec![1])).await }
    });
    wait_until(&pool, Duration::from_secs(5), |stats| stats.busy_workers == 1).await;

    let mut queued = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        queued.push(tokio::spawn(async move {
            pool.submit(ProofRequest::new(vec![2])).await
        }));
    }
    wait_until(&pool, Duration::from_secs(5), |stats| stats.queue_length == 3).await;

    // Cross the critical fraction; the next health sweep sheds the queue but
    // leaves the in-flight job alone.
    memory.set(999_999);
    wait_until(&pool, Duration::from_secs(5), |stats| stats.queue_length == 0).await;

    for handle in queued {
        assert!(matches!(
            handle.await.expect("join"),
            Err(Error::ResourceExhausted)
        ));
    }
    let response = blocker.await.expect("join").expect("in-flight job");
    assert_eq!(response.proof.as_ref(), &[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn scales_with_demand_and_back_down() {
    let provider = FnProvider::new(|request| {
        thread::sleep(Duration::from_millis(150));
        Ok(ProofResponse::new(request.payload.clone()))
    });
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 3,
        scale_interval: Duration::from_millis(30),
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let mut handles = Vec::new();
    for i in 0..6_u8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.submit(ProofRequest::new(vec![i])).await
        }));
    }

    let start = Instant::now();
    let mut max_workers = 0;
    loop {
        let stats = pool.stats().await.expect("stats");
        max_workers = max_workers.max(stats.workers);
        if stats.total_completed == 6 {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "jobs never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.expect("join").expect("job should complete");
    }
    assert!(max_workers > 1, "pool never scaled up under load");
    assert!(max_workers <= 3, "pool exceeded max_workers");

    // With an empty queue the pool shrinks back to min_workers.
    wait_until(&pool, Duration::from_secs(5), |stats| stats.workers == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wedged_spawn_does_not_stall_queued_tasks() {
    // Warm-up attempt #1 hangs past the spawn timeout; every other attempt is
    // instant.
    let provider = FnProvider::with_init(
        |attempt| {
            if attempt == 1 {
                thread::sleep(Duration::from_millis(1_000));
            }
            Ok(())
        },
        |request| {
            if request.payload[0] == 1 {
                thread::sleep(Duration::from_millis(1_000));
            }
            Ok(ProofResponse::new(request.payload.clone()))
        },
    );
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 2,
        spawn_timeout: Duration::from_millis(100),
        // Keep the maintenance ticks out of the picture so recovery can only
        // come from the spawn-timeout handler itself.
        scale_interval: Duration::from_secs(60),
        health_check_interval: Duration::from_secs(60),
        ..test_config()
    };
    let pool = spawn_pool(config, provider);

    let blocker = tokio::spawn({
        let pool = pool.clone();
        async move { pool.submit(ProofRequest::new(vec![1])).await }
    });
    wait_until(&pool, Duration::from_secs(5), |stats| stats.busy_workers == 1).await;

    // This queued task triggers a scale-up spawn whose warm-up wedges. The
    // expired spawn must be retried right away rather than waiting for the
    // blocker to finish.
    let start = Instant::now();
    let response = pool
        .submit(ProofRequest::new(vec![2]))
        .await
        .expect("queued task should complete");
    assert_eq!(response.proof.as_ref(), &[2]);
    assert!(
        start.elapsed() < Duration::from_millis(700),
        "queued task stalled {:?} behind the busy worker",
        start.elapsed()
    );

    blocker.await.expect("join").expect("blocker job");
}

#[tokio::test(flavor = "multi_thread")]
async fn recovers_when_worker_warm_up_fails_once() {
    let provider = FnProvider::with_init(
        |attempt| {
            if attempt == 0 {
                Err(ComputeError::new("proving material unavailable"))
            } else {
                Ok(())
            }
        },
        |request| Ok(ProofResponse::new(request.payload.clone())),
    );
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..test_config()
    };
    let pool = spawn_pool(config, Arc::clone(&provider) as Arc<dyn ProofProvider>);

    let response = pool
        .submit(ProofRequest::new(vec![3]))
        .await
        .expect("replacement worker should serve the job");
    assert_eq!(response.proof.as_ref(), &[3]);
    assert!(provider.inits() >= 2, "no replacement was warmed up");
}

#[tokio::test(flavor = "multi_thread")]
async fn throttles_respawns_when_warm_up_keeps_failing() {
    let healthy = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&healthy);
    let provider = FnProvider::with_init(
        move |_| {
            if gate.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ComputeError::new("proving material unavailable"))
            }
        },
        |request| Ok(ProofResponse::new(request.payload.clone())),
    );
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        health_check_interval: Duration::from_millis(100),
        scale_interval: Duration::from_secs(60),
        ..test_config()
    };
    let pool = spawn_pool(config, Arc::clone(&provider) as Arc<dyn ProofProvider>);

    // A persistently failing warm-up must not spin: a short burst up front,
    // then one retry per health sweep.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let attempts = provider.inits();
    assert!(attempts >= 3, "expected an initial respawn burst");
    assert!(attempts <= 10, "respawn loop is unthrottled: {attempts} warm-up attempts");

    // Once warm-up succeeds again, the periodic retry brings the pool back.
    healthy.store(true, Ordering::SeqCst);
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        pool.submit(ProofRequest::new(vec![4])),
    )
    .await
    .expect("pool never recovered")
    .expect("job should complete");
    assert_eq!(response.proof.as_ref(), &[4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_is_rejected_at_construction() {
    let config = PoolConfig {
        min_workers: 0,
        ..test_config()
    };
    let result = ProofPool::with_memory_monitor(config, FnProvider::echo(), FixedMemory::new(0));
    assert!(matches!(result, Err(Error::Validation { .. })));
}
