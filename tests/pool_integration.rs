//! Integration tests for the classifier pool.
//!
//! Each test starts a pool of small `sh` scripts that speak the worker line
//! protocol (READY, then one JSON line out per JSON line in) and exercises
//! the dispatcher through its public API.

use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, sleep, timeout};

use classifier_pool::{
    ClassificationRequest, ClassifierCommand, Dispatcher, PendingClassification, PoolConfig,
    PoolError, PoolStats, SubmitError, TaskError, WorkerStatus,
};

/// Maximum time any single wait is allowed before we consider the test hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Echoes every request back, which parses as a result with only extra fields.
const ECHO: &str = r#"echo READY; while IFS= read -r line; do printf '%s\n' "$line"; done"#;

/// Never answers.
const SILENT: &str = r#"echo READY; while IFS= read -r line; do :; done"#;

fn config(script: &str, pool_size: usize) -> PoolConfig {
    PoolConfig {
        command: ClassifierCommand::new("sh").arg("-c").arg(script),
        pool_size,
        task_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(5),
        startup_delay: Duration::ZERO,
        match_interval: Duration::from_millis(5),
        shutdown_grace: Duration::from_millis(500),
        ..PoolConfig::default()
    }
}

fn email(subject: &str) -> ClassificationRequest {
    ClassificationRequest::new(subject, "automated@airbnb.com", "Reservation confirmed")
}

async fn start(config: PoolConfig) -> Dispatcher {
    timeout(TEST_TIMEOUT, Dispatcher::initialize(config))
        .await
        .expect("pool startup hung")
        .expect("pool failed to start")
}

async fn outcome(pending: PendingClassification) -> Result<classifier_pool::ClassificationResult, TaskError> {
    timeout(TEST_TIMEOUT, pending).await.expect("task never resolved")
}

/// Poll stats until `check` holds.
async fn wait_for(pool: &Dispatcher, what: &str, check: impl Fn(&PoolStats) -> bool) -> PoolStats {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let stats = pool.stats().await;
        if check(&stats) {
            return stats;
        }
        if Instant::now() > deadline {
            panic!("Timed out waiting for {what}: {stats:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

// ── Normal operation ────────────────────────────────────────────────────

#[tokio::test]
async fn completes_tasks_across_workers() {
    let pool = start(config(ECHO, 2)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.ready_workers, 2);

    let mut pendings = Vec::new();
    for i in 0..5 {
        pendings.push(pool.submit(email(&format!("booking {i}"))).await.unwrap());
    }
    for (i, pending) in pendings.into_iter().enumerate() {
        let result = outcome(pending).await.unwrap();
        assert_eq!(result.extra.get("subject"), Some(&Value::from(format!("booking {i}"))));
    }

    let stats = wait_for(&pool, "all workers idle", |s| s.ready_workers == 2).await;
    assert_eq!(stats.total_tasks_completed, 5);
    assert_eq!(stats.total_tasks_failed, 0);
    assert_eq!(stats.queue_length, 0);
    let per_worker: u64 = stats.workers.iter().map(|w| w.tasks_completed).sum();
    assert_eq!(per_worker, 5);

    pool.shutdown().await;
}

#[tokio::test]
async fn idle_workers_take_tasks_in_parallel() {
    let slow = r#"echo READY; while IFS= read -r line; do sleep 0.3; printf '%s\n' "$line"; done"#;
    let pool = start(config(slow, 2)).await;

    let a = pool.submit(email("a")).await.unwrap();
    let b = pool.submit(email("b")).await.unwrap();
    wait_for(&pool, "both workers busy", |s| s.busy_workers == 2).await;

    assert!(outcome(a).await.is_ok());
    assert!(outcome(b).await.is_ok());

    let stats = wait_for(&pool, "both workers idle", |s| s.ready_workers == 2).await;
    assert!(stats.workers.iter().all(|w| w.tasks_completed == 1));
    pool.shutdown().await;
}

#[tokio::test]
async fn single_worker_serves_queue_in_fifo_order() {
    let numbered = r#"echo READY; n=0; while IFS= read -r line; do n=$((n+1)); printf '{"seq":%d,"request":%s}\n' "$n" "$line"; done"#;
    let pool = start(config(numbered, 1)).await;

    let mut pendings = Vec::new();
    for i in 1..=4 {
        pendings.push(pool.submit(email(&format!("s{i}"))).await.unwrap());
    }
    for (i, pending) in pendings.into_iter().enumerate() {
        let result = outcome(pending).await.unwrap();
        assert_eq!(result.extra.get("seq"), Some(&Value::from(i + 1)));
        assert_eq!(
            result.extra["request"]["subject"],
            Value::from(format!("s{}", i + 1))
        );
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn classify_returns_typed_result() {
    let fixed = r#"echo 'Loading model...'; echo READY; while IFS= read -r line; do echo '{"emailType":"booking_confirmation","confidence":0.97,"bookingCode":"HMABC123","nights":3}'; done"#;
    let pool = start(config(fixed, 1)).await;

    let result = timeout(
        TEST_TIMEOUT,
        pool.classify(email("Reservation confirmed").with_email_date("2024-03-01")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.email_type.as_deref(), Some("booking_confirmation"));
    assert_eq!(result.booking_code.as_deref(), Some("HMABC123"));
    assert_eq!(result.nights, Some(3));
    assert!(result.extra.is_empty());
    pool.shutdown().await;
}

// ── Failures ────────────────────────────────────────────────────────────

#[tokio::test]
async fn timed_out_task_marks_worker_errored() {
    let pool = start(PoolConfig {
        task_timeout: Duration::from_millis(200),
        ..config(SILENT, 1)
    })
    .await;

    let pending = pool.submit(email("slow")).await.unwrap();
    let task_id = pending.task_id();
    assert_eq!(
        outcome(pending).await,
        Err(TaskError::Timeout {
            task_id,
            timeout: Duration::from_millis(200),
        })
    );

    let stats = pool.stats().await;
    assert_eq!(stats.worker(0).map(|w| w.status), Some(WorkerStatus::Error));
    assert_eq!(stats.total_tasks_failed, 1);
    assert_eq!(stats.circuit_breaker.consecutive_failures, 1);

    // An errored worker is not capacity.
    assert_eq!(
        pool.submit(email("next")).await.unwrap_err(),
        SubmitError::NoWorkersAvailable
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn worker_exit_fails_in_flight_task() {
    let pool = start(config("echo READY; read -r line; exit 3", 1)).await;

    let pending = pool.submit(email("crash")).await.unwrap();
    assert_eq!(
        outcome(pending).await,
        Err(TaskError::WorkerExited {
            worker_id: 0,
            code: Some(3),
        })
    );

    let stats = pool.stats().await;
    assert_eq!(stats.dead_workers, 1);
    assert_eq!(stats.worker(0).map(|w| w.status), Some(WorkerStatus::Dead));

    assert_eq!(
        pool.submit(email("after crash")).await.unwrap_err(),
        SubmitError::NoWorkersAvailable
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn idle_worker_exit_is_detected() {
    let pool = start(config("echo READY; sleep 0.1; exit 0", 2)).await;
    wait_for(&pool, "both workers dead", |s| s.dead_workers == 2).await;
    assert_eq!(
        pool.submit(email("nobody home")).await.unwrap_err(),
        SubmitError::NoWorkersAvailable
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn malformed_response_fails_task() {
    let garbage = r#"echo READY; while IFS= read -r line; do echo 'Traceback (most recent call last):'; done"#;
    let pool = start(config(garbage, 1)).await;

    let pending = pool.submit(email("x")).await.unwrap();
    match outcome(pending).await {
        Err(TaskError::MalformedResponse { worker_id, .. }) => assert_eq!(worker_id, 0),
        other => panic!("Expected malformed response, got {other:?}"),
    }
    let stats = pool.stats().await;
    assert_eq!(stats.error_workers, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn classifier_error_keeps_worker_ready() {
    let failing = r#"echo READY; while IFS= read -r line; do echo '{"error":"model not loaded"}'; done"#;
    let pool = start(config(failing, 1)).await;

    let pending = pool.submit(email("x")).await.unwrap();
    assert_eq!(
        outcome(pending).await,
        Err(TaskError::Classifier {
            message: "model not loaded".into(),
        })
    );

    let stats = wait_for(&pool, "worker ready", |s| s.ready_workers == 1).await;
    assert_eq!(stats.total_tasks_failed, 1);
    assert_eq!(stats.worker(0).map(|w| w.tasks_completed), Some(0));
    pool.shutdown().await;
}

// ── Admission control ───────────────────────────────────────────────────

#[tokio::test]
async fn breaker_opens_and_recovers_after_cooldown() {
    let failing = r#"echo READY; while IFS= read -r line; do echo '{"error":"model not loaded"}'; done"#;
    let mut cfg = config(failing, 1);
    cfg.breaker.failure_threshold = 5;
    cfg.breaker.cooldown = Duration::from_millis(400);
    let pool = start(cfg).await;

    for _ in 0..5 {
        let pending = pool.submit(email("x")).await.unwrap();
        assert!(matches!(outcome(pending).await, Err(TaskError::Classifier { .. })));
    }

    match pool.submit(email("rejected")).await {
        Err(SubmitError::CircuitOpen { failures, .. }) => assert_eq!(failures, 5),
        other => panic!("Expected open breaker, got {other:?}"),
    }
    let stats = pool.stats().await;
    assert!(stats.circuit_breaker.is_open);
    assert_eq!(stats.circuit_breaker.times_opened, 1);
    assert_eq!(stats.queue_length, 0);

    sleep(Duration::from_millis(500)).await;

    // First submission after the cool-down is admitted and closes the breaker.
    let probe = pool.submit(email("probe")).await.unwrap();
    assert!(outcome(probe).await.is_err());
    let stats = pool.stats().await;
    assert!(!stats.circuit_breaker.is_open);
    assert_eq!(stats.circuit_breaker.consecutive_failures, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_without_enqueuing() {
    let pool = start(PoolConfig {
        max_queue: 2,
        ..config(SILENT, 1)
    })
    .await;

    let first = pool.submit(email("assigned")).await.unwrap();
    wait_for(&pool, "worker busy", |s| s.busy_workers == 1).await;

    let second = pool.submit(email("queued 1")).await.unwrap();
    let third = pool.submit(email("queued 2")).await.unwrap();
    assert_eq!(pool.stats().await.queue_length, 2);

    assert_eq!(
        pool.submit(email("overflow")).await.unwrap_err(),
        SubmitError::QueueFull { max: 2 }
    );
    let stats = pool.stats().await;
    assert_eq!(stats.queue_length, 2);
    // A full queue is back-pressure, not a classifier failure.
    assert_eq!(stats.circuit_breaker.consecutive_failures, 0);

    // Shutdown drops everything still outstanding.
    pool.shutdown().await;
    for pending in [first, second, third] {
        let task_id = pending.task_id();
        assert_eq!(outcome(pending).await, Err(TaskError::Abandoned { task_id }));
    }
}

#[tokio::test]
async fn no_capacity_rejections_open_breaker() {
    let pool = start(config("echo READY; exit 0", 1)).await;
    wait_for(&pool, "worker dead", |s| s.dead_workers == 1).await;

    for _ in 0..5 {
        assert_eq!(
            pool.submit(email("nobody home")).await.unwrap_err(),
            SubmitError::NoWorkersAvailable
        );
    }
    match pool.submit(email("sixth")).await {
        Err(SubmitError::CircuitOpen { failures, .. }) => assert_eq!(failures, 5),
        other => panic!("Expected open breaker, got {other:?}"),
    }
    let stats = pool.stats().await;
    assert!(stats.circuit_breaker.is_open);
    assert_eq!(stats.total_tasks_failed, 0);
    pool.shutdown().await;
}

// ── Restarts ────────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_recycles_after_restart_threshold() {
    let pool = start(PoolConfig {
        restart_threshold: 2,
        ..config(ECHO, 1)
    })
    .await;
    let original_pid = pool.stats().await.worker(0).and_then(|w| w.pid);

    for i in 0..2 {
        let result = timeout(TEST_TIMEOUT, pool.classify(email(&format!("r{i}")))).await.unwrap();
        assert!(result.is_ok());
    }

    let stats = wait_for(&pool, "worker recycled", |s| {
        s.total_restarts == 1 && s.ready_workers == 1 && s.initializing_workers == 0
    })
    .await;
    let worker = stats.worker(0).unwrap();
    assert_eq!(worker.tasks_completed, 0);
    assert_ne!(worker.pid, original_pid);
    assert_eq!(stats.total_tasks_completed, 2);

    let again = timeout(TEST_TIMEOUT, pool.classify(email("after recycle"))).await.unwrap();
    assert!(again.is_ok());
    pool.shutdown().await;
}

#[tokio::test]
async fn restart_worker_replaces_process_and_fails_in_flight_task() {
    let pool = start(config(SILENT, 1)).await;
    let original_pid = pool.stats().await.worker(0).and_then(|w| w.pid);

    let pending = pool.submit(email("stuck")).await.unwrap();
    wait_for(&pool, "worker busy", |s| s.busy_workers == 1).await;

    timeout(TEST_TIMEOUT, pool.restart_worker(0)).await.unwrap().unwrap();
    assert_eq!(
        outcome(pending).await,
        Err(TaskError::WorkerRestarted { worker_id: 0 })
    );

    let stats = pool.stats().await;
    let worker = stats.worker(0).unwrap();
    assert_eq!(worker.status, WorkerStatus::Ready);
    assert_ne!(worker.pid, original_pid);
    assert_eq!(stats.total_restarts, 1);
    // A manual restart is not a classifier failure.
    assert_eq!(stats.circuit_breaker.consecutive_failures, 0);

    assert!(matches!(
        pool.restart_worker(7).await,
        Err(PoolError::WorkerNotFound { worker_id: 7 })
    ));
    pool.shutdown().await;
}

#[tokio::test]
async fn restart_worker_revives_dead_worker() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crashed");
    // First process crashes on its first task; the replacement behaves.
    let script = r#"echo READY; if [ -e "$MARKER" ]; then while IFS= read -r line; do printf '%s\n' "$line"; done; else touch "$MARKER"; read -r line; exit 1; fi"#;
    let mut cfg = config(script, 1);
    cfg.command = cfg.command.env("MARKER", marker.display().to_string());
    let pool = start(cfg).await;

    let pending = pool.submit(email("crash")).await.unwrap();
    assert!(matches!(outcome(pending).await, Err(TaskError::WorkerExited { .. })));
    assert_eq!(pool.stats().await.dead_workers, 1);

    timeout(TEST_TIMEOUT, pool.restart_worker(0)).await.unwrap().unwrap();
    let result = timeout(TEST_TIMEOUT, pool.classify(email("ok"))).await.unwrap();
    assert!(result.is_ok());
    pool.shutdown().await;
}

// ── Startup ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn startup_timeout_fails_initialization() {
    let result = timeout(
        TEST_TIMEOUT,
        Dispatcher::initialize(PoolConfig {
            startup_timeout: Duration::from_millis(200),
            ..config("exec sleep 30", 2)
        }),
    )
    .await
    .unwrap();

    match result.err() {
        Some(PoolError::InitializationFailed { worker_id, source }) => {
            assert_eq!(worker_id, 0);
            assert!(matches!(*source, PoolError::WorkerStartupTimeout { worker_id: 0, .. }));
        }
        other => panic!("Expected initialization failure, got {other:?}"),
    }
}

#[tokio::test]
async fn partial_startup_failure_stops_started_workers() {
    let dir = tempfile::tempdir().unwrap();
    let started = dir.path().join("started");
    let stopped = dir.path().join("stopped");
    // The first worker starts normally and records its clean exit; the second
    // sees the first one's marker and dies before READY.
    let script = r#"if [ -e "$STARTED" ]; then exit 7; fi; touch "$STARTED"; echo READY; while IFS= read -r line; do :; done; touch "$STOPPED""#;
    let mut cfg = config(script, 2);
    cfg.command = cfg
        .command
        .env("STARTED", started.display().to_string())
        .env("STOPPED", stopped.display().to_string());

    let result = timeout(TEST_TIMEOUT, Dispatcher::initialize(cfg)).await.unwrap();
    match result.err() {
        Some(PoolError::InitializationFailed { worker_id, source }) => {
            assert_eq!(worker_id, 1);
            assert!(matches!(
                *source,
                PoolError::WorkerExitedDuringStartup { worker_id: 1, code: Some(7) }
            ));
        }
        other => panic!("Expected initialization failure, got {other:?}"),
    }
    assert!(stopped.exists(), "worker 0 was not shut down");
}

// ── Shutdown ────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_sends_sigterm_to_unresponsive_worker() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("terminated");
    // Never reads stdin, so closing it is not enough to stop this worker.
    let script = r#"trap 'touch "$MARKER"; exit 0' TERM; echo READY; while :; do sleep 0.05; done"#;
    let mut cfg = config(script, 1);
    cfg.command = cfg.command.env("MARKER", marker.display().to_string());
    let pool = start(cfg).await;

    timeout(TEST_TIMEOUT, pool.shutdown()).await.unwrap();
    assert!(marker.exists(), "worker was killed without SIGTERM");
}

#[tokio::test]
async fn shutdown_is_idempotent_and_refuses_new_work() {
    let pool = start(config(ECHO, 2)).await;
    pool.shutdown().await;
    pool.shutdown().await;

    assert_eq!(
        pool.submit(email("late")).await.unwrap_err(),
        SubmitError::ShuttingDown
    );
    assert!(matches!(pool.restart_worker(0).await, Err(PoolError::ShuttingDown)));

    let stats = pool.stats().await;
    assert_eq!(stats.total_workers, 0);
    assert_eq!(stats.queue_length, 0);
}
