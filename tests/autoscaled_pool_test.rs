//! Autoscaled pool behavior: termination, scaling, rate limiting,
//! pause/resume and abort.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dragnet::AutoscaledPool;
use dragnet::config::AutoscaledPoolConfig;

use common::{StaticProbe, fast_pool_config};

/// Pool that runs `total` no-op tasks and then reports finished.
fn counting_pool(
    config: AutoscaledPoolConfig,
    probe: Arc<StaticProbe>,
    total: usize,
) -> (Arc<AutoscaledPool>, Arc<AtomicUsize>) {
    let started = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let started_for_task = Arc::clone(&started);
    let done_for_task = Arc::clone(&done);
    let started_for_ready = Arc::clone(&started);
    let done_for_finished = Arc::clone(&done);

    let pool = AutoscaledPool::new(
        config,
        probe,
        Arc::new(move |_context| {
            started_for_task.fetch_add(1, Ordering::SeqCst);
            let done = Arc::clone(&done_for_task);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }),
        Arc::new(move || {
            let ready = started_for_ready.load(Ordering::SeqCst) < total;
            Box::pin(async move { ready })
        }),
        Arc::new(move || {
            let finished = done_for_finished.load(Ordering::SeqCst) >= total;
            Box::pin(async move { finished })
        }),
    )
    .unwrap();

    (pool, started)
}

#[tokio::test]
async fn pool_runs_all_tasks_and_resolves() {
    let probe = StaticProbe::new(true, true);
    let (pool, started) = counting_pool(fast_pool_config(), probe, 5);

    tokio::time::timeout(Duration::from_secs(5), pool.run())
        .await
        .expect("pool did not resolve")
        .expect("pool failed");

    assert_eq!(started.load(Ordering::SeqCst), 5);
    assert_eq!(pool.current_concurrency(), 0);
}

#[tokio::test]
async fn fatal_task_error_rejects_run() {
    let probe = StaticProbe::new(true, true);
    let pool = AutoscaledPool::new(
        fast_pool_config(),
        probe,
        Arc::new(|_context| Box::pin(async { Err(anyhow::anyhow!("infrastructure corrupted")) })),
        Arc::new(|| Box::pin(async { true })),
        Arc::new(|| Box::pin(async { false })),
    )
    .unwrap();

    let error = tokio::time::timeout(Duration::from_secs(5), pool.run())
        .await
        .expect("pool did not settle")
        .expect_err("fatal error should reject run");
    assert!(error.to_string().contains("infrastructure corrupted"));
}

#[tokio::test]
async fn desired_concurrency_scales_down_under_pressure() {
    // Continuous overload, as if the snapshotter kept reporting memory
    // pressure: three scaling intervals must shrink desired by >= 3
    let probe = StaticProbe::new(false, false);
    let config = AutoscaledPoolConfig {
        desired_concurrency: Some(10),
        min_concurrency: 1,
        max_concurrency: 50,
        maybe_run_interval: Duration::from_millis(10),
        autoscale_interval: Duration::from_millis(30),
        ..Default::default()
    };

    let pool = AutoscaledPool::new(
        config,
        probe,
        Arc::new(|mut context| {
            Box::pin(async move {
                context.cancelled().await;
                Ok(())
            })
        }),
        Arc::new(|| Box::pin(async { true })),
        Arc::new(|| Box::pin(async { false })),
    )
    .unwrap();

    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };

    // First autoscale tick is consumed at start; wait out four periods
    tokio::time::sleep(Duration::from_millis(150)).await;
    let desired = pool.desired_concurrency();
    assert!(desired <= 7, "expected >= 3 decrease from 10, got {desired}");
    assert!(desired >= 1);

    pool.abort();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn desired_concurrency_grows_monotonically_when_ok() {
    let probe = StaticProbe::new(true, true);
    let config = AutoscaledPoolConfig {
        desired_concurrency: Some(2),
        min_concurrency: 1,
        max_concurrency: 8,
        maybe_run_interval: Duration::from_millis(5),
        autoscale_interval: Duration::from_millis(30),
        ..Default::default()
    };

    // Tasks park until cancelled, keeping the pool saturated so the
    // scale-up precondition (current close to desired) holds
    let pool = AutoscaledPool::new(
        config,
        probe,
        Arc::new(|mut context| {
            Box::pin(async move {
                context.cancelled().await;
                Ok(())
            })
        }),
        Arc::new(|| Box::pin(async { true })),
        Arc::new(|| Box::pin(async { false })),
    )
    .unwrap();

    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };

    let mut previous = pool.desired_concurrency();
    let mut grew = false;
    for _ in 0..12 {
        tokio::time::sleep(Duration::from_millis(35)).await;
        let desired = pool.desired_concurrency();
        assert!(desired >= previous, "desired decreased while system OK");
        assert!(desired <= 8, "desired exceeded max_concurrency");
        grew |= desired > previous;
        previous = desired;
    }
    assert!(grew, "desired never grew despite saturation");

    pool.abort();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn rate_limit_bounds_task_starts() {
    let probe = StaticProbe::new(true, true);
    let config = AutoscaledPoolConfig {
        desired_concurrency: Some(10),
        max_concurrency: 10,
        maybe_run_interval: Duration::from_millis(5),
        autoscale_interval: Duration::from_secs(60),
        max_tasks_per_minute: Some(3),
        ..Default::default()
    };

    let started = Arc::new(AtomicUsize::new(0));
    let started_in_task = Arc::clone(&started);
    let pool = AutoscaledPool::new(
        config,
        probe,
        Arc::new(move |_context| {
            started_in_task.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }),
        Arc::new(|| Box::pin(async { true })),
        Arc::new(|| Box::pin(async { false })),
    )
    .unwrap();

    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };

    // A 3/min bucket starts full: 3 immediate starts, then ~0.05/s refill
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        started.load(Ordering::SeqCst) <= 3,
        "rate limit exceeded: {} starts",
        started.load(Ordering::SeqCst)
    );

    pool.abort();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn pause_drains_and_resume_continues() {
    let probe = StaticProbe::new(true, true);
    let started = Arc::new(AtomicUsize::new(0));
    let started_in_task = Arc::clone(&started);

    let config = AutoscaledPoolConfig {
        desired_concurrency: Some(2),
        max_concurrency: 2,
        maybe_run_interval: Duration::from_millis(5),
        autoscale_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let pool = AutoscaledPool::new(
        config,
        probe,
        Arc::new(move |_context| {
            started_in_task.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
        }),
        Arc::new(|| Box::pin(async { true })),
        Arc::new(|| Box::pin(async { false })),
    )
    .unwrap();

    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(pool.pause(Duration::from_secs(2)).await, "pause timed out");
    assert_eq!(pool.current_concurrency(), 0);

    let after_pause = started.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        started.load(Ordering::SeqCst),
        after_pause,
        "tasks started while paused"
    );

    pool.resume();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        started.load(Ordering::SeqCst) > after_pause,
        "no tasks started after resume"
    );

    pool.abort();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn abort_cancels_in_flight_tasks() {
    let probe = StaticProbe::new(true, true);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let cancelled_in_task = Arc::clone(&cancelled);

    let pool = AutoscaledPool::new(
        fast_pool_config(),
        probe,
        Arc::new(move |mut context| {
            let cancelled = Arc::clone(&cancelled_in_task);
            Box::pin(async move {
                context.cancelled().await;
                cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }),
        Arc::new(|| Box::pin(async { true })),
        Arc::new(|| Box::pin(async { false })),
    )
    .unwrap();

    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.abort();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("run did not return after abort")
        .unwrap()
        .unwrap();

    // Give the signalled tasks a moment to observe cancellation
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cancelled.load(Ordering::SeqCst) > 0, "no task saw the signal");
}
