//! End-to-end crawler scenarios over the in-memory frontier backends.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dragnet::config::CrawlerConfig;
use dragnet::storage::KeyValueStore;
use dragnet::{
    Crawler, FailedRequestContext, HandlerResult, MemoryKeyValueStore, MemoryRequestQueue,
    Request, RequestList, RequestListOptions, RequestListSource, RequestQueue, SystemEvent,
};

use common::{StaticProbe, fast_pool_config};

fn test_config() -> CrawlerConfig {
    CrawlerConfig {
        autoscaled_pool: fast_pool_config(),
        handle_request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn serial_config() -> CrawlerConfig {
    let mut config = test_config();
    config.autoscaled_pool.min_concurrency = 1;
    config.autoscaled_pool.max_concurrency = 1;
    config
}

async fn seeded_queue(urls: &[&str]) -> Arc<MemoryRequestQueue> {
    let queue = Arc::new(MemoryRequestQueue::new());
    for url in urls {
        queue
            .add_request(Request::new(*url).unwrap(), false)
            .await
            .unwrap();
    }
    queue
}

fn recording_handler() -> (
    dragnet::crawler::HandleRequestFn,
    Arc<parking_lot::Mutex<Vec<String>>>,
) {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    let handler: dragnet::crawler::HandleRequestFn = Arc::new(move |context| {
        seen_in_handler.lock().push(context.request.url.clone());
        Box::pin(async { Ok(HandlerResult::default()) })
    });
    (handler, seen)
}

#[tokio::test]
async fn happy_path_handles_every_seed_exactly_once() {
    let queue = seeded_queue(&["https://a.test/", "https://b.test/", "https://c.test/"]).await;
    let (handler, seen) = recording_handler();

    let failures = Arc::new(AtomicUsize::new(0));
    let failures_in_handler = Arc::clone(&failures);

    let crawler = Crawler::builder()
        .config(test_config())
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(handler)
        .handle_failed_request_fn(Arc::new(move |_context: FailedRequestContext| {
            failures_in_handler.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .expect("crawl did not finish")
        .expect("crawl failed");

    let mut urls = seen.lock().clone();
    urls.sort();
    assert_eq!(
        urls,
        vec!["https://a.test/", "https://b.test/", "https://c.test/"]
    );
    assert_eq!(stats.requests_handled, 3);
    assert_eq!(stats.requests_failed, 0);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert!(queue.is_finished().await.unwrap());
}

#[tokio::test]
async fn retry_budget_is_honored_then_failure_handler_runs_once() {
    let queue = seeded_queue(&["https://u.test/"]).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_in_handler = Arc::clone(&invocations);
    let failed: Arc<parking_lot::Mutex<Vec<FailedRequestContext>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let failed_in_handler = Arc::clone(&failed);

    let crawler = Crawler::builder()
        .config(test_config())
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(Arc::new(move |_context| {
            invocations_in_handler.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        }))
        .handle_failed_request_fn(Arc::new(move |context: FailedRequestContext| {
            failed_in_handler.lock().push(context);
            Box::pin(async { Ok(()) })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .expect("crawl did not finish")
        .expect("crawl failed");

    // 1 initial attempt + 3 retries
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(stats.retries, 3);

    let failed = failed.lock();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.contains("boom"));
    assert_eq!(failed[0].request.retry_count, 3);
    assert_eq!(failed[0].request.error_messages.len(), 4);
    assert!(queue.is_finished().await.unwrap());
}

#[tokio::test]
async fn no_retry_requests_fail_immediately() {
    let queue = Arc::new(MemoryRequestQueue::new());
    let request = Request::builder("https://u.test/")
        .no_retry(true)
        .build()
        .unwrap();
    queue.add_request(request, false).await.unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_in_handler = Arc::clone(&invocations);
    let failures = Arc::new(AtomicUsize::new(0));
    let failures_in_handler = Arc::clone(&failures);

    let crawler = Crawler::builder()
        .config(test_config())
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(Arc::new(move |_context| {
            invocations_in_handler.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(anyhow::anyhow!("blocked")) })
        }))
        .handle_failed_request_fn(Arc::new(move |_context: FailedRequestContext| {
            failures_in_handler.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn list_requests_flow_through_the_queue_forefront_first() {
    let list = RequestList::open(
        vec![RequestListSource::Requests(vec![
            Request::new("https://l1.test/").unwrap(),
            Request::new("https://l2.test/").unwrap(),
        ])],
        RequestListOptions::default(),
    )
    .await
    .unwrap();
    let queue = seeded_queue(&["https://q1.test/"]).await;

    let (handler, seen) = recording_handler();
    let crawler = Crawler::builder()
        .config(serial_config())
        .request_list(Arc::new(list))
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(handler)
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .unwrap()
        .unwrap();

    // List items unify into the queue ahead of pre-existing work, and
    // everything is handled exactly once
    assert_eq!(
        seen.lock().clone(),
        vec!["https://l1.test/", "https://l2.test/", "https://q1.test/"]
    );
    assert_eq!(stats.requests_handled, 3);
    assert_eq!(queue.handled_count().await.unwrap(), 3);
}

#[tokio::test]
async fn max_requests_per_crawl_stops_the_run_early() {
    let queue = seeded_queue(&[
        "https://r1.test/",
        "https://r2.test/",
        "https://r3.test/",
        "https://r4.test/",
    ])
    .await;

    let mut config = serial_config();
    config.max_requests_per_crawl = Some(2);

    let (handler, seen) = recording_handler();
    let crawler = Crawler::builder()
        .config(config)
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(handler)
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .unwrap()
        .unwrap();

    // In-flight overshoot is bounded by concurrency (1 here)
    let handled = stats.requests_handled;
    assert!((2..=3).contains(&handled), "handled {handled} requests");
    assert!(seen.lock().len() as u64 <= 3);
    // The untouched tail stays pending in the queue
    assert!(!queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn abort_reclaims_in_flight_requests_without_counting_retries() {
    let queue = seeded_queue(&["https://slow.test/"]).await;

    let crawler = Crawler::builder()
        .config(test_config())
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(Arc::new(|_context| {
            Box::pin(async {
                // Parks until the abort cancellation wins the race
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HandlerResult::default())
            })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let crawler = Arc::new(crawler);
    let runner = {
        let crawler = Arc::clone(&crawler);
        tokio::spawn(async move { crawler.run().await })
    };

    // Let the handler start, then abort
    tokio::time::sleep(Duration::from_millis(200)).await;
    crawler.abort();

    let stats = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run did not return after abort")
        .unwrap()
        .unwrap();
    assert_eq!(stats.requests_handled, 0);

    // The in-flight request went back to pending with its retry count
    // untouched
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = queue.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(reclaimed.url, "https://slow.test/");
    assert_eq!(reclaimed.retry_count, 0);
    assert!(reclaimed.error_messages.is_empty());
}

#[tokio::test]
async fn handler_timeout_counts_as_transient_failure() {
    let queue = seeded_queue(&["https://hang.test/"]).await;

    let mut config = test_config();
    config.handle_request_timeout = Duration::from_millis(50);
    config.max_request_retries = 1;

    let failed: Arc<parking_lot::Mutex<Vec<FailedRequestContext>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let failed_in_handler = Arc::clone(&failed);

    let crawler = Crawler::builder()
        .config(config)
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(Arc::new(|_context| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HandlerResult::default())
            })
        }))
        .handle_failed_request_fn(Arc::new(move |context: FailedRequestContext| {
            failed_in_handler.lock().push(context);
            Box::pin(async { Ok(()) })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .unwrap()
        .unwrap();

    let failed = failed.lock();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.contains("timed out"));
    assert_eq!(failed[0].request.retry_count, 1);
}

#[tokio::test]
async fn failing_failure_handler_terminates_the_run() {
    let queue = seeded_queue(&["https://u.test/"]).await;

    let mut config = test_config();
    config.max_request_retries = 0;

    let crawler = Crawler::builder()
        .config(config)
        .request_queue(Arc::clone(&queue) as Arc<dyn RequestQueue>)
        .handle_request_fn(Arc::new(|_context| {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        }))
        .handle_failed_request_fn(Arc::new(|_context: FailedRequestContext| {
            Box::pin(async { Err(anyhow::anyhow!("failure handler exploded")) })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let error = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .expect("run did not settle")
        .expect_err("unknown state must reject the run");
    assert!(error.to_string().contains("unknown state"));
}

#[tokio::test]
async fn migration_event_pauses_and_persists_list_state() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let list = RequestList::open(
        vec![RequestListSource::Requests(vec![
            Request::new("https://a.test/").unwrap(),
            Request::new("https://b.test/").unwrap(),
            Request::new("https://c.test/").unwrap(),
        ])],
        RequestListOptions {
            keep_duplicates: false,
            persist_state_key: Some("list-state".to_string()),
            store: Some(Arc::clone(&store)),
        },
    )
    .await
    .unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_handler = Arc::clone(&handled);

    let crawler = Crawler::builder()
        .config(serial_config())
        .request_list(Arc::new(list))
        .handle_request_fn(Arc::new(move |_context| {
            let handled = Arc::clone(&handled_in_handler);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerResult::default())
            })
        }))
        .system_probe(StaticProbe::new(true, true))
        .build()
        .unwrap();

    let crawler = Arc::new(crawler);
    let bus = crawler.event_bus();
    let runner = {
        let crawler = Arc::clone(&crawler);
        tokio::spawn(async move { crawler.run().await })
    };

    // Let at least one request complete, then signal migration
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.publish(SystemEvent::migrating()).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // In-flight work drained within the grace period and state was
    // persisted; the pool stays paused for the migration
    assert!(
        store.get_value("list-state").await.unwrap().is_some(),
        "list state was not persisted on migration"
    );
    let handled_at_pause = handled.load(Ordering::SeqCst);
    assert!(handled_at_pause >= 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handled.load(Ordering::SeqCst), handled_at_pause);

    crawler.abort();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run did not end after abort")
        .unwrap()
        .unwrap();
}
