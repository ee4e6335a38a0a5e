//! Browser pool lifecycle against a stub backend.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dragnet::config::BrowserPoolConfig;
use dragnet::{
    BackendBrowser, BackendPage, BrowserBackend, BrowserPool, LaunchOptions, PageOptions,
};

#[derive(Default)]
struct StubBackend {
    launches: AtomicUsize,
    fail_next_launch: AtomicBool,
    browsers: parking_lot::Mutex<Vec<Arc<StubState>>>,
}

#[derive(Default)]
struct StubState {
    open_pages: AtomicUsize,
    closed: AtomicBool,
}

struct StubBrowser {
    state: Arc<StubState>,
    page_counter: AtomicUsize,
}

struct StubPage {
    id: String,
    closed: AtomicBool,
    state: Arc<StubState>,
}

#[async_trait]
impl BrowserBackend for StubBackend {
    async fn launch(&self, _options: LaunchOptions) -> Result<Box<dyn BackendBrowser>> {
        if self.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("stub launch failure"));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(StubState::default());
        self.browsers.lock().push(Arc::clone(&state));
        Ok(Box::new(StubBrowser {
            state,
            page_counter: AtomicUsize::new(0),
        }))
    }
}

#[async_trait]
impl BackendBrowser for StubBrowser {
    async fn new_page(&self) -> Result<Box<dyn BackendPage>> {
        let n = self.page_counter.fetch_add(1, Ordering::SeqCst);
        self.state.open_pages.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubPage {
            id: format!("stub_page_{n}"),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }

    async fn is_healthy(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendPage for StubPage {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_pages.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn test_config() -> BrowserPoolConfig {
    BrowserPoolConfig {
        max_browsers: 2,
        max_open_pages_per_instance: 2,
        retire_instance_after_page_count: 100,
        ..Default::default()
    }
}

#[tokio::test]
async fn pages_spread_over_instances_within_capacity() {
    let backend = Arc::new(StubBackend::default());
    let pool = BrowserPool::new(test_config(), Arc::clone(&backend) as Arc<dyn BrowserBackend>).unwrap();
    pool.start().await;

    let mut pages = Vec::new();
    for _ in 0..4 {
        pages.push(pool.new_page(PageOptions::default()).await.unwrap());
    }

    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 2);
    assert_eq!(stats.total_active_pages, 4);
    assert!(stats.total_active_pages <= stats.active_instances * 2);
    assert_eq!(backend.launches.load(Ordering::SeqCst), 2);

    // Every slot is taken: a fifth page waits until one is returned
    let fifth = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.new_page(PageOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fifth.is_finished(), "page acquired beyond capacity");

    pages.pop().unwrap().recycle().await;
    let handle = tokio::time::timeout(Duration::from_secs(2), fifth)
        .await
        .expect("fifth page never acquired")
        .unwrap()
        .unwrap();
    drop(handle);
    drop(pages);

    pool.destroy().await;
}

#[tokio::test]
async fn launch_failure_frees_the_slot_and_propagates() {
    let backend = Arc::new(StubBackend::default());
    let pool = BrowserPool::new(test_config(), Arc::clone(&backend) as Arc<dyn BrowserBackend>).unwrap();
    pool.start().await;

    backend.fail_next_launch.store(true, Ordering::SeqCst);
    let error = pool.new_page(PageOptions::default()).await;
    assert!(error.is_err());

    // The failed slot was freed: the next page launches a fresh instance
    let page = pool.new_page(PageOptions::default()).await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 1);
    assert_eq!(stats.launching_instances, 0);
    assert_eq!(stats.total_active_pages, 1);

    page.recycle().await;
    pool.destroy().await;
}

#[tokio::test]
async fn retired_instance_is_killed_after_pages_drain() {
    let backend = Arc::new(StubBackend::default());
    let pool = BrowserPool::new(test_config(), Arc::clone(&backend) as Arc<dyn BrowserBackend>).unwrap();
    pool.start().await;

    let page = pool.new_page(PageOptions::default()).await.unwrap();
    let instance_id = page.instance_id();

    pool.retire(instance_id).await;
    let stats = pool.stats().await;
    assert_eq!(stats.retired_instances, 1);
    assert_eq!(stats.active_instances, 0);

    // The open page keeps the instance alive through retirement
    assert!(!backend.browsers.lock()[0].closed.load(Ordering::SeqCst));

    page.recycle().await;
    // Settle delay (1s) plus slack before the kill lands
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(backend.browsers.lock()[0].closed.load(Ordering::SeqCst));
    let stats = pool.stats().await;
    assert_eq!(stats.retired_instances, 0);

    pool.destroy().await;
}

#[tokio::test]
async fn page_budget_retires_instance() {
    let backend = Arc::new(StubBackend::default());
    let config = BrowserPoolConfig {
        max_browsers: 2,
        max_open_pages_per_instance: 10,
        retire_instance_after_page_count: 2,
        ..Default::default()
    };
    let pool = BrowserPool::new(config, Arc::clone(&backend) as Arc<dyn BrowserBackend>).unwrap();
    pool.start().await;

    let first = pool.new_page(PageOptions::default()).await.unwrap();
    let second = pool.new_page(PageOptions::default()).await.unwrap();
    assert_eq!(first.instance_id(), second.instance_id());

    // The instance hit its lifetime page budget and stopped serving
    let stats = pool.stats().await;
    assert_eq!(stats.retired_instances, 1);

    // A third page comes from a fresh instance
    let third = pool.new_page(PageOptions::default()).await.unwrap();
    assert_ne!(third.instance_id(), first.instance_id());

    first.recycle().await;
    second.recycle().await;
    third.recycle().await;
    pool.destroy().await;
}

#[tokio::test]
async fn session_bound_instances_do_not_mix() {
    let backend = Arc::new(StubBackend::default());
    let pool = BrowserPool::new(test_config(), Arc::clone(&backend) as Arc<dyn BrowserBackend>).unwrap();
    pool.start().await;

    let a = pool
        .new_page(PageOptions {
            session_id: Some("session-a".to_string()),
            proxy_url: None,
        })
        .await
        .unwrap();
    let b = pool
        .new_page(PageOptions {
            session_id: Some("session-b".to_string()),
            proxy_url: None,
        })
        .await
        .unwrap();
    assert_ne!(a.instance_id(), b.instance_id());

    // Retiring by session only touches the bound instance
    pool.retire_for_session("session-a").await;
    let stats = pool.stats().await;
    assert_eq!(stats.retired_instances, 1);
    assert_eq!(stats.active_instances, 1);

    a.recycle().await;
    b.recycle().await;
    pool.destroy().await;
}

#[tokio::test]
async fn destroy_closes_every_instance() {
    let backend = Arc::new(StubBackend::default());
    let pool = BrowserPool::new(test_config(), Arc::clone(&backend) as Arc<dyn BrowserBackend>).unwrap();
    pool.start().await;

    let page = pool.new_page(PageOptions::default()).await.unwrap();
    drop(page);
    pool.destroy().await;

    for browser in backend.browsers.lock().iter() {
        assert!(browser.closed.load(Ordering::SeqCst));
    }
    assert!(pool.new_page(PageOptions::default()).await.is_err());
}
