//! Pool of long-lived browser instances.
//!
//! Instances live in an id-indexed arena; page handles carry the instance
//! id and resolve through the pool, so nothing holds a cyclic reference
//! into the instance table. Lifecycle is monotonic:
//! LAUNCHING → ACTIVE → RETIRED → KILLED.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{BackendBrowser, BackendPage, BrowserBackend, LaunchOptions};
use crate::config::BrowserPoolConfig;
use crate::utils::constants::INSTANCE_KILL_SETTLE_DELAY;

/// How often the reaper sweeps for idle or drained instances.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// How long `new_page` waits between capacity checks when every instance
/// slot is taken.
const CAPACITY_WAIT: Duration = Duration::from_millis(100);

/// Instance lifecycle states. Transitions never go backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Launching,
    Active,
    Retired,
    Killed,
}

/// Aggregate view of the instance arena.
#[derive(Debug, Clone, Copy)]
pub struct BrowserPoolStats {
    pub launching_instances: usize,
    pub active_instances: usize,
    pub retired_instances: usize,
    pub total_active_pages: usize,
}

struct InstanceRecord {
    state: InstanceState,
    /// Present once the launch completed
    browser: Option<Arc<dyn BackendBrowser>>,
    active_pages: usize,
    total_pages: u64,
    last_page_opened_at: Instant,
    /// Session this instance is bound to; pages are only served to
    /// requests carrying the same binding
    session_id: Option<String>,
    disk_cache_dir: Option<PathBuf>,
}

/// Binding constraints for a new page.
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    pub session_id: Option<String>,
    pub proxy_url: Option<String>,
}

/// Manages browser instances and hands out pages bound to them.
pub struct BrowserPool {
    config: BrowserPoolConfig,
    backend: Arc<dyn BrowserBackend>,
    instances: Mutex<HashMap<u64, InstanceRecord>>,
    next_instance_id: AtomicU64,
    /// Previously-used open pages awaiting reuse (`reuse_pages` only)
    idle_pages: Mutex<VecDeque<(u64, Arc<dyn BackendPage>)>>,
    /// Free-list of disk-cache directories from killed instances
    cache_dirs: Mutex<Vec<PathBuf>>,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
    retirement_listener: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig, backend: Arc<dyn BrowserBackend>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            backend,
            instances: Mutex::new(HashMap::new()),
            next_instance_id: AtomicU64::new(0),
            idle_pages: Mutex::new(VecDeque::new()),
            cache_dirs: Mutex::new(Vec::new()),
            reaper_handle: Mutex::new(None),
            retirement_listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Start the background reaper.
    pub async fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let reaper = tokio::spawn(async move {
            reaper_loop(pool).await;
        });
        *self.reaper_handle.lock().await = Some(reaper);
        info!(max_browsers = self.config.max_browsers, "browser pool started");
    }

    /// Retire instances whose bound session the session pool rotates out.
    pub async fn listen_for_session_retirements(
        self: &Arc<Self>,
        mut retirements: broadcast::Receiver<String>,
    ) {
        let pool = Arc::clone(self);
        let listener = tokio::spawn(async move {
            loop {
                match retirements.recv().await {
                    Ok(session_id) => pool.retire_for_session(&session_id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session retirement listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.retirement_listener.lock().await = Some(listener);
    }

    /// A page on an ACTIVE instance matching `options`.
    ///
    /// Prefers idle reused pages, then spare capacity on a live instance,
    /// then a fresh launch. Waits when every instance slot is occupied.
    pub async fn new_page(self: &Arc<Self>, options: PageOptions) -> Result<PageHandle> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("browser pool is destroyed"));
            }

            // Reuse an idle page when enabled; each candidate is verified
            // still open with its parent still active
            if self.config.reuse_pages
                && let Some(handle) = self.reuse_idle_page(&options).await
            {
                return Ok(handle);
            }

            // Spare capacity on an existing instance
            if let Some((instance_id, browser)) = self.reserve_existing_slot(&options).await {
                return self.open_page_on(instance_id, browser).await;
            }

            // Room for a new instance?
            match self.reserve_launch_slot(&options).await {
                Some(instance_id) => {
                    let browser = self.launch_reserved(instance_id, &options).await?;
                    return self.open_page_on(instance_id, browser).await;
                }
                None => {
                    debug!("browser pool at capacity, waiting for a slot");
                    tokio::time::sleep(CAPACITY_WAIT).await;
                }
            }
        }
    }

    /// Return a page to the pool: into the idle queue when `reuse_pages`,
    /// otherwise closed.
    pub async fn recycle_page(self: &Arc<Self>, handle: PageHandle) {
        handle.returned.store(true, Ordering::SeqCst);
        let page = Arc::clone(&handle.page);
        let instance_id = handle.instance_id;
        drop(handle);

        if self.config.reuse_pages && !page.is_closed() {
            let parent_active = {
                let instances = self.instances.lock().await;
                instances
                    .get(&instance_id)
                    .is_some_and(|r| r.state == InstanceState::Active)
            };
            if parent_active {
                self.idle_pages.lock().await.push_back((instance_id, page));
                return;
            }
        }

        self.close_page(instance_id, page.as_ref()).await;
    }

    /// Stop serving new pages from `instance_id`; open pages finish.
    pub async fn retire(&self, instance_id: u64) {
        let mut instances = self.instances.lock().await;
        if let Some(record) = instances.get_mut(&instance_id)
            && matches!(record.state, InstanceState::Launching | InstanceState::Active)
        {
            record.state = InstanceState::Retired;
            info!(instance = instance_id, "browser instance retired");
        }
    }

    /// Retire every instance bound to `session_id`.
    pub async fn retire_for_session(&self, session_id: &str) {
        let ids: Vec<u64> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .filter(|(_, r)| r.session_id.as_deref() == Some(session_id))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.retire(id).await;
        }
    }

    pub async fn stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let mut stats = BrowserPoolStats {
            launching_instances: 0,
            active_instances: 0,
            retired_instances: 0,
            total_active_pages: 0,
        };
        for record in instances.values() {
            match record.state {
                InstanceState::Launching => stats.launching_instances += 1,
                InstanceState::Active => {
                    stats.active_instances += 1;
                    stats.total_active_pages += record.active_pages;
                }
                InstanceState::Retired => stats.retired_instances += 1,
                InstanceState::Killed => {}
            }
        }
        stats
    }

    /// Tear the pool down: close every instance (escalating to a hard
    /// kill), close idle pages, and delete recycled cache directories.
    ///
    /// Hosts call this from their termination-signal handler; it embodies
    /// the terminate-then-hard-kill guarantee for tracked child processes.
    pub async fn destroy(self: &Arc<Self>) {
        info!("destroying browser pool");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.reaper_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.retirement_listener.lock().await.take() {
            handle.abort();
        }

        let idle: Vec<(u64, Arc<dyn BackendPage>)> =
            self.idle_pages.lock().await.drain(..).collect();
        for (instance_id, page) in idle {
            self.close_page(instance_id, page.as_ref()).await;
        }

        let ids: Vec<u64> = self.instances.lock().await.keys().copied().collect();
        for id in ids {
            self.kill_instance(id).await;
        }

        let cache_dirs: Vec<PathBuf> = self.cache_dirs.lock().await.drain(..).collect();
        for dir in cache_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("failed to remove cache dir {}: {}", dir.display(), e);
            }
        }

        info!("browser pool destroyed");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn reuse_idle_page(self: &Arc<Self>, options: &PageOptions) -> Option<PageHandle> {
        let found = {
            let mut idle = self.idle_pages.lock().await;
            let instances = self.instances.lock().await;
            let mut kept = VecDeque::new();
            let mut found = None;

            while let Some((instance_id, page)) = idle.pop_front() {
                if found.is_some() {
                    kept.push_back((instance_id, page));
                    continue;
                }
                let usable = !page.is_closed()
                    && instances.get(&instance_id).is_some_and(|r| {
                        r.state == InstanceState::Active && r.session_id == options.session_id
                    });
                if usable {
                    found = Some((instance_id, page));
                } else {
                    kept.push_back((instance_id, page));
                }
            }
            *idle = kept;
            found
        };

        let (instance_id, page) = found?;
        {
            let mut instances = self.instances.lock().await;
            if let Some(record) = instances.get_mut(&instance_id) {
                record.last_page_opened_at = Instant::now();
            }
        }
        debug!(instance = instance_id, "reusing idle page");
        Some(PageHandle {
            page,
            instance_id,
            pool: Arc::clone(self),
            returned: AtomicBool::new(false),
        })
    }

    /// Reserve a page slot on an ACTIVE instance with matching binding.
    async fn reserve_existing_slot(
        &self,
        options: &PageOptions,
    ) -> Option<(u64, Arc<dyn BackendBrowser>)> {
        let mut instances = self.instances.lock().await;
        for (id, record) in instances.iter_mut() {
            if record.state == InstanceState::Active
                && record.session_id == options.session_id
                && record.active_pages < self.config.max_open_pages_per_instance
                && let Some(browser) = &record.browser
            {
                record.active_pages += 1;
                return Some((*id, Arc::clone(browser)));
            }
        }
        None
    }

    /// Reserve an instance slot for launching; `None` when at capacity.
    ///
    /// The record is created with one page slot already reserved for the
    /// page the caller is about to open.
    async fn reserve_launch_slot(&self, options: &PageOptions) -> Option<u64> {
        let mut instances = self.instances.lock().await;
        let live = instances
            .values()
            .filter(|r| r.state != InstanceState::Killed)
            .count();
        if live >= self.config.max_browsers {
            return None;
        }

        let id = self.next_instance_id.fetch_add(1, Ordering::SeqCst);
        let disk_cache_dir = if self.config.recycle_disk_caches {
            Some(self.take_cache_dir())
        } else {
            None
        };
        instances.insert(
            id,
            InstanceRecord {
                state: InstanceState::Launching,
                browser: None,
                active_pages: 1,
                total_pages: 0,
                last_page_opened_at: Instant::now(),
                session_id: options.session_id.clone(),
                disk_cache_dir,
            },
        );
        Some(id)
    }

    /// Launch the browser for a reserved slot. On failure the slot is
    /// freed and the error propagates to the caller.
    async fn launch_reserved(
        &self,
        instance_id: u64,
        options: &PageOptions,
    ) -> Result<Arc<dyn BackendBrowser>> {
        let disk_cache_dir = {
            let instances = self.instances.lock().await;
            instances
                .get(&instance_id)
                .and_then(|r| r.disk_cache_dir.clone())
        };

        let launch = self
            .backend
            .launch(LaunchOptions {
                headless: self.config.headless,
                proxy_url: options.proxy_url.clone(),
                user_data_dir: None,
                disk_cache_dir: disk_cache_dir.clone(),
                extra_args: Vec::new(),
            })
            .await;

        let mut instances = self.instances.lock().await;
        match launch {
            Ok(browser) => {
                let browser: Arc<dyn BackendBrowser> = Arc::from(browser);
                let Some(record) = instances.get_mut(&instance_id) else {
                    // Destroyed while launching
                    drop(instances);
                    browser.kill().await;
                    return Err(anyhow::anyhow!("pool destroyed during launch"));
                };
                record.browser = Some(Arc::clone(&browser));
                // A retire that raced the launch wins; never regress
                if record.state == InstanceState::Launching {
                    record.state = InstanceState::Active;
                }
                debug!(instance = instance_id, "browser instance launched");
                Ok(browser)
            }
            Err(e) => {
                instances.remove(&instance_id);
                drop(instances);
                if let Some(dir) = disk_cache_dir {
                    self.cache_dirs.lock().await.push(dir);
                }
                Err(e).context("browser launch failed")
            }
        }
    }

    /// Open a page on an instance whose slot is already reserved.
    async fn open_page_on(
        self: &Arc<Self>,
        instance_id: u64,
        browser: Arc<dyn BackendBrowser>,
    ) -> Result<PageHandle> {
        match browser.new_page().await {
            Ok(page) => {
                let mut instances = self.instances.lock().await;
                if let Some(record) = instances.get_mut(&instance_id) {
                    record.total_pages += 1;
                    record.last_page_opened_at = Instant::now();
                    if record.total_pages >= self.config.retire_instance_after_page_count
                        && record.state == InstanceState::Active
                    {
                        info!(
                            instance = instance_id,
                            total_pages = record.total_pages,
                            "instance reached page budget, retiring"
                        );
                        record.state = InstanceState::Retired;
                    }
                }
                Ok(PageHandle {
                    page: Arc::from(page),
                    instance_id,
                    pool: Arc::clone(self),
                    returned: AtomicBool::new(false),
                })
            }
            Err(e) => {
                // Free the reserved slot
                self.handle_page_closed(instance_id).await;
                Err(e)
            }
        }
    }

    async fn close_page(self: &Arc<Self>, instance_id: u64, page: &dyn BackendPage) {
        if let Err(e) = page.close().await {
            debug!("page close failed (instance {instance_id}): {e}");
        }
        self.handle_page_closed(instance_id).await;
    }

    /// Decrement the page count; a drained RETIRED instance is scheduled
    /// for a kill after a short settle delay.
    async fn handle_page_closed(self: &Arc<Self>, instance_id: u64) {
        let schedule_kill = {
            let mut instances = self.instances.lock().await;
            let Some(record) = instances.get_mut(&instance_id) else {
                return;
            };
            record.active_pages = record.active_pages.saturating_sub(1);
            record.state == InstanceState::Retired && record.active_pages == 0
        };

        if schedule_kill {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(INSTANCE_KILL_SETTLE_DELAY).await;
                let still_drained = {
                    let instances = pool.instances.lock().await;
                    instances
                        .get(&instance_id)
                        .is_some_and(|r| r.state == InstanceState::Retired && r.active_pages == 0)
                };
                if still_drained {
                    pool.kill_instance(instance_id).await;
                }
            });
        }
    }

    async fn kill_instance(&self, instance_id: u64) {
        let (browser, cache_dir) = {
            let mut instances = self.instances.lock().await;
            let Some(record) = instances.get_mut(&instance_id) else {
                return;
            };
            if record.state == InstanceState::Killed {
                return;
            }
            record.state = InstanceState::Killed;
            (record.browser.take(), record.disk_cache_dir.take())
        };

        if let Some(browser) = browser {
            if let Err(e) = browser.close().await {
                warn!(instance = instance_id, "graceful close failed, killing: {e}");
                browser.kill().await;
            }
        }
        if let Some(dir) = cache_dir {
            debug!(
                instance = instance_id,
                "returning cache dir {} to free list",
                dir.display()
            );
            self.cache_dirs.lock().await.push(dir);
        }
        info!(instance = instance_id, "browser instance killed");
    }

    fn take_cache_dir(&self) -> PathBuf {
        if let Some(dir) = self.cache_dirs.try_lock().ok().and_then(|mut v| v.pop()) {
            debug!("reusing recycled cache dir {}", dir.display());
            return dir;
        }
        tempfile::Builder::new()
            .prefix("dragnet_cache_")
            .tempdir()
            .map(tempfile::TempDir::into_path)
            .unwrap_or_else(|_| std::env::temp_dir().join("dragnet_cache_fallback"))
    }
}

/// Background sweep: kill instances idle past the configured deadline and
/// drained retired instances the settle tasks may have missed.
async fn reaper_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !pool.shutdown.load(Ordering::SeqCst) {
        interval.tick().await;
        let now = Instant::now();

        let to_kill: Vec<u64> = {
            let instances = pool.instances.lock().await;
            instances
                .iter()
                .filter(|(_, r)| match r.state {
                    InstanceState::Killed | InstanceState::Launching => false,
                    InstanceState::Retired => r.active_pages == 0,
                    InstanceState::Active => {
                        now.duration_since(r.last_page_opened_at) > pool.config.kill_instance_after
                    }
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in to_kill {
            pool.kill_instance(id).await;
        }

        // Drop idle pages whose parent is no longer serving
        let stale: Vec<(u64, Arc<dyn BackendPage>)> = {
            let mut idle = pool.idle_pages.lock().await;
            let instances = pool.instances.lock().await;
            let mut kept = VecDeque::new();
            let mut stale = Vec::new();
            while let Some((instance_id, page)) = idle.pop_front() {
                let healthy = !page.is_closed()
                    && instances
                        .get(&instance_id)
                        .is_some_and(|r| r.state == InstanceState::Active);
                if healthy {
                    kept.push_back((instance_id, page));
                } else {
                    stale.push((instance_id, page));
                }
            }
            *idle = kept;
            stale
        };
        for (instance_id, page) in stale {
            pool.close_page(instance_id, page.as_ref()).await;
        }
    }

    debug!("browser pool reaper exiting");
}

/// A page borrowed from the pool.
///
/// Holds the instance id, not the instance: resolution goes through the
/// pool on every operation. Dropping the handle without recycling closes
/// the page in the background.
pub struct PageHandle {
    page: Arc<dyn BackendPage>,
    instance_id: u64,
    pool: Arc<BrowserPool>,
    returned: AtomicBool,
}

impl PageHandle {
    #[must_use]
    pub fn page(&self) -> &dyn BackendPage {
        self.page.as_ref()
    }

    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Explicitly return the page to the pool (preferred over dropping).
    pub async fn recycle(self) {
        let pool = Arc::clone(&self.pool);
        pool.recycle_page(self).await;
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.returned.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let page = Arc::clone(&self.page);
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            pool.close_page(instance_id, page.as_ref()).await;
        });
    }
}
