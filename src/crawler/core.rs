//! The crawler engine: composes the frontier, the autoscaled pool, the
//! session and browser pools, and the event bus into one run loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use super::handlers::{
    CrawlingContext, FailedRequestContext, HandleFailedRequestFn, HandleRequestFn, HandlerResult,
    default_failed_request_handler,
};
use crate::autoscaling::pool::TaskContext;
use crate::autoscaling::{AutoscaledPool, PoolState, Snapshotter, SystemProbe, SystemStatus};
use crate::browser::{BrowserPool, PageOptions};
use crate::config::{ConfigError, CrawlerConfig};
use crate::events::{EventBus, ShutdownReason, SystemEvent};
use crate::request::Request;
use crate::request_list::RequestList;
use crate::request_queue::RequestQueue;
use crate::session::{SessionHandle, SessionPool};
use crate::utils::constants::{MIGRATION_GRACE_PERIOD, PERSIST_STATE_INTERVAL};

/// Final numbers for one crawl run.
#[derive(Debug, Clone, Copy)]
pub struct CrawlerStats {
    /// Requests marked handled, terminal failures included
    pub requests_handled: u64,
    /// Requests dispatched to the failure handler
    pub requests_failed: u64,
    /// Retries performed across all requests
    pub retries: u64,
    pub duration: Duration,
}

enum HandlerOutcome {
    Success(HandlerResult),
    Failure(String),
    Cancelled,
}

struct CrawlerInner {
    config: CrawlerConfig,
    request_list: Option<Arc<RequestList>>,
    request_queue: Option<Arc<dyn RequestQueue>>,
    handle_request_fn: HandleRequestFn,
    handle_failed_request_fn: HandleFailedRequestFn,
    session_pool: Option<Arc<SessionPool>>,
    browser_pool: Option<Arc<BrowserPool>>,
    event_bus: EventBus,
    probe_override: Option<Arc<dyn SystemProbe>>,
    pool: parking_lot::Mutex<Option<Arc<AutoscaledPool>>>,
    snapshotter: parking_lot::Mutex<Option<Arc<Snapshotter>>>,
    running: AtomicBool,
    handled_count: AtomicU64,
    failed_count: AtomicU64,
    retry_count: AtomicU64,
}

/// Request scheduling and execution engine.
///
/// Construction is through [`Crawler::builder`]; at least one of a
/// request list and a request queue is required. `run()` drives the
/// autoscaled pool until the frontier is drained or the crawl aborts.
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl Crawler {
    #[must_use]
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::default()
    }

    /// A bus handle for hosts: emit `migrating`, subscribe to
    /// `persistState`, and so on.
    #[must_use]
    pub fn event_bus(&self) -> EventBus {
        self.inner.event_bus.clone()
    }

    /// Requests handled so far (terminal failures included).
    #[must_use]
    pub fn handled_requests_count(&self) -> u64 {
        self.inner.handled_count.load(Ordering::SeqCst)
    }

    /// Abort the crawl: in-flight handlers are cancelled, their requests
    /// reclaimed with their original retry count.
    pub fn abort(&self) {
        self.inner.event_bus.publish_lossy(SystemEvent::aborting());
        if let Some(pool) = self.inner.pool.lock().clone() {
            pool.abort();
        }
    }

    /// Drive the crawl to completion.
    pub async fn run(&self) -> Result<CrawlerStats> {
        let inner = Arc::clone(&self.inner);
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("crawler is already running"));
        }
        let started_at = Instant::now();

        // Restart semantics: the queue's count wins when one is bound
        let initial_handled = if let Some(queue) = &inner.request_queue {
            queue.handled_count().await.unwrap_or_else(|e| {
                warn!("could not read queue handled count: {e}");
                0
            })
        } else if let Some(list) = &inner.request_list {
            list.handled_count().await
        } else {
            0
        };
        inner.handled_count.store(initial_handled, Ordering::SeqCst);

        if let Some(sessions) = &inner.session_pool {
            sessions
                .initialize()
                .await
                .context("failed to restore session pool state")?;
        }
        if let (Some(sessions), Some(browsers)) = (&inner.session_pool, &inner.browser_pool) {
            browsers
                .listen_for_session_retirements(sessions.subscribe_retirements())
                .await;
        }

        let probe: Arc<dyn SystemProbe> = match &inner.probe_override {
            Some(probe) => Arc::clone(probe),
            None => {
                let snapshotter = Snapshotter::new(inner.config.snapshotter.clone());
                snapshotter.start().await;
                *inner.snapshotter.lock() = Some(Arc::clone(&snapshotter));
                Arc::new(SystemStatus::new(
                    inner.config.system_status.clone(),
                    snapshotter,
                    inner.config.snapshotter.cpu_sample_window,
                ))
            }
        };

        let pool = {
            let run_inner = Arc::clone(&inner);
            let ready_inner = Arc::clone(&inner);
            let finished_inner = Arc::clone(&inner);
            AutoscaledPool::new(
                inner.config.autoscaled_pool.clone(),
                probe,
                Arc::new(move |task_context| {
                    let inner = Arc::clone(&run_inner);
                    Box::pin(async move { inner.run_task(task_context).await })
                }),
                Arc::new(move || {
                    let inner = Arc::clone(&ready_inner);
                    Box::pin(async move { !inner.limit_reached() && inner.has_pending_work().await })
                }),
                Arc::new(move || {
                    let inner = Arc::clone(&finished_inner);
                    Box::pin(
                        async move { inner.limit_reached() || inner.frontier_finished().await },
                    )
                }),
            )?
        };
        *inner.pool.lock() = Some(Arc::clone(&pool));

        let listener = spawn_event_listener(Arc::clone(&inner), Arc::clone(&pool));
        let ticker = spawn_persist_ticker(Arc::clone(&inner));

        info!("crawler starting");
        let outcome = pool.run().await;

        ticker.abort();
        inner.persist_all().await;

        let reason = match &outcome {
            Ok(()) if pool.state() == PoolState::Aborted => ShutdownReason::Aborted,
            Ok(()) => ShutdownReason::CrawlCompleted,
            Err(e) => ShutdownReason::Error(format!("{e:#}")),
        };
        inner.event_bus.shutdown_gracefully(reason).await;
        listener.abort();

        let snapshotter = inner.snapshotter.lock().clone();
        if let Some(snapshotter) = snapshotter {
            snapshotter.stop().await;
        }
        inner.running.store(false, Ordering::SeqCst);

        let stats = CrawlerStats {
            requests_handled: inner.handled_count.load(Ordering::SeqCst),
            requests_failed: inner.failed_count.load(Ordering::SeqCst),
            retries: inner.retry_count.load(Ordering::SeqCst),
            duration: started_at.elapsed(),
        };
        match outcome {
            Ok(()) => {
                info!(
                    "crawl finished in {:?}: {} handled, {} failed, {} retries",
                    stats.duration, stats.requests_handled, stats.requests_failed, stats.retries
                );
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }
}

impl CrawlerInner {
    fn limit_reached(&self) -> bool {
        match self.config.max_requests_per_crawl {
            Some(max) => self.handled_count.load(Ordering::SeqCst) >= max,
            None => false,
        }
    }

    async fn has_pending_work(&self) -> bool {
        if let Some(list) = &self.request_list
            && !list.is_empty().await
        {
            return true;
        }
        if let Some(queue) = &self.request_queue {
            match queue.is_empty().await {
                Ok(empty) => return !empty,
                Err(e) => {
                    warn!("queue is_empty check failed: {e}");
                    return false;
                }
            }
        }
        false
    }

    async fn frontier_finished(&self) -> bool {
        if let Some(list) = &self.request_list
            && !list.is_finished().await
        {
            return false;
        }
        if let Some(queue) = &self.request_queue {
            match queue.is_finished().await {
                Ok(finished) => return finished,
                Err(e) => {
                    warn!("queue is_finished check failed: {e}");
                    return false;
                }
            }
        }
        true
    }

    /// Unified next-request: when both sources are bound, list items are
    /// transferred into the queue (forefront) first, so retries and
    /// at-most-once handling are tracked in one place.
    async fn fetch_next_request(&self) -> Option<Request> {
        if let (Some(list), Some(queue)) = (&self.request_list, &self.request_queue) {
            if let Some(request) = list.fetch_next_request().await {
                match queue.add_request(request.clone(), true).await {
                    Ok(_) => {
                        if let Err(e) = list.mark_request_handled(&request).await {
                            warn!("list bookkeeping after queue transfer failed: {e}");
                        }
                    }
                    Err(e) => {
                        // Skip this tick; the request stays in the list
                        warn!("transferring list request to queue failed: {e}");
                        if let Err(e) = list.reclaim_request(&request).await {
                            error!("could not reclaim {} to the list: {e}", request.url);
                        }
                        return None;
                    }
                }
            }
            return match queue.fetch_next_request().await {
                Ok(request) => request,
                Err(e) => {
                    warn!("queue fetch failed: {e}");
                    None
                }
            };
        }

        if let Some(queue) = &self.request_queue {
            return match queue.fetch_next_request().await {
                Ok(request) => request,
                Err(e) => {
                    warn!("queue fetch failed: {e}");
                    None
                }
            };
        }
        if let Some(list) = &self.request_list {
            return list.fetch_next_request().await;
        }
        None
    }

    async fn mark_handled(&self, request: &Request) -> bool {
        let result = if let Some(queue) = &self.request_queue {
            queue
                .mark_request_handled(request)
                .await
                .map_err(anyhow::Error::from)
        } else if let Some(list) = &self.request_list {
            list.mark_request_handled(request).await
        } else {
            Ok(())
        };
        match result {
            Ok(()) => {
                self.handled_count.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                // The request may be served again later; at-least-once
                warn!("mark_request_handled failed for {}: {e}", request.url);
                false
            }
        }
    }

    async fn reclaim(&self, request: &Request, forefront: bool) {
        let result = if let Some(queue) = &self.request_queue {
            queue
                .reclaim_request(request, forefront)
                .await
                .map_err(anyhow::Error::from)
        } else if let Some(list) = &self.request_list {
            list.reclaim_request(request).await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!("reclaim_request failed for {}: {e}", request.url);
        }
    }

    /// One pool task: fetch, acquire session and page, run the handler
    /// under cancellation and timeout, then settle the request.
    ///
    /// Returns `Err` only for the unknown-state case, which aborts the
    /// whole pool.
    async fn run_task(self: &Arc<Self>, mut task_context: TaskContext) -> Result<()> {
        let Some(mut request) = self.fetch_next_request().await else {
            return Ok(());
        };

        let session = match &self.session_pool {
            Some(pool) => Some(pool.session().await),
            None => None,
        };

        let page = match &self.browser_pool {
            Some(pool) => {
                let options = PageOptions {
                    session_id: session.as_ref().map(|s| s.id().to_string()),
                    proxy_url: session
                        .as_ref()
                        .and_then(|s| s.proxy_url().map(str::to_string)),
                };
                match pool.new_page(options).await {
                    Ok(handle) => Some(Arc::new(handle)),
                    Err(e) => {
                        // A launch failure is a transient handler error
                        return self
                            .settle_failure(
                                request,
                                format!("browser page acquisition failed: {e:#}"),
                                session.as_ref(),
                            )
                            .await;
                    }
                }
            }
            None => None,
        };

        let context = CrawlingContext {
            request: request.clone(),
            session: session.clone(),
            page: page.clone(),
        };
        let handler_future = (self.handle_request_fn)(context);
        let timeout = self.config.handle_request_timeout;

        let outcome = tokio::select! {
            _ = task_context.cancelled() => HandlerOutcome::Cancelled,
            result = tokio::time::timeout(timeout, handler_future) => match result {
                Ok(Ok(handler_result)) => HandlerOutcome::Success(handler_result),
                Ok(Err(e)) => HandlerOutcome::Failure(format!("{e:#}")),
                Err(_) => HandlerOutcome::Failure(format!(
                    "request handler timed out after {timeout:?}"
                )),
            },
        };

        // Give the page back before any bookkeeping; if the handler still
        // holds a clone, the drop path will close it instead
        if let (Some(pool), Some(page)) = (&self.browser_pool, page)
            && let Ok(handle) = Arc::try_unwrap(page)
        {
            pool.recycle_page(handle).await;
        }

        match outcome {
            HandlerOutcome::Success(handler_result) => {
                if let Some(loaded_url) = handler_result.loaded_url {
                    request.loaded_url = Some(loaded_url);
                }
                if let Some(session) = &session {
                    session.mark_good().await;
                }
                self.mark_handled(&request).await;
                debug!("handled {}", request.url);
                Ok(())
            }
            HandlerOutcome::Failure(message) => {
                self.settle_failure(request, message, session.as_ref()).await
            }
            HandlerOutcome::Cancelled => {
                // Aborts are not the request's fault: reclaim with the
                // original retry count and no error message
                debug!("task cancelled, reclaiming {}", request.url);
                self.reclaim(&request, false).await;
                Ok(())
            }
        }
    }

    /// Retry-or-fail bookkeeping for one failed handler invocation.
    async fn settle_failure(
        &self,
        mut request: Request,
        message: String,
        session: Option<&SessionHandle>,
    ) -> Result<()> {
        if let Some(session) = session {
            session.mark_bad().await;
        }
        request.push_error_message(message.as_str());

        if !request.no_retry && request.retry_count < self.config.max_request_retries {
            request.retry_count += 1;
            self.retry_count.fetch_add(1, Ordering::SeqCst);
            warn!(
                "retrying {} ({}/{}): {message}",
                request.url, request.retry_count, self.config.max_request_retries
            );
            self.reclaim(&request, true).await;
            return Ok(());
        }

        // Retry budget exhausted (or retries disabled): the request is
        // marked handled and dispatched to the failure handler
        self.mark_handled(&request).await;
        self.failed_count.fetch_add(1, Ordering::SeqCst);
        let failed_context = FailedRequestContext {
            request: request.clone(),
            error: message,
        };
        match (self.handle_failed_request_fn)(failed_context).await {
            Ok(()) => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "failed-request handler errored for {}; crawler is in an unknown state: {e:#}",
                request.url
            )),
        }
    }

    async fn persist_all(&self) {
        if let Some(list) = &self.request_list
            && let Err(e) = list.persist_state().await
        {
            warn!("request list persistence failed: {e:#}");
        }
        if let Some(sessions) = &self.session_pool
            && let Err(e) = sessions.persist_state().await
        {
            warn!("session pool persistence failed: {e:#}");
        }
    }
}

/// React to control events: migration pauses and persists, abort stops
/// the pool, periodic persist requests snapshot state.
fn spawn_event_listener(inner: Arc<CrawlerInner>, pool: Arc<AutoscaledPool>) -> JoinHandle<()> {
    let mut events = inner.event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SystemEvent::Migrating { .. }) => {
                    info!("migration signalled, pausing and persisting");
                    let clean = pool.pause(MIGRATION_GRACE_PERIOD).await;
                    if !clean {
                        warn!(
                            "migration grace period expired; some requests may be duplicated \
                             after restart"
                        );
                    }
                    inner.persist_all().await;
                    inner
                        .event_bus
                        .publish_lossy(SystemEvent::persist_state(true));
                }
                Ok(SystemEvent::Aborting { .. }) => {
                    pool.abort();
                }
                Ok(SystemEvent::PersistState { is_migrating, .. }) => {
                    if !is_migrating {
                        inner.persist_all().await;
                    }
                }
                Ok(SystemEvent::Shutdown { .. }) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event listener lagged, skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Periodic persist-state requests, published for every collaborator on
/// the bus (the crawler's own listener included).
fn spawn_persist_ticker(inner: Arc<CrawlerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PERSIST_STATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if inner.event_bus.is_shutdown() {
                break;
            }
            inner
                .event_bus
                .publish_lossy(SystemEvent::persist_state(false));
        }
    })
}

/// Builder for [`Crawler`].
#[derive(Default)]
pub struct CrawlerBuilder {
    config: Option<CrawlerConfig>,
    request_list: Option<Arc<RequestList>>,
    request_queue: Option<Arc<dyn RequestQueue>>,
    handle_request_fn: Option<HandleRequestFn>,
    handle_failed_request_fn: Option<HandleFailedRequestFn>,
    session_pool: Option<Arc<SessionPool>>,
    browser_pool: Option<Arc<BrowserPool>>,
    event_bus: Option<EventBus>,
    probe_override: Option<Arc<dyn SystemProbe>>,
}

impl CrawlerBuilder {
    #[must_use]
    pub fn config(mut self, config: CrawlerConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn request_list(mut self, list: Arc<RequestList>) -> Self {
        self.request_list = Some(list);
        self
    }

    #[must_use]
    pub fn request_queue(mut self, queue: Arc<dyn RequestQueue>) -> Self {
        self.request_queue = Some(queue);
        self
    }

    #[must_use]
    pub fn handle_request_fn(mut self, handler: HandleRequestFn) -> Self {
        self.handle_request_fn = Some(handler);
        self
    }

    #[must_use]
    pub fn handle_failed_request_fn(mut self, handler: HandleFailedRequestFn) -> Self {
        self.handle_failed_request_fn = Some(handler);
        self
    }

    #[must_use]
    pub fn session_pool(mut self, pool: Arc<SessionPool>) -> Self {
        self.session_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn browser_pool(mut self, pool: Arc<BrowserPool>) -> Self {
        self.browser_pool = Some(pool);
        self
    }

    /// Supply the event bus capability; one is created when absent.
    #[must_use]
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Replace the snapshotter-backed system status with a custom probe.
    #[must_use]
    pub fn system_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe_override = Some(probe);
        self
    }

    pub fn build(self) -> Result<Crawler, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if self.request_list.is_none() && self.request_queue.is_none() {
            return Err(ConfigError::MissingCollaborator(
                "a request list or a request queue",
            ));
        }
        let handle_request_fn = self
            .handle_request_fn
            .ok_or(ConfigError::MissingCollaborator("handle_request_fn"))?;

        Ok(Crawler {
            inner: Arc::new(CrawlerInner {
                config,
                request_list: self.request_list,
                request_queue: self.request_queue,
                handle_request_fn,
                handle_failed_request_fn: self
                    .handle_failed_request_fn
                    .unwrap_or_else(default_failed_request_handler),
                session_pool: self.session_pool,
                browser_pool: self.browser_pool,
                event_bus: self.event_bus.unwrap_or_default(),
                probe_override: self.probe_override,
                pool: parking_lot::Mutex::new(None),
                snapshotter: parking_lot::Mutex::new(None),
                running: AtomicBool::new(false),
                handled_count: AtomicU64::new(0),
                failed_count: AtomicU64::new(0),
                retry_count: AtomicU64::new(0),
            }),
        })
    }
}
