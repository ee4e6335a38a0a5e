//! Remote HTTP request queue backend.
//!
//! Talks to a storage API that owns the authoritative queue state. The
//! remote backend is eventually consistent: a just-added request may not
//! be visible to an immediate head read. Two local structures bridge the
//! gap: a bounded LRU of recently-added unique keys (read-your-writes for
//! deduplication) and a pending-head estimate that keeps `fetch` retrying
//! with backoff while the remote head lags behind local knowledge.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{AddRequestResult, QueueError, RequestQueue};
use crate::config::EngineEnv;
use crate::request::Request;
use crate::utils::constants::{
    REMOTE_QUEUE_CACHE_SIZE, REMOTE_QUEUE_HEAD_RETRIES, REMOTE_QUEUE_MAX_BACKOFF,
};

/// Connection options for the remote backend.
#[derive(Debug, Clone)]
pub struct RemoteQueueClientOptions {
    /// API root, e.g. `https://api.example.com`
    pub api_base_url: String,
    pub queue_id: String,
    pub token: Option<String>,
}

impl RemoteQueueClientOptions {
    /// Build options from the recognized environment, if it names a
    /// remote API.
    #[must_use]
    pub fn from_env(env: &EngineEnv) -> Option<Self> {
        let api_base_url = env.api_base_url.clone()?;
        Some(Self {
            api_base_url,
            queue_id: env.default_request_queue_id.clone(),
            token: env.token.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteAddResponse {
    request_id: String,
    was_already_present: bool,
    was_already_handled: bool,
}

#[derive(Debug, Deserialize)]
struct RemoteHead {
    items: Vec<Request>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteQueueInfo {
    pending_count: u64,
    handled_count: u64,
}

/// Request queue backed by a remote storage API.
pub struct RemoteRequestQueue {
    client: reqwest::Client,
    queue_url: String,
    token: Option<String>,
    /// unique_key → request id of recently added requests
    recently_added: Mutex<LruCache<String, AddRequestResult>>,
    /// Local estimate of remote pending length; negative values mean the
    /// remote knows about more work than this process added
    head_estimate: AtomicI64,
    in_progress: Mutex<HashMap<String, Request>>,
}

impl RemoteRequestQueue {
    pub fn new(options: RemoteQueueClientOptions) -> Result<Self, QueueError> {
        if options.api_base_url.is_empty() {
            return Err(QueueError::Remote("api_base_url is empty".to_string()));
        }
        let queue_url = format!(
            "{}/v2/request-queues/{}",
            options.api_base_url.trim_end_matches('/'),
            options.queue_id
        );
        let cache_size = NonZeroUsize::new(REMOTE_QUEUE_CACHE_SIZE)
            .expect("cache size constant is non-zero");

        Ok(Self {
            client: reqwest::Client::new(),
            queue_url,
            token: options.token,
            recently_added: Mutex::new(LruCache::new(cache_size)),
            head_estimate: AtomicI64::new(0),
            in_progress: Mutex::new(HashMap::new()),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn queue_info(&self) -> Result<RemoteQueueInfo, QueueError> {
        let response = self
            .authorized(self.client.get(&self.queue_url))
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        response.json().await.map_err(remote_err)
    }
}

fn remote_err(e: reqwest::Error) -> QueueError {
    QueueError::Remote(e.to_string())
}

/// Exponential backoff with ±20% jitter, capped by the queue ceiling.
fn head_backoff(attempt: u32) -> Duration {
    const BASE_DELAY_MS: u64 = 100;
    const JITTER_PERCENT: f64 = 0.2;

    let exp_delay = BASE_DELAY_MS.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(-JITTER_PERCENT..=JITTER_PERCENT);
    let jittered = (exp_delay as f64 * (1.0 + jitter)) as u64;
    Duration::from_millis(jittered).min(REMOTE_QUEUE_MAX_BACKOFF)
}

#[async_trait]
impl RequestQueue for RemoteRequestQueue {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, QueueError> {
        // Read-your-writes: a key this process added recently is a
        // duplicate even if the remote index has not caught up yet
        {
            let mut cache = self.recently_added.lock().await;
            if let Some(prior) = cache.get(&request.unique_key) {
                trace!(unique_key = %request.unique_key, "duplicate add served from cache");
                return Ok(AddRequestResult {
                    was_already_present: true,
                    ..prior.clone()
                });
            }
        }

        let url = format!("{}/requests?forefront={forefront}", self.queue_url);
        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        let remote: RemoteAddResponse = response.json().await.map_err(remote_err)?;

        let result = AddRequestResult {
            request_id: remote.request_id,
            was_already_present: remote.was_already_present,
            was_already_handled: remote.was_already_handled,
        };

        if !result.was_already_present {
            self.head_estimate.fetch_add(1, Ordering::SeqCst);
        }
        self.recently_added
            .lock()
            .await
            .put(request.unique_key.clone(), result.clone());

        Ok(result)
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>, QueueError> {
        let url = format!("{}/head?limit=1", self.queue_url);

        for attempt in 0..REMOTE_QUEUE_HEAD_RETRIES {
            let response = self
                .authorized(self.client.get(&url))
                .send()
                .await
                .map_err(remote_err)?
                .error_for_status()
                .map_err(remote_err)?;
            let head: RemoteHead = response.json().await.map_err(remote_err)?;

            if let Some(request) = head.items.into_iter().next() {
                self.head_estimate.fetch_sub(1, Ordering::SeqCst);
                self.in_progress
                    .lock()
                    .await
                    .insert(request.id.clone(), request.clone());
                return Ok(Some(request));
            }

            // An empty head with a positive local estimate is likely
            // read-your-writes lag, not a drained queue
            if self.head_estimate.load(Ordering::SeqCst) <= 0 {
                return Ok(None);
            }
            let delay = head_backoff(attempt);
            debug!(attempt, ?delay, "remote head lagging behind local estimate");
            tokio::time::sleep(delay).await;
        }

        warn!("remote head still empty after retries, treating queue as empty");
        self.head_estimate.store(0, Ordering::SeqCst);
        Ok(None)
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), QueueError> {
        if self.in_progress.lock().await.remove(&request.id).is_none() {
            return Err(QueueError::NotInProgress(request.id.clone()));
        }

        let mut updated = request.clone();
        if updated.handled_at.is_none() {
            updated.handled_at = Some(chrono::Utc::now());
        }
        let url = format!("{}/requests/{}", self.queue_url, request.id);
        self.authorized(self.client.put(&url))
            .json(&updated)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        Ok(())
    }

    async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<(), QueueError> {
        if self.in_progress.lock().await.remove(&request.id).is_none() {
            return Err(QueueError::NotInProgress(request.id.clone()));
        }

        let url = format!(
            "{}/requests/{}?forefront={forefront}",
            self.queue_url, request.id
        );
        self.authorized(self.client.put(&url))
            .json(request)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        self.head_estimate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool, QueueError> {
        if self.head_estimate.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        Ok(self.queue_info().await?.pending_count == 0)
    }

    async fn is_finished(&self) -> Result<bool, QueueError> {
        if !self.in_progress.lock().await.is_empty() {
            return Ok(false);
        }
        self.is_empty().await
    }

    async fn handled_count(&self) -> Result<u64, QueueError> {
        Ok(self.queue_info().await?.handled_count)
    }
}
