//! Ordered, restartable source of seed requests.
//!
//! A request list materializes its sources up front and then serves them
//! in order. Progress (`next_index`, in-progress identifiers, reclaimed
//! requests) persists through the key-value collaborator so a restarted
//! process resumes where it left off instead of re-crawling from zero.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::request::Request;
use crate::storage::KeyValueStore;
use crate::storage::kv::{get_json, set_json};

/// Default pattern for extracting URLs out of a downloaded source body.
static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\]\)]+"#).expect("static regex is valid"));

/// One seed source: inline requests or a remote text file of URLs.
#[derive(Debug, Clone)]
pub enum RequestListSource {
    /// An inline batch, served in the given order
    Requests(Vec<Request>),
    /// A URL whose body is fetched once at init and split into URLs by
    /// `regex` (the default URL pattern when `None`)
    RequestsFromUrl {
        url: String,
        regex: Option<Regex>,
    },
}

/// Persisted progress of a request list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestListState {
    pub next_index: usize,
    pub in_progress: Vec<String>,
    pub reclaimed: Vec<Request>,
}

/// Options controlling list construction.
#[derive(Clone, Default)]
pub struct RequestListOptions {
    /// Serve duplicate unique-keys instead of skipping them at init
    pub keep_duplicates: bool,
    /// Persist progress under this key in `store`
    pub persist_state_key: Option<String>,
    pub store: Option<Arc<dyn KeyValueStore>>,
}

#[derive(Debug)]
struct ListState {
    next_index: usize,
    in_progress: HashSet<String>,
    reclaimed: VecDeque<Request>,
    handled_count: u64,
}

/// Ordered, deduplicated, restartable seed list.
pub struct RequestList {
    requests: Vec<Request>,
    state: Mutex<ListState>,
    persist_state_key: Option<String>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl RequestList {
    /// Materialize `sources` in order and restore persisted progress.
    ///
    /// Remote sources are downloaded once, here; a download failure fails
    /// construction rather than silently crawling a partial seed set.
    pub async fn open(
        sources: Vec<RequestListSource>,
        options: RequestListOptions,
    ) -> Result<Self> {
        let mut requests = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let client = reqwest::Client::new();

        for source in sources {
            match source {
                RequestListSource::Requests(batch) => {
                    for request in batch {
                        push_deduped(&mut requests, &mut seen, request, options.keep_duplicates);
                    }
                }
                RequestListSource::RequestsFromUrl { url, regex } => {
                    let body = client
                        .get(&url)
                        .send()
                        .await
                        .and_then(reqwest::Response::error_for_status)
                        .with_context(|| format!("failed to download request source {url}"))?
                        .text()
                        .await
                        .with_context(|| format!("failed to read request source {url}"))?;

                    let pattern = regex.as_ref().unwrap_or(&URL_REGEX);
                    let mut extracted = 0usize;
                    for found in pattern.find_iter(&body) {
                        match Request::new(found.as_str()) {
                            Ok(request) => {
                                extracted += 1;
                                push_deduped(
                                    &mut requests,
                                    &mut seen,
                                    request,
                                    options.keep_duplicates,
                                );
                            }
                            Err(e) => {
                                warn!("skipping unparsable URL from {url}: {e}");
                            }
                        }
                    }
                    debug!("source {url} yielded {extracted} URLs");
                }
            }
        }

        let mut state = ListState {
            next_index: 0,
            in_progress: HashSet::new(),
            reclaimed: VecDeque::new(),
            handled_count: 0,
        };

        // Restore persisted progress before the first fetch
        if let (Some(store), Some(key)) = (&options.store, &options.persist_state_key)
            && let Some(persisted) = get_json::<RequestListState>(store.as_ref(), key).await?
        {
            info!(
                next_index = persisted.next_index,
                in_progress = persisted.in_progress.len(),
                reclaimed = persisted.reclaimed.len(),
                "restoring request list state"
            );
            state.next_index = persisted.next_index.min(requests.len());
            // Requests that were in flight when the state was persisted
            // are re-served first, explicit reclaims ahead of them
            state.reclaimed = persisted.reclaimed.into_iter().collect();
            let reclaimed_ids: HashSet<String> =
                state.reclaimed.iter().map(|r| r.id.clone()).collect();
            for id in persisted.in_progress {
                if reclaimed_ids.contains(&id) {
                    continue;
                }
                if let Some(request) = requests.iter().find(|r| r.id == id) {
                    state.reclaimed.push_back(request.clone());
                } else {
                    warn!("persisted in-progress id {id} not found among sources, dropping");
                }
            }
        }

        info!(total = requests.len(), "request list initialized");

        Ok(Self {
            requests,
            state: Mutex::new(state),
            persist_state_key: options.persist_state_key,
            store: options.store,
        })
    }

    /// Next request to work on: reclaimed requests first, then the ordered
    /// tail of the materialized list. `None` when everything is out.
    pub async fn fetch_next_request(&self) -> Option<Request> {
        let mut state = self.state.lock().await;
        if let Some(request) = state.reclaimed.pop_front() {
            state.in_progress.insert(request.id.clone());
            return Some(request);
        }
        while state.next_index < self.requests.len() {
            let request = self.requests[state.next_index].clone();
            state.next_index += 1;
            // A request can be both at its list position and re-served via
            // reclaim after a restart; never hand it out twice
            if state.in_progress.contains(&request.id) {
                continue;
            }
            state.in_progress.insert(request.id.clone());
            return Some(request);
        }
        None
    }

    /// Mark a fetched request as done.
    pub async fn mark_request_handled(&self, request: &Request) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_progress.remove(&request.id) {
            return Err(anyhow::anyhow!(
                "request {} is not in progress in this list",
                request.id
            ));
        }
        state.handled_count += 1;
        Ok(())
    }

    /// Return a fetched request for a later retry.
    ///
    /// Reclaimed requests keep their relative order and are served before
    /// the list advances.
    pub async fn reclaim_request(&self, request: &Request) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_progress.remove(&request.id) {
            return Err(anyhow::anyhow!(
                "request {} is not in progress in this list",
                request.id
            ));
        }
        state.reclaimed.push_back(request.clone());
        Ok(())
    }

    /// No request left to hand out (in-progress ones may still be open).
    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.reclaimed.is_empty() && state.next_index >= self.requests.len()
    }

    /// Every request was fetched and settled.
    pub async fn is_finished(&self) -> bool {
        let state = self.state.lock().await;
        state.reclaimed.is_empty()
            && state.next_index >= self.requests.len()
            && state.in_progress.is_empty()
    }

    pub async fn handled_count(&self) -> u64 {
        self.state.lock().await.handled_count
    }

    /// Total number of materialized seed requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_seeded(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Snapshot progress into the key-value collaborator.
    ///
    /// A list constructed without a store treats this as a no-op so the
    /// crawler can persist unconditionally.
    pub async fn persist_state(&self) -> Result<()> {
        let (Some(store), Some(key)) = (&self.store, &self.persist_state_key) else {
            return Ok(());
        };
        let snapshot = {
            let state = self.state.lock().await;
            RequestListState {
                next_index: state.next_index,
                in_progress: state.in_progress.iter().cloned().collect(),
                reclaimed: state.reclaimed.iter().cloned().collect(),
            }
        };
        set_json(store.as_ref(), key, &snapshot)
            .await
            .context("failed to persist request list state")?;
        debug!(key, "request list state persisted");
        Ok(())
    }
}

fn push_deduped(
    requests: &mut Vec<Request>,
    seen: &mut HashSet<String>,
    request: Request,
    keep_duplicates: bool,
) {
    if keep_duplicates || seen.insert(request.unique_key.clone()) {
        requests.push(request);
    } else {
        debug!("skipping duplicate seed {}", request.url);
    }
}
