//! File-backed request queue.
//!
//! Layout under `<root>/request_queues/<queue_id>/`:
//!
//! ```text
//! requests/<id>.json   one file per request, full serialized Request
//! pending/index.json   ordered list of pending identifiers
//! handled/<id>.json    marker per handled request ({"handledAt": ...})
//! ```
//!
//! The in-memory [`QueueState`] is authoritative; every transition is
//! mirrored to disk before the operation returns. In-progress is
//! deliberately not persisted: a crash turns in-flight requests back into
//! pending ones on reload, which is the at-least-once behavior the
//! crawler is built for.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::state::QueueState;
use super::{AddRequestResult, QueueError, RequestQueue};
use crate::request::Request;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandledMarker {
    handled_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PendingIndex {
    order: Vec<String>,
}

/// Request queue persisted as one JSON file per request.
pub struct FileRequestQueue {
    state: Mutex<QueueState>,
    requests_dir: PathBuf,
    pending_index_path: PathBuf,
    handled_dir: PathBuf,
}

impl FileRequestQueue {
    /// Open the queue named by the recognized environment
    /// (`DRAGNET_LOCAL_STORAGE_DIR` + `DRAGNET_DEFAULT_REQUEST_QUEUE_ID`).
    pub async fn open_default(env: &crate::config::EngineEnv) -> Result<Self> {
        let root = env.local_storage_dir.as_deref().ok_or_else(|| {
            anyhow::anyhow!("DRAGNET_LOCAL_STORAGE_DIR is not set; no local storage root")
        })?;
        Self::open(root, &env.default_request_queue_id).await
    }

    /// Open (creating if needed) queue `queue_id` under `root`, restoring
    /// any persisted state.
    pub async fn open(root: &Path, queue_id: &str) -> Result<Self> {
        let dir = root.join("request_queues").join(queue_id);
        let requests_dir = dir.join("requests");
        let pending_dir = dir.join("pending");
        let handled_dir = dir.join("handled");
        for d in [&requests_dir, &pending_dir, &handled_dir] {
            tokio::fs::create_dir_all(d)
                .await
                .with_context(|| format!("failed to create queue dir {}", d.display()))?;
        }
        let pending_index_path = pending_dir.join("index.json");

        let queue = Self {
            state: Mutex::new(QueueState::default()),
            requests_dir,
            pending_index_path,
            handled_dir,
        };
        queue.restore().await?;
        Ok(queue)
    }

    async fn restore(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        // Load every stored request
        let mut entries = tokio::fs::read_dir(&self.requests_dir)
            .await
            .context("failed to list requests dir")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Request>(&bytes) {
                Ok(request) => {
                    state.requests.insert(request.id.clone(), request);
                }
                Err(e) => {
                    warn!("skipping corrupt request file {}: {e}", path.display());
                }
            }
        }

        // Handled markers
        let mut entries = tokio::fs::read_dir(&self.handled_dir)
            .await
            .context("failed to list handled dir")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let (Some(stem), Some("json")) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|e| e.to_str()),
            ) && state.requests.contains_key(stem)
            {
                state.handled.insert(stem.to_string());
            }
        }

        // Pending order from the index file
        let pending_order = match tokio::fs::read(&self.pending_index_path).await {
            Ok(bytes) => serde_json::from_slice::<PendingIndex>(&bytes)
                .map(|idx| idx.order)
                .unwrap_or_else(|e| {
                    warn!("corrupt pending index, rebuilding: {e}");
                    Vec::new()
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("failed to read pending index"),
        };
        for id in pending_order {
            if state.requests.contains_key(&id) && !state.handled.contains(&id) {
                state.pending.push_back(id);
            }
        }

        // Requests on disk that are neither pending nor handled were in
        // flight when the process died; re-serve them first
        let known: std::collections::HashSet<String> = state
            .pending
            .iter()
            .cloned()
            .chain(state.handled.iter().cloned())
            .collect();
        let orphans: Vec<String> = state
            .requests
            .keys()
            .filter(|id| !known.contains(*id))
            .cloned()
            .collect();
        for id in orphans {
            state.pending.push_front(id);
        }

        info!(
            pending = state.pending.len(),
            handled = state.handled.len(),
            "file request queue restored"
        );
        Ok(())
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.requests_dir.join(format!("{id}.json"))
    }

    fn handled_path(&self, id: &str) -> PathBuf {
        self.handled_dir.join(format!("{id}.json"))
    }

    async fn write_json(&self, path: &Path, value: &impl Serialize) -> Result<(), QueueError> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| QueueError::Storage(anyhow::anyhow!(e)))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| QueueError::Storage(anyhow::anyhow!(e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| QueueError::Storage(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn persist_pending(&self, state: &QueueState) -> Result<(), QueueError> {
        let index = PendingIndex {
            order: state.pending.iter().cloned().collect(),
        };
        self.write_json(&self.pending_index_path, &index).await
    }
}

#[async_trait]
impl RequestQueue for FileRequestQueue {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, QueueError> {
        let mut state = self.state.lock().await;
        let result = state.add(request.clone(), forefront);
        if !result.was_already_present {
            self.write_json(&self.request_path(&result.request_id), &request)
                .await?;
            self.persist_pending(&state).await?;
            debug!(id = %result.request_id, forefront, "request added to file queue");
        }
        Ok(result)
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>, QueueError> {
        let mut state = self.state.lock().await;
        let fetched = state.fetch_next();
        if fetched.is_some() {
            self.persist_pending(&state).await?;
        }
        Ok(fetched)
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.mark_handled(request)?;
        // The stored copy carries the handled timestamp now
        let stored = state
            .requests
            .get(&request.id)
            .cloned()
            .ok_or_else(|| QueueError::UnknownRequest(request.id.clone()))?;
        self.write_json(&self.request_path(&request.id), &stored)
            .await?;
        self.write_json(
            &self.handled_path(&request.id),
            &HandledMarker {
                handled_at: stored.handled_at.unwrap_or_else(chrono::Utc::now),
            },
        )
        .await?;
        Ok(())
    }

    async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.reclaim(request, forefront)?;
        self.write_json(&self.request_path(&request.id), request)
            .await?;
        self.persist_pending(&state).await?;
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.is_empty())
    }

    async fn is_finished(&self) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.is_finished())
    }

    async fn handled_count(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.handled_count())
    }
}
