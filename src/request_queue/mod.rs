//! Deduplicated request queue with per-request lifecycle states.
//!
//! Three backends share one contract: an in-memory queue for tests and
//! ephemeral crawls, a file-backed queue that survives restarts, and a
//! remote HTTP queue tolerating eventual consistency. An identifier is in
//! at most one of {pending, in-progress, handled} at any time.

pub mod file;
pub mod memory;
pub mod remote;
mod state;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::request::Request;

pub use file::FileRequestQueue;
pub use memory::MemoryRequestQueue;
pub use remote::{RemoteQueueClientOptions, RemoteRequestQueue};

/// Queue operation failures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The transition required the request to be in progress
    #[error("request {0} is not in progress")]
    NotInProgress(String),

    /// The request was never added to this queue
    #[error("request {0} is unknown to this queue")]
    UnknownRequest(String),

    /// Local persistence failed
    #[error("queue storage error: {0:#}")]
    Storage(anyhow::Error),

    /// The remote backend rejected or failed a call
    #[error("remote queue error: {0}")]
    Remote(String),
}

/// Outcome of [`RequestQueue::add_request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequestResult {
    pub request_id: String,
    /// The identifier was already known; queue position was not altered
    pub was_already_present: bool,
    /// The identifier was already handled
    pub was_already_handled: bool,
}

/// The "next request" side of the frontier.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Add a request unless its identifier is already known.
    ///
    /// Idempotent: a duplicate returns `was_already_present = true` and
    /// leaves the queue position untouched. `forefront` places a new
    /// request at the head of pending.
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, QueueError>;

    /// Move the next pending request to in-progress and return it.
    /// `None` iff pending is empty.
    async fn fetch_next_request(&self) -> Result<Option<Request>, QueueError>;

    /// Move an in-progress request to handled.
    async fn mark_request_handled(&self, request: &Request) -> Result<(), QueueError>;

    /// Move an in-progress request back to pending, optionally to the
    /// forefront. The stored request is replaced by `request`, so retry
    /// bookkeeping done by the caller survives the round trip.
    async fn reclaim_request(&self, request: &Request, forefront: bool)
    -> Result<(), QueueError>;

    /// No pending requests (in-progress ones may still be open).
    async fn is_empty(&self) -> Result<bool, QueueError>;

    /// No pending and no in-progress requests.
    async fn is_finished(&self) -> Result<bool, QueueError>;

    /// Number of requests handled so far.
    async fn handled_count(&self) -> Result<u64, QueueError>;
}
