//! In-memory request queue for tests and ephemeral crawls.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::state::QueueState;
use super::{AddRequestResult, QueueError, RequestQueue};
use crate::request::Request;

/// Mutex-serialized in-memory queue.
#[derive(Debug, Default)]
pub struct MemoryRequestQueue {
    state: Mutex<QueueState>,
}

impl MemoryRequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestQueue for MemoryRequestQueue {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, QueueError> {
        Ok(self.state.lock().await.add(request, forefront))
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>, QueueError> {
        Ok(self.state.lock().await.fetch_next())
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), QueueError> {
        self.state.lock().await.mark_handled(request)
    }

    async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<(), QueueError> {
        self.state.lock().await.reclaim(request, forefront)
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
