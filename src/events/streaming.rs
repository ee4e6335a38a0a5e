//! Filtered event receivers for selective event consumption.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::errors::EventBusError;
use super::types::SystemEvent;

/// Filtered event receiver wrapper
pub struct FilteredReceiver<F>
where
    F: Fn(&SystemEvent) -> bool + Send + Sync + 'static,
{
    receiver: broadcast::Receiver<SystemEvent>,
    filter: Arc<F>,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&SystemEvent) -> bool + Send + Sync + 'static,
{
    pub fn new(receiver: broadcast::Receiver<SystemEvent>, filter: F) -> Self {
        Self {
            receiver,
            filter: Arc::new(filter),
        }
    }

    /// Receive the next event that passes the filter.
    ///
    /// Preserves the receiver's buffered state between calls; events that
    /// fail the filter are consumed and skipped, never lost to other
    /// subscribers (each subscriber has its own cursor).
    pub async fn recv(&mut self) -> Result<SystemEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::Shutdown);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(EventBusError::ReceiverLagged(skipped));
                }
            }
        }
    }

    /// Drain immediately-available events, returning the first match.
    ///
    /// Does not wait; `Ok(None)` means no matching event is buffered.
    pub fn try_recv(&mut self) -> Result<Option<SystemEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    return Ok(None);
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::Shutdown);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    return Err(EventBusError::ReceiverLagged(skipped));
                }
            }
        }
    }
}
