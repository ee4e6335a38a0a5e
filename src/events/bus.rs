//! Event bus implementation for publishing and subscribing to engine events.
//!
//! The bus is an owned capability: the crawler constructs one (or accepts
//! one at construction) and hands clones to collaborators. There is no
//! process-wide singleton.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

use super::errors::EventBusError;
use super::metrics::EventBusMetrics;
use super::streaming::FilteredReceiver;
use super::types::{ShutdownReason, SystemEvent};

/// Default buffer capacity; engine events are low-volume control signals.
const DEFAULT_CAPACITY: usize = 256;

/// How long a graceful shutdown waits for subscribers to drain.
const SHUTDOWN_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Broadcast bus for [`SystemEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
    metrics: EventBusMetrics,
    shutdown: Arc<Notify>,
    shutdown_flag: Arc<AtomicBool>,
    /// Reference count across clones, so only the last drop signals shutdown
    num_instances: Arc<AtomicUsize>,
}

impl EventBus {
    /// Create a new event bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus buffering up to `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: EventBusMetrics::new(),
            shutdown: Arc::new(Notify::new()),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            num_instances: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Get current metrics.
    ///
    /// Individual counter reads are atomic; for a consistent view across
    /// all counters use `metrics().snapshot()`.
    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of active subscribers that received the event.
    pub fn publish(&self, event: SystemEvent) -> Result<usize, EventBusError> {
        if self.is_shutdown() {
            self.metrics.increment_failed();
            return Err(EventBusError::Shutdown);
        }
        match self.sender.send(event) {
            Ok(subscriber_count) => {
                self.metrics.increment_published();
                self.metrics.update_subscriber_count(subscriber_count);
                Ok(subscriber_count)
            }
            Err(_) => {
                // broadcast::send only fails when no receiver exists
                self.metrics.increment_dropped();
                Err(EventBusError::NoSubscribers)
            }
        }
    }

    /// Publish, treating "no subscribers" as a non-error.
    ///
    /// Control events are advisory; a run with no external collaborators
    /// attached is a legitimate configuration.
    pub fn publish_lossy(&self, event: SystemEvent) {
        if let Err(EventBusError::NoSubscribers) = self.publish(event) {
            log::trace!("published event with no active subscribers");
        }
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    /// Create a filtered subscriber that only yields matching events.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&SystemEvent) -> bool + Send + Sync + 'static,
    {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let count = self.sender.receiver_count();
        self.metrics.update_subscriber_count(count);
        count
    }

    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Signal shutdown to all subscribers. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        log::debug!("event bus shutdown signaled");
    }

    /// Wait for the shutdown signal.
    ///
    /// Subscribers use this with `tokio::select!` to exit their loops.
    pub async fn wait_for_shutdown(&self) {
        if self.is_shutdown() {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Check whether `shutdown()` has been called on this bus or a clone.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Gracefully shut down: publish a final [`SystemEvent::Shutdown`],
    /// give subscribers a short drain window, then signal shutdown.
    pub async fn shutdown_gracefully(&self, reason: ShutdownReason) {
        log::info!("beginning graceful shutdown of event bus: {reason:?}");

        let _ = self.publish(SystemEvent::shutdown(reason));

        // Subscribers have no acknowledgment path; a fixed drain window is
        // the best available heuristic.
        tokio::time::sleep(SHUTDOWN_DRAIN_WAIT).await;

        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        log::debug!("event bus graceful shutdown complete");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        self.num_instances.fetch_add(1, Ordering::Relaxed);
        Self {
            sender: self.sender.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
            shutdown_flag: self.shutdown_flag.clone(),
            num_instances: self.num_instances.clone(),
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // fetch_sub returns the value BEFORE decrementing; only the last
        // live instance triggers the shutdown signal
        if 1 == self.num_instances.fetch_sub(1, Ordering::AcqRel) {
            self.shutdown_flag.store(true, Ordering::SeqCst);
            self.shutdown.notify_waiters();
            log::trace!("event bus dropped (last instance), shutdown signal sent");
        }
    }
}
