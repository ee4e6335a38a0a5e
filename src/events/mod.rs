//! Engine event system.
//!
//! Control-plane signals (`migrating`, `aborting`, `persistState`,
//! `shutdown`) flow over a broadcast bus owned by the crawler. External
//! collaborators subscribe through a bus handle obtained at construction.

pub mod bus;
pub mod errors;
pub mod metrics;
pub mod streaming;
pub mod types;

pub use bus::EventBus;
pub use errors::EventBusError;
pub use metrics::{EventBusMetrics, MetricsSnapshot};
pub use streaming::FilteredReceiver;
pub use types::{ShutdownReason, SystemEvent};
