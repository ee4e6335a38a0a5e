//! dragnet — request scheduling and execution engine for web crawlers.
//!
//! The engine drives user-supplied work (fetch + extract) over a frontier
//! of URLs, coordinating three subsystems:
//!
//! - an autoscaled pool that adapts concurrency to CPU, memory and
//!   event-loop pressure,
//! - a request frontier (ordered seed list + deduplicated queue) with
//!   at-least-once handling and bounded retries,
//! - browser and session pools with rotation, retirement and recycling.
//!
//! dragnet is a library: it has no CLI surface. Hosts construct a
//! [`Crawler`] with their handlers and collaborators and call `run()`.

pub mod autoscaling;
pub mod browser;
pub mod config;
pub mod crawler;
pub mod events;
pub mod request;
pub mod request_list;
pub mod request_queue;
pub mod session;
pub mod storage;
pub mod utils;

pub use autoscaling::{
    AutoscaledPool, PoolState, Snapshotter, SystemProbe, SystemStatus, TaskContext,
};
pub use browser::{
    BackendBrowser, BackendPage, BrowserBackend, BrowserPool, ChromiumBackend, InstanceState,
    LaunchOptions, PageHandle, PageOptions,
};
pub use config::{
    AutoscaledPoolConfig, BrowserPoolConfig, ConfigError, CrawlerConfig, EngineEnv,
    SessionPoolConfig, SnapshotterConfig, SystemStatusConfig,
};
pub use crawler::{
    Crawler, CrawlerBuilder, CrawlerStats, CrawlingContext, FailedRequestContext, HandlerResult,
};
pub use events::{EventBus, EventBusError, ShutdownReason, SystemEvent};
pub use request::{HttpMethod, Request, RequestBuilder};
pub use request_list::{RequestList, RequestListOptions, RequestListSource, RequestListState};
pub use request_queue::{
    AddRequestResult, FileRequestQueue, MemoryRequestQueue, QueueError, RemoteRequestQueue,
    RequestQueue,
};
pub use session::{Cookie, Session, SessionHandle, SessionPool};
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
