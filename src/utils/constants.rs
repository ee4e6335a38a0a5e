//! Shared configuration constants for dragnet
//!
//! This module contains default values and tuning constants used throughout
//! the engine to ensure consistency and avoid magic numbers.

use std::time::Duration;

/// Fast snapshot cadence for CPU and event-loop samples: 500 ms
///
/// CPU load and event-loop lag move quickly under bursty workloads, so the
/// fast ring is sampled twice per second. Halving this improves reaction
/// time at the cost of ring churn; doubling it risks missing short stalls.
pub const SNAPSHOT_FAST_INTERVAL: Duration = Duration::from_millis(500);

/// Slow snapshot cadence for memory samples: 1 s
///
/// Resident memory changes slowly relative to CPU; sampling it through
/// sysinfo is also the most expensive probe, so it runs at half the rate.
pub const SNAPSHOT_SLOW_INTERVAL: Duration = Duration::from_secs(1);

/// Retention window for CPU and event-loop sample rings: 60 s
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(60);

/// Retention window for memory and client sample rings: 30 s
pub const MEMORY_SAMPLE_WINDOW: Duration = Duration::from_secs(30);

/// Short window for the "is the system OK right now" check: 5 s
pub const CURRENT_STATUS_WINDOW: Duration = Duration::from_secs(5);

/// Fraction of overloaded samples above which a window is NOT OK: 0.4
pub const DEFAULT_MAX_OVERLOADED_RATIO: f64 = 0.4;

/// Default ceiling on 1-minute load average, as a ratio of logical cores
pub const DEFAULT_MAX_USED_CPU_RATIO: f64 = 0.95;

/// Default ceiling on used/max memory ratio
pub const DEFAULT_MAX_USED_MEMORY_RATIO: f64 = 0.7;

/// Event-loop tick drift beyond which the loop counts as blocked: 50 ms
pub const DEFAULT_MAX_BLOCKED_MILLIS: u64 = 50;

/// Interval between concurrency-scaling decisions: 10 s
pub const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between attempts to start new pool tasks: 500 ms
pub const MAYBE_RUN_INTERVAL: Duration = Duration::from_millis(500);

/// Saturation ratio required before the pool scales up: 0.95
///
/// Scaling up an idle pool is pointless; desired concurrency only grows
/// when current concurrency is already close to it.
pub const DESIRED_CONCURRENCY_RATIO: f64 = 0.95;

/// Step ratio for a single scale-up or scale-down decision: 0.05
pub const SCALE_STEP_RATIO: f64 = 0.05;

/// Default retry budget for a single request
pub const DEFAULT_MAX_REQUEST_RETRIES: u32 = 3;

/// Default wall-clock budget for one user handler invocation: 60 s
pub const DEFAULT_HANDLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Cap on stored error messages per request
///
/// Bounds memory on requests that fail many times. The first failures are
/// the diagnostic ones; later duplicates are summarized by a marker entry.
pub const MAX_ERROR_MESSAGES_PER_REQUEST: usize = 10;

/// Grace period granted to in-flight tasks when the host signals migration: 20 s
pub const MIGRATION_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Interval between periodic persist-state events: 60 s
pub const PERSIST_STATE_INTERVAL: Duration = Duration::from_secs(60);

/// Delay between a retired instance reaching zero pages and its kill: 1 s
///
/// Lets the backend's page-closed event settle before the process goes away.
pub const INSTANCE_KILL_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Idle lifetime after which a browser instance is killed outright: 5 min
pub const DEFAULT_KILL_INSTANCE_AFTER: Duration = Duration::from_secs(300);

/// Timeout for graceful browser close before escalating to a hard kill: 5 s
pub const BROWSER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum sessions kept by the session pool
pub const DEFAULT_MAX_SESSION_POOL_SIZE: usize = 1000;

/// Default usage budget for one session before retirement
pub const DEFAULT_SESSION_MAX_USAGE_COUNT: u64 = 50;

/// Default error score at which a session is retired
pub const DEFAULT_SESSION_MAX_ERROR_SCORE: f64 = 3.0;

/// Amount subtracted from a session's error score on success
pub const DEFAULT_SESSION_ERROR_SCORE_DECREMENT: f64 = 1.0;

/// Backoff ceiling for remote queue fetch retries: 4 s
pub const REMOTE_QUEUE_MAX_BACKOFF: Duration = Duration::from_secs(4);

/// Attempts a remote queue fetch makes against a lagging head before
/// reporting the queue empty
pub const REMOTE_QUEUE_HEAD_RETRIES: u32 = 6;

/// Capacity of the remote queue's recently-added unique-key cache
pub const REMOTE_QUEUE_CACHE_SIZE: usize = 2048;
