//! Feedback-driven autoscaling: resource snapshots, OK/overloaded
//! classification, and the concurrency pool they steer.

pub mod pool;
pub mod snapshotter;
pub mod system_status;
pub mod token_bucket;

pub use pool::{
    AutoscaledPool, BoxFuture, IsFinishedFn, IsTaskReadyFn, PoolState, RunTaskFn, TaskContext,
};
pub use snapshotter::{Dimension, Sample, Snapshotter, SystemInfo};
pub use system_status::{StatusBreakdown, SystemProbe, SystemStatus};
pub use token_bucket::TokenBucket;
