//! Engine configuration: environment snapshot and typed option records.

pub mod env;
pub mod types;

pub use env::EngineEnv;
pub use types::{
    AutoscaledPoolConfig, BrowserPoolConfig, ConfigError, CrawlerConfig, SessionPoolConfig,
    SnapshotterConfig, SystemStatusConfig,
};
