//! Configuration records for the engine subsystems.
//!
//! Every knob is an explicit, documented field with a `Default`; each
//! record has a `validate()` that construction calls, so contradictory
//! options surface as a typed error before anything starts running.

use std::time::Duration;

use crate::utils::constants::{
    AUTOSCALE_INTERVAL, CPU_SAMPLE_WINDOW, CURRENT_STATUS_WINDOW, DEFAULT_HANDLE_REQUEST_TIMEOUT,
    DEFAULT_KILL_INSTANCE_AFTER, DEFAULT_MAX_BLOCKED_MILLIS, DEFAULT_MAX_OVERLOADED_RATIO,
    DEFAULT_MAX_REQUEST_RETRIES, DEFAULT_MAX_SESSION_POOL_SIZE, DEFAULT_MAX_USED_CPU_RATIO,
    DEFAULT_MAX_USED_MEMORY_RATIO, DEFAULT_SESSION_ERROR_SCORE_DECREMENT,
    DEFAULT_SESSION_MAX_ERROR_SCORE, DEFAULT_SESSION_MAX_USAGE_COUNT, DESIRED_CONCURRENCY_RATIO,
    MAYBE_RUN_INTERVAL, MEMORY_SAMPLE_WINDOW, SCALE_STEP_RATIO, SNAPSHOT_FAST_INTERVAL,
    SNAPSHOT_SLOW_INTERVAL,
};

/// Fatal configuration errors, raised synchronously at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {key}={value} is invalid, expected {expected}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid option {field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
}

fn ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(ConfigError::InvalidOption {
            field,
            reason: format!("{value} is not a ratio in [0, 1]"),
        });
    }
    Ok(())
}

// =============================================================================
// Snapshotter / system status
// =============================================================================

/// Thresholds and cadences for the resource snapshotter.
#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    /// 1-minute load average ceiling, as a fraction of logical cores
    pub max_used_cpu_ratio: f64,
    /// used/max memory ceiling
    pub max_used_memory_ratio: f64,
    /// Event-loop tick drift beyond which a sample counts as blocked
    pub max_blocked_millis: u64,
    /// Fast cadence (CPU, event loop)
    pub fast_interval: Duration,
    /// Slow cadence (memory)
    pub slow_interval: Duration,
    /// Retention for CPU / event-loop rings
    pub cpu_sample_window: Duration,
    /// Retention for memory / client rings
    pub memory_sample_window: Duration,
    /// Memory envelope override in megabytes (falls back to system total)
    pub memory_mbytes: Option<u64>,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            max_used_cpu_ratio: DEFAULT_MAX_USED_CPU_RATIO,
            max_used_memory_ratio: DEFAULT_MAX_USED_MEMORY_RATIO,
            max_blocked_millis: DEFAULT_MAX_BLOCKED_MILLIS,
            fast_interval: SNAPSHOT_FAST_INTERVAL,
            slow_interval: SNAPSHOT_SLOW_INTERVAL,
            cpu_sample_window: CPU_SAMPLE_WINDOW,
            memory_sample_window: MEMORY_SAMPLE_WINDOW,
            memory_mbytes: None,
        }
    }
}

impl SnapshotterConfig {
    /// Defaults with the memory envelope taken from the environment
    /// (`DRAGNET_MEMORY_MBYTES`), for hosts without cgroup limits.
    #[must_use]
    pub fn from_env(env: &super::EngineEnv) -> Self {
        Self {
            memory_mbytes: env.memory_mbytes,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ratio("max_used_memory_ratio", self.max_used_memory_ratio)?;
        if self.max_used_cpu_ratio <= 0.0 || !self.max_used_cpu_ratio.is_finite() {
            return Err(ConfigError::InvalidOption {
                field: "max_used_cpu_ratio",
                reason: "must be a positive finite ratio".to_string(),
            });
        }
        if self.fast_interval.is_zero() || self.slow_interval.is_zero() {
            return Err(ConfigError::InvalidOption {
                field: "fast_interval/slow_interval",
                reason: "sampling intervals must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Windows and thresholds for OK/overloaded classification.
#[derive(Debug, Clone)]
pub struct SystemStatusConfig {
    /// Window for `is_ok_now`
    pub current_history: Duration,
    /// Fraction of overloaded samples above which a window is NOT OK
    pub max_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_history: CURRENT_STATUS_WINDOW,
            max_overloaded_ratio: DEFAULT_MAX_OVERLOADED_RATIO,
        }
    }
}

impl SystemStatusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ratio("max_overloaded_ratio", self.max_overloaded_ratio)
    }
}

// =============================================================================
// Autoscaled pool
// =============================================================================

/// Concurrency bounds and scaling behavior of the autoscaled pool.
#[derive(Debug, Clone)]
pub struct AutoscaledPoolConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Starting point for desired concurrency; clamped into bounds
    pub desired_concurrency: Option<usize>,
    /// Saturation ratio required before scaling up
    pub desired_concurrency_ratio: f64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Interval between scaling decisions
    pub autoscale_interval: Duration,
    /// Interval between task-start attempts
    pub maybe_run_interval: Duration,
    /// Optional ceiling on task starts per minute (token bucket)
    pub max_tasks_per_minute: Option<u32>,
}

impl Default for AutoscaledPoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            desired_concurrency_ratio: DESIRED_CONCURRENCY_RATIO,
            scale_up_step_ratio: SCALE_STEP_RATIO,
            scale_down_step_ratio: SCALE_STEP_RATIO,
            autoscale_interval: AUTOSCALE_INTERVAL,
            maybe_run_interval: MAYBE_RUN_INTERVAL,
            max_tasks_per_minute: None,
        }
    }
}

impl AutoscaledPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_concurrency == 0 {
            return Err(ConfigError::InvalidOption {
                field: "min_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(ConfigError::InvalidOption {
                field: "max_concurrency",
                reason: format!(
                    "max_concurrency ({}) below min_concurrency ({})",
                    self.max_concurrency, self.min_concurrency
                ),
            });
        }
        if let Some(desired) = self.desired_concurrency
            && !(self.min_concurrency..=self.max_concurrency).contains(&desired)
        {
            return Err(ConfigError::InvalidOption {
                field: "desired_concurrency",
                reason: format!(
                    "{desired} outside [{}, {}]",
                    self.min_concurrency, self.max_concurrency
                ),
            });
        }
        ratio("desired_concurrency_ratio", self.desired_concurrency_ratio)?;
        ratio("scale_up_step_ratio", self.scale_up_step_ratio)?;
        ratio("scale_down_step_ratio", self.scale_down_step_ratio)?;
        if let Some(rate) = self.max_tasks_per_minute
            && rate == 0
        {
            return Err(ConfigError::InvalidOption {
                field: "max_tasks_per_minute",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        if self.maybe_run_interval.is_zero() || self.autoscale_interval.is_zero() {
            return Err(ConfigError::InvalidOption {
                field: "autoscale_interval/maybe_run_interval",
                reason: "tick intervals must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Initial desired concurrency: explicit value or the lower bound.
    #[must_use]
    pub fn initial_desired_concurrency(&self) -> usize {
        self.desired_concurrency.unwrap_or(self.min_concurrency)
    }
}

// =============================================================================
// Session pool
// =============================================================================

/// Sizing and reputation thresholds for the session pool.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub max_pool_size: usize,
    pub max_usage_count: u64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    /// Sessions older than this are expired regardless of reputation
    pub max_age: Duration,
    /// Key the pool persists its snapshot under
    pub persist_state_key: String,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_SESSION_POOL_SIZE,
            max_usage_count: DEFAULT_SESSION_MAX_USAGE_COUNT,
            max_error_score: DEFAULT_SESSION_MAX_ERROR_SCORE,
            error_score_decrement: DEFAULT_SESSION_ERROR_SCORE_DECREMENT,
            max_age: Duration::from_secs(3000),
            persist_state_key: "SESSION_POOL_STATE".to_string(),
        }
    }
}

impl SessionPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::InvalidOption {
                field: "max_pool_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_error_score <= 0.0 {
            return Err(ConfigError::InvalidOption {
                field: "max_error_score",
                reason: "must be positive".to_string(),
            });
        }
        if self.error_score_decrement < 0.0 {
            return Err(ConfigError::InvalidOption {
                field: "error_score_decrement",
                reason: "must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Browser pool
// =============================================================================

/// Lifecycle thresholds for pooled browser instances.
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Upper bound on simultaneously live (non-killed) instances
    pub max_browsers: usize,
    /// Tabs one instance may have open at once
    pub max_open_pages_per_instance: usize,
    /// Lifetime page count after which an instance is retired
    pub retire_instance_after_page_count: u64,
    /// Idle time after which an instance is killed outright
    pub kill_instance_after: Duration,
    /// Reuse idle pages instead of opening fresh tabs
    pub reuse_pages: bool,
    /// Run instances headless
    pub headless: bool,
    /// Recycle disk-cache directories between instances (headful only)
    pub recycle_disk_caches: bool,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_browsers: 8,
            max_open_pages_per_instance: 20,
            retire_instance_after_page_count: 100,
            kill_instance_after: DEFAULT_KILL_INSTANCE_AFTER,
            reuse_pages: false,
            headless: true,
            recycle_disk_caches: false,
        }
    }
}

impl BrowserPoolConfig {
    /// Defaults with the headless mode taken from the environment
    /// (`DRAGNET_HEADLESS`).
    #[must_use]
    pub fn from_env(env: &super::EngineEnv) -> Self {
        Self {
            headless: env.headless,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_browsers == 0 {
            return Err(ConfigError::InvalidOption {
                field: "max_browsers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_open_pages_per_instance == 0 {
            return Err(ConfigError::InvalidOption {
                field: "max_open_pages_per_instance",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.recycle_disk_caches && self.headless {
            return Err(ConfigError::InvalidOption {
                field: "recycle_disk_caches",
                reason: "disk-cache recycling only takes effect with headless=false".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Crawler
// =============================================================================

/// Engine-level options for the crawler core.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Retry budget per request
    pub max_request_retries: u32,
    /// Stop fetching new work once this many requests were handled
    pub max_requests_per_crawl: Option<u64>,
    /// Wall-clock budget for one user handler invocation
    pub handle_request_timeout: Duration,
    pub autoscaled_pool: AutoscaledPoolConfig,
    pub snapshotter: SnapshotterConfig,
    pub system_status: SystemStatusConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_request_retries: DEFAULT_MAX_REQUEST_RETRIES,
            max_requests_per_crawl: None,
            handle_request_timeout: DEFAULT_HANDLE_REQUEST_TIMEOUT,
            autoscaled_pool: AutoscaledPoolConfig::default(),
            snapshotter: SnapshotterConfig::default(),
            system_status: SystemStatusConfig::default(),
        }
    }
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handle_request_timeout.is_zero() {
            return Err(ConfigError::InvalidOption {
                field: "handle_request_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        if let Some(max) = self.max_requests_per_crawl
            && max == 0
        {
            return Err(ConfigError::InvalidOption {
                field: "max_requests_per_crawl",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        self.autoscaled_pool.validate()?;
        self.snapshotter.validate()?;
        self.system_status.validate()?;
        Ok(())
    }
}
