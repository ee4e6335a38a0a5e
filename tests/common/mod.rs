//! Shared helpers for integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dragnet::SystemProbe;
use dragnet::config::AutoscaledPoolConfig;

/// Install test subscribers for both logging facades the crate uses.
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Probe with fixed answers, switchable at runtime.
pub struct StaticProbe {
    ok_now: AtomicBool,
    ok_historically: AtomicBool,
}

impl StaticProbe {
    pub fn new(ok_now: bool, ok_historically: bool) -> Arc<Self> {
        Arc::new(Self {
            ok_now: AtomicBool::new(ok_now),
            ok_historically: AtomicBool::new(ok_historically),
        })
    }

    #[allow(dead_code)]
    pub fn set_ok(&self, ok_now: bool, ok_historically: bool) {
        self.ok_now.store(ok_now, Ordering::SeqCst);
        self.ok_historically.store(ok_historically, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SystemProbe for StaticProbe {
    async fn is_ok_now(&self) -> bool {
        self.ok_now.load(Ordering::SeqCst)
    }

    async fn is_ok_historically(&self) -> bool {
        self.ok_historically.load(Ordering::SeqCst)
    }
}

/// Pool configuration with tick intervals suitable for tests.
#[allow(dead_code)]
pub fn fast_pool_config() -> AutoscaledPoolConfig {
    AutoscaledPoolConfig {
        maybe_run_interval: Duration::from_millis(10),
        autoscale_interval: Duration::from_millis(40),
        ..Default::default()
    }
}
