//! OK/overloaded classification over snapshotter windows.

use std::sync::Arc;
use std::time::Duration;

use crate::autoscaling::snapshotter::{Dimension, Sample, Snapshotter};
use crate::config::SystemStatusConfig;

/// The scaling decisions only need two predicates, so the pool consumes
/// this seam rather than the concrete [`SystemStatus`]; tests substitute a
/// stub that reports whatever pressure the scenario calls for.
#[async_trait::async_trait]
pub trait SystemProbe: Send + Sync {
    /// Overload ratio over the short window is acceptable.
    async fn is_ok_now(&self) -> bool;
    /// Overload ratio over the full retained window is acceptable.
    async fn is_ok_historically(&self) -> bool;
}

/// Per-dimension overload ratios for one evaluation window.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusBreakdown {
    pub cpu_overloaded_ratio: f64,
    pub mem_overloaded_ratio: f64,
    pub event_loop_overloaded_ratio: f64,
    pub client_overloaded_ratio: f64,
    /// Fraction of instants where ANY dimension was overloaded; this is
    /// the number the OK predicates compare against the threshold
    pub any_overloaded_ratio: f64,
}

/// Classifies the system as OK or overloaded from snapshotter samples.
#[derive(Clone)]
pub struct SystemStatus {
    config: SystemStatusConfig,
    snapshotter: Arc<Snapshotter>,
    /// Full-window horizon, taken from the snapshotter's longest retention
    full_history: Duration,
}

impl SystemStatus {
    #[must_use]
    pub fn new(
        config: SystemStatusConfig,
        snapshotter: Arc<Snapshotter>,
        full_history: Duration,
    ) -> Self {
        Self {
            config,
            snapshotter,
            full_history,
        }
    }

    /// Per-dimension breakdown over `window`, for logs and diagnostics.
    pub async fn describe(&self, window: Duration) -> StatusBreakdown {
        let cpu = self.snapshotter.samples_in(Dimension::Cpu, window).await;
        let mem = self.snapshotter.samples_in(Dimension::Memory, window).await;
        let event_loop = self
            .snapshotter
            .samples_in(Dimension::EventLoop, window)
            .await;
        let client = self.snapshotter.samples_in(Dimension::Client, window).await;

        StatusBreakdown {
            cpu_overloaded_ratio: overloaded_ratio(&cpu),
            mem_overloaded_ratio: overloaded_ratio(&mem),
            event_loop_overloaded_ratio: overloaded_ratio(&event_loop),
            client_overloaded_ratio: overloaded_ratio(&client),
            any_overloaded_ratio: any_overloaded_ratio(&[&cpu, &mem, &event_loop, &client]),
        }
    }

    async fn is_ok_in(&self, window: Duration) -> bool {
        let breakdown = self.describe(window).await;
        breakdown.any_overloaded_ratio < self.config.max_overloaded_ratio
    }
}

#[async_trait::async_trait]
impl SystemProbe for SystemStatus {
    async fn is_ok_now(&self) -> bool {
        self.is_ok_in(self.config.current_history).await
    }

    async fn is_ok_historically(&self) -> bool {
        self.is_ok_in(self.full_history).await
    }
}

fn overloaded_ratio(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let overloaded = samples.iter().filter(|s| s.overloaded).count();
    overloaded as f64 / samples.len() as f64
}

/// Ratio of sample instants where at least one dimension was overloaded.
///
/// The rings tick on different cadences, so instants are approximated by
/// pairing each dimension's samples positionally against the densest ring.
fn any_overloaded_ratio(rings: &[&[Sample]]) -> f64 {
    let len = rings.iter().map(|r| r.len()).max().unwrap_or(0);
    if len == 0 {
        return 0.0;
    }

    let mut any_overloaded = 0usize;
    for i in 0..len {
        let hit = rings.iter().any(|ring| {
            if ring.is_empty() {
                return false;
            }
            // Project the densest ring's index onto this ring's timeline
            let j = i * ring.len() / len;
            ring[j.min(ring.len() - 1)].overloaded
        });
        if hit {
            any_overloaded += 1;
        }
    }
    any_overloaded as f64 / len as f64
}
