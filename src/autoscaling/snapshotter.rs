//! Host-resource sampling into rolling windows.
//!
//! Two background loops feed time-bounded rings: a fast loop (CPU load and
//! event-loop lag) and a slow loop (memory). Client overload is reported
//! externally by whoever talks to the downstream storage API. Readers query
//! the rings synchronously; the sampler is the only writer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sysinfo::System;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::SnapshotterConfig;

/// One observation of a single resource dimension.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: Instant,
    pub overloaded: bool,
    /// Dimension-specific magnitude: load average, used bytes, or tick
    /// drift in milliseconds. Kept for log lines, not for classification.
    pub value: f64,
}

/// The resource dimensions the snapshotter tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Cpu,
    Memory,
    EventLoop,
    Client,
}

/// Point-in-time system information combining the newest sample of every
/// dimension.
#[derive(Debug, Clone, Copy)]
pub struct SystemInfo {
    pub at: Instant,
    pub cpu_overloaded: bool,
    pub mem_current_bytes: u64,
    pub mem_max_bytes: u64,
    pub event_loop_drift_millis: f64,
    pub client_overloaded: bool,
}

#[derive(Debug, Default)]
struct Rings {
    cpu: VecDeque<Sample>,
    memory: VecDeque<Sample>,
    event_loop: VecDeque<Sample>,
    client: VecDeque<Sample>,
}

/// Samples CPU, memory, event-loop lag and downstream client load.
#[derive(Debug)]
pub struct Snapshotter {
    config: SnapshotterConfig,
    rings: Arc<RwLock<Rings>>,
    /// Memory ceiling resolved once at startup
    mem_max_bytes: u64,
    num_cores: usize,
    fast_handle: Mutex<Option<JoinHandle<()>>>,
    slow_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl Snapshotter {
    #[must_use]
    pub fn new(config: SnapshotterConfig) -> Arc<Self> {
        let mem_max_bytes = match config.memory_mbytes {
            Some(mbytes) => mbytes * 1024 * 1024,
            None => {
                let mut system = System::new();
                system.refresh_memory();
                system.total_memory()
            }
        };
        let num_cores = num_cpus::get();

        Arc::new(Self {
            config,
            rings: Arc::new(RwLock::new(Rings::default())),
            mem_max_bytes,
            num_cores,
            fast_handle: Mutex::new(None),
            slow_handle: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the background sampling loops.
    pub async fn start(self: &Arc<Self>) {
        debug!(
            cores = self.num_cores,
            mem_max_bytes = self.mem_max_bytes,
            "starting snapshotter"
        );

        let snapshotter = Arc::clone(self);
        let fast = tokio::spawn(async move {
            fast_loop(snapshotter).await;
        });
        *self.fast_handle.lock().await = Some(fast);

        let snapshotter = Arc::clone(self);
        let slow = tokio::spawn(async move {
            slow_loop(snapshotter).await;
        });
        *self.slow_handle.lock().await = Some(slow);
    }

    /// Stop sampling. The rings remain readable.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.fast_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.slow_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Record an externally-observed downstream client overload state.
    ///
    /// Called by storage clients when they see rate-limit or error spikes
    /// from the remote API.
    pub async fn report_client_status(&self, overloaded: bool) {
        let sample = Sample {
            at: Instant::now(),
            overloaded,
            value: f64::from(u8::from(overloaded)),
        };
        let mut rings = self.rings.write().await;
        let window = self.config.memory_sample_window;
        push_pruned(&mut rings.client, sample, window);
    }

    /// Samples of `dimension` not older than `window`.
    pub async fn samples_in(&self, dimension: Dimension, window: Duration) -> Vec<Sample> {
        let rings = self.rings.read().await;
        let ring = match dimension {
            Dimension::Cpu => &rings.cpu,
            Dimension::Memory => &rings.memory,
            Dimension::EventLoop => &rings.event_loop,
            Dimension::Client => &rings.client,
        };
        let cutoff = Instant::now().checked_sub(window);
        ring.iter()
            .filter(|s| cutoff.is_none_or(|c| s.at >= c))
            .copied()
            .collect()
    }

    /// Newest sample of every dimension folded into one record.
    pub async fn current_info(&self) -> SystemInfo {
        let rings = self.rings.read().await;
        SystemInfo {
            at: Instant::now(),
            cpu_overloaded: rings.cpu.back().is_some_and(|s| s.overloaded),
            mem_current_bytes: rings.memory.back().map_or(0, |s| s.value as u64),
            mem_max_bytes: self.mem_max_bytes,
            event_loop_drift_millis: rings.event_loop.back().map_or(0.0, |s| s.value),
            client_overloaded: rings.client.back().is_some_and(|s| s.overloaded),
        }
    }

    /// Resolved memory ceiling in bytes.
    #[must_use]
    pub fn mem_max_bytes(&self) -> u64 {
        self.mem_max_bytes
    }

    fn cpu_threshold(&self) -> f64 {
        self.config.max_used_cpu_ratio * self.num_cores as f64
    }
}

fn push_pruned(ring: &mut VecDeque<Sample>, sample: Sample, window: Duration) {
    ring.push_back(sample);
    let cutoff = sample.at.checked_sub(window);
    if let Some(cutoff) = cutoff {
        while ring.front().is_some_and(|s| s.at < cutoff) {
            ring.pop_front();
        }
    }
}

/// Fast loop: CPU load average and event-loop tick drift.
///
/// Tick drift doubles as the event-loop probe: if this task is scheduled
/// late, every other task on the runtime is equally delayed.
async fn fast_loop(snapshotter: Arc<Snapshotter>) {
    let interval_duration = snapshotter.config.fast_interval;
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; it carries no drift information
    interval.tick().await;

    let mut last_tick = Instant::now();

    while !snapshotter.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;
        let now = Instant::now();

        let drift_millis = now
            .duration_since(last_tick)
            .saturating_sub(interval_duration)
            .as_secs_f64()
            * 1000.0;
        last_tick = now;

        let load = System::load_average().one;
        let cpu_overloaded = load > snapshotter.cpu_threshold();
        let loop_overloaded = drift_millis > snapshotter.config.max_blocked_millis as f64;

        if cpu_overloaded || loop_overloaded {
            trace!(load, drift_millis, "fast sample overloaded");
        }

        let window = snapshotter.config.cpu_sample_window;
        let mut rings = snapshotter.rings.write().await;
        push_pruned(
            &mut rings.cpu,
            Sample {
                at: now,
                overloaded: cpu_overloaded,
                value: load,
            },
            window,
        );
        push_pruned(
            &mut rings.event_loop,
            Sample {
                at: now,
                overloaded: loop_overloaded,
                value: drift_millis,
            },
            window,
        );
    }

    debug!("snapshotter fast loop exiting");
}

/// Slow loop: process/system memory via sysinfo.
async fn slow_loop(snapshotter: Arc<Snapshotter>) {
    let mut interval = tokio::time::interval(snapshotter.config.slow_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut system = System::new();

    while !snapshotter.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;

        system.refresh_memory();
        let used = system.used_memory();
        let max = snapshotter.mem_max_bytes.max(1);
        let ratio = used as f64 / max as f64;
        let overloaded = ratio > snapshotter.config.max_used_memory_ratio;

        if overloaded {
            warn!(
                used_mbytes = used / (1024 * 1024),
                max_mbytes = max / (1024 * 1024),
                "memory overloaded"
            );
        }

        let window = snapshotter.config.memory_sample_window;
        let mut rings = snapshotter.rings.write().await;
        push_pruned(
            &mut rings.memory,
            Sample {
                at: Instant::now(),
                overloaded,
                value: used as f64,
            },
            window,
        );
    }

    debug!("snapshotter slow loop exiting");
}
