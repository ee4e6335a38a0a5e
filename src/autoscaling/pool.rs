//! Feedback-driven concurrency pool.
//!
//! The pool runs caller-supplied task futures in parallel, adjusting its
//! desired concurrency from system-status feedback: scale up while the
//! system has been historically OK and the pool is saturated, scale down
//! as soon as the current window is overloaded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::autoscaling::system_status::SystemProbe;
use crate::autoscaling::token_bucket::TokenBucket;
use crate::config::{AutoscaledPoolConfig, ConfigError};

/// Boxed future used by the pool's callback seams.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs one unit of work; an `Err` is fatal to the whole pool.
pub type RunTaskFn = Arc<dyn Fn(TaskContext) -> BoxFuture<Result<()>> + Send + Sync>;

/// Whether another task could start right now (work is available and
/// limits permit).
pub type IsTaskReadyFn = Arc<dyn Fn() -> BoxFuture<bool> + Send + Sync>;

/// Whether the pool should resolve once it is idle.
pub type IsFinishedFn = Arc<dyn Fn() -> BoxFuture<bool> + Send + Sync>;

/// Pool lifecycle states.
///
/// CREATED → RUNNING ⇄ PAUSED → STOPPING → STOPPED; ABORTED is terminal
/// from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Paused,
    Stopping,
    Stopped,
    Aborted,
}

/// Cancellation capability handed to every task.
///
/// Tasks race their real work against [`TaskContext::cancelled`]; when the
/// pool aborts, the signal fires and the task is expected to settle
/// promptly.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel_rx: watch::Receiver<bool>,
}

impl TaskContext {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves when the pool signals cancellation.
    pub async fn cancelled(&mut self) {
        if *self.cancel_rx.borrow() {
            return;
        }
        while self.cancel_rx.changed().await.is_ok() {
            if *self.cancel_rx.borrow() {
                return;
            }
        }
        // Sender dropped means the pool is gone; treat as cancelled
    }
}

/// Feedback-controlled task executor.
pub struct AutoscaledPool {
    config: AutoscaledPoolConfig,
    probe: Arc<dyn SystemProbe>,
    run_task_fn: RunTaskFn,
    is_task_ready_fn: IsTaskReadyFn,
    is_finished_fn: IsFinishedFn,
    desired_concurrency: AtomicUsize,
    current_concurrency: AtomicUsize,
    state: parking_lot::Mutex<PoolState>,
    cancel_tx: watch::Sender<bool>,
    /// Fires whenever a task settles; pause() waits on this
    task_settled: Notify,
    /// Wakes the run loop out of its tick sleep on state changes and
    /// task completions
    nudge: Notify,
    rate_limiter: Option<TokenBucket>,
}

impl AutoscaledPool {
    pub fn new(
        config: AutoscaledPoolConfig,
        probe: Arc<dyn SystemProbe>,
        run_task_fn: RunTaskFn,
        is_task_ready_fn: IsTaskReadyFn,
        is_finished_fn: IsFinishedFn,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (cancel_tx, _) = watch::channel(false);
        let desired = config.initial_desired_concurrency();
        let rate_limiter = config.max_tasks_per_minute.map(TokenBucket::per_minute);

        Ok(Arc::new(Self {
            config,
            probe,
            run_task_fn,
            is_task_ready_fn,
            is_finished_fn,
            desired_concurrency: AtomicUsize::new(desired),
            current_concurrency: AtomicUsize::new(0),
            state: parking_lot::Mutex::new(PoolState::Created),
            cancel_tx,
            task_settled: Notify::new(),
            nudge: Notify::new(),
            rate_limiter,
        }))
    }

    #[must_use]
    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Drive tasks until the finished predicate holds or the pool aborts.
    ///
    /// Returns the first fatal task error, if any. May be called once.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Created => *state = PoolState::Running,
                other => {
                    return Err(anyhow::anyhow!("pool cannot run from state {other:?}"));
                }
            }
        }
        info!(
            min = self.config.min_concurrency,
            max = self.config.max_concurrency,
            desired = self.desired_concurrency(),
            "autoscaled pool starting"
        );

        let mut tasks: FuturesUnordered<JoinHandle<Result<()>>> = FuturesUnordered::new();
        let mut maybe_run = tokio::time::interval(self.config.maybe_run_interval);
        maybe_run.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut autoscale = tokio::time::interval(self.config.autoscale_interval);
        autoscale.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first autoscale tick: there is nothing to
        // measure before any task has run
        autoscale.tick().await;

        let outcome: Result<()> = loop {
            if self.state() == PoolState::Aborted {
                break Ok(());
            }

            tokio::select! {
                _ = maybe_run.tick() => {
                    if self.state() == PoolState::Running {
                        self.maybe_start_tasks(&mut tasks).await;
                        if tasks.is_empty()
                            && self.current_concurrency() == 0
                            && (self.is_finished_fn)().await
                        {
                            break Ok(());
                        }
                    }
                }
                _ = autoscale.tick() => {
                    if self.state() == PoolState::Running {
                        self.autoscale_tick().await;
                    }
                }
                Some(joined) = tasks.next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!("fatal task error, aborting pool: {e:#}");
                            break Err(e);
                        }
                        Err(join_err) => {
                            error!("pool task panicked: {join_err}");
                            break Err(anyhow::anyhow!("pool task panicked: {join_err}"));
                        }
                    }
                }
                _ = self.nudge.notified() => {
                    // State change or task completion; loop re-evaluates
                }
            }
        };

        match &outcome {
            Ok(()) if self.state() == PoolState::Aborted => {
                info!("autoscaled pool aborted");
            }
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    *state = PoolState::Stopping;
                }
                // Idle and finished; nothing left to drain
                *self.state.lock() = PoolState::Stopped;
                info!("autoscaled pool finished");
            }
            Err(_) => {
                let _ = self.cancel_tx.send(true);
                *self.state.lock() = PoolState::Aborted;
            }
        }

        outcome
    }

    /// Stop starting new tasks and wait up to `timeout` for in-flight
    /// tasks to settle. Returns `true` on a clean pause.
    pub async fn pause(&self, timeout: Duration) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Running => *state = PoolState::Paused,
                PoolState::Paused => {}
                // Nothing to pause in terminal states
                _ => return true,
            }
        }
        self.nudge.notify_waiters();
        debug!("pool paused, draining in-flight tasks");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.task_settled.notified();
            if self.current_concurrency() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                warn!(
                    in_flight = self.current_concurrency(),
                    "pause grace period expired with tasks still in flight"
                );
                return false;
            }
        }
    }

    /// Undo a pause.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == PoolState::Paused {
            *state = PoolState::Running;
            drop(state);
            self.nudge.notify_waiters();
            debug!("pool resumed");
        }
    }

    /// Abort without waiting; in-flight tasks receive the cancellation
    /// signal through their [`TaskContext`].
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, PoolState::Stopped | PoolState::Aborted) {
                return;
            }
            *state = PoolState::Aborted;
        }
        let _ = self.cancel_tx.send(true);
        self.nudge.notify_waiters();
        info!("pool abort requested");
    }

    async fn maybe_start_tasks(self: &Arc<Self>, tasks: &mut FuturesUnordered<JoinHandle<Result<()>>>) {
        loop {
            let current = self.current_concurrency();
            let desired = self.desired_concurrency();
            if current >= desired {
                break;
            }
            if !(self.is_task_ready_fn)().await {
                break;
            }
            if let Some(bucket) = &self.rate_limiter
                && !bucket.try_acquire()
            {
                debug!(
                    wait = ?bucket.time_to_next_token(),
                    "task start deferred by rate limit"
                );
                break;
            }
            self.spawn_task(tasks);
        }
    }

    fn spawn_task(self: &Arc<Self>, tasks: &mut FuturesUnordered<JoinHandle<Result<()>>>) {
        let context = TaskContext {
            cancel_rx: self.cancel_tx.subscribe(),
        };
        let future = (self.run_task_fn)(context);
        self.current_concurrency.fetch_add(1, Ordering::SeqCst);

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = future.await;
            pool.current_concurrency.fetch_sub(1, Ordering::SeqCst);
            pool.task_settled.notify_waiters();
            pool.nudge.notify_waiters();
            result
        });
        tasks.push(handle);
    }

    /// One scaling decision.
    ///
    /// Scale-up requires the system to have been OK over the full history
    /// AND the pool to be close to saturation; scale-down triggers on the
    /// current window alone. The asymmetry damps oscillation.
    async fn autoscale_tick(&self) {
        let desired = self.desired_concurrency();
        let current = self.current_concurrency();
        let saturation = current as f64 / desired.max(1) as f64;

        if saturation >= self.config.desired_concurrency_ratio
            && self.probe.is_ok_historically().await
        {
            let step = ((desired as f64 * self.config.scale_up_step_ratio).ceil() as usize).max(1);
            let next = (desired + step).min(self.config.max_concurrency);
            if next != desired {
                debug!(desired, next, "scaling up");
                self.desired_concurrency.store(next, Ordering::SeqCst);
                self.nudge.notify_waiters();
            }
        } else if !self.probe.is_ok_now().await {
            let step =
                ((desired as f64 * self.config.scale_down_step_ratio).ceil() as usize).max(1);
            let next = desired.saturating_sub(step).max(self.config.min_concurrency);
            if next != desired {
                debug!(desired, next, "scaling down under load");
                self.desired_concurrency.store(next, Ordering::SeqCst);
            }
        }
    }
}
