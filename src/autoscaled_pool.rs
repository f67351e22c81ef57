//! Bounded concurrent task dispatcher reacting to [`SystemStatus`]
//! (component #7, spec.md §4.6).
//!
//! The dispatch loop is `fusillade::daemon::Daemon::run`'s shape: a
//! `JoinSet` of in-flight tasks, an `AtomicUsize` in-flight counter
//! decremented through a `scopeguard::guard` so a panicking task can't
//! leak a permit, and `try_join_next` draining completed tasks before
//! considering new work. What's new here is the scale-up/scale-down
//! arithmetic, which the daemon (a fixed per-model semaphore) never needed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::error::{CrawlError, Result};
use crate::system_status::SystemStatus;

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AutoscaledPoolConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    pub tick_interval: Duration,
}

impl Default for AutoscaledPoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            initial_concurrency: 1,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Bounds concurrent execution of a caller-supplied task function within
/// `[min_concurrency, max_concurrency]`.
pub struct AutoscaledPool {
    config: AutoscaledPoolConfig,
    system_status: Arc<SystemStatus>,
    running: Arc<AtomicUsize>,
    desired: AtomicUsize,
    paused: AtomicBool,
    aborted: AtomicBool,
}

impl AutoscaledPool {
    pub fn new(config: AutoscaledPoolConfig, system_status: Arc<SystemStatus>) -> Self {
        let initial = config.initial_concurrency.clamp(config.min_concurrency, config.max_concurrency);
        Self {
            config,
            system_status,
            running: Arc::new(AtomicUsize::new(0)),
            desired: AtomicUsize::new(initial),
            paused: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::Relaxed)
    }

    /// `ceil(desired * ratio)`, floored at 1 — every step moves concurrency
    /// by at least one task (spec.md §4.6: "min +1"/"min -1").
    fn step(desired: usize, ratio: f64) -> usize {
        ((desired as f64 * ratio).ceil() as usize).max(1)
    }

    /// Control algorithm run once per tick (spec.md §4.6). The literal
    /// spec text chains "running ≥ desired → no change" ahead of a branch
    /// that only fires when `running == desired`, which can never trigger
    /// under a `≥` guard. Resolved (see DESIGN.md) as the standard
    /// saturated-pool pattern: only consider scaling up once the pool is
    /// running at its full current allowance; if there's unused headroom
    /// this tick, there's nothing to learn from SystemStatus yet.
    fn adjust_desired_concurrency(&self) {
        let running = self.running.load(Ordering::Relaxed);
        let mut desired = self.desired.load(Ordering::Relaxed);

        if running < desired {
            // Pool isn't saturated; either ramping up or task-starved.
        } else if self.system_status.is_currently_overloaded() {
            debug!("system currently overloaded, holding concurrency");
        } else if desired < self.config.max_concurrency {
            let step = Self::step(desired, self.config.scale_up_step_ratio);
            desired = (desired + step).min(self.config.max_concurrency);
        }

        if self.system_status.is_historically_overloaded() && desired > self.config.min_concurrency {
            let step = Self::step(desired, self.config.scale_down_step_ratio);
            desired = desired.saturating_sub(step).max(self.config.min_concurrency);
        }

        self.desired.store(desired, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// `abort()`: stop dispatching new tasks; in-flight tasks are not
    /// awaited.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Drive the pool until `is_finished` reports true with no tasks
    /// in-flight, or [`AutoscaledPool::abort`] is called.
    ///
    /// `run_task` is invoked once per dispatched task; `is_task_ready`
    /// gates whether there is work available right now (e.g. the request
    /// queue has a ready item); `is_finished` is the default-or-custom
    /// completion predicate (spec.md §4.6: normally
    /// `RequestList.isFinished() ∧ RequestQueue.isFinished()`).
    pub async fn run(self: Arc<Self>, run_task: TaskFn, is_task_ready: PredicateFn, is_finished: PredicateFn) -> Result<()> {
        let mut tick = interval(self.config.tick_interval);
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        loop {
            while let Some(result) = join_set.try_join_next() {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "pool task returned an error"),
                    Err(join_error) => error!(error = %join_error, "pool task panicked"),
                }
            }

            if self.aborted.load(Ordering::Acquire) {
                debug!("autoscaled pool aborted, ceasing dispatch");
                return Ok(());
            }

            if self.running.load(Ordering::Relaxed) == 0 && is_finished().await {
                break;
            }

            tick.tick().await;
            self.adjust_desired_concurrency();

            if self.paused.load(Ordering::Acquire) {
                continue;
            }

            while self.running.load(Ordering::Relaxed) < self.desired.load(Ordering::Relaxed) {
                if !is_task_ready().await {
                    break;
                }

                let running = self.running.clone();
                running.fetch_add(1, Ordering::Relaxed);
                let task = run_task.clone();

                join_set.spawn(async move {
                    let _guard = scopeguard::guard((), |_| {
                        running.fetch_sub(1, Ordering::Relaxed);
                    });
                    task().await
                });
            }
        }

        while join_set.join_next().await.is_some() {}
        Ok(())
    }

    /// `pause(timeoutMs)`: stop dispatching and wait for in-flight tasks
    /// to drain, within a deadline.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        self.pause();
        let deadline = tokio::time::Instant::now() + timeout;
        while self.running.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("pool did not drain within the requested timeout");
                return Err(CrawlError::TimedOut(timeout.as_millis() as u32));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::{Snapshotter, SnapshotterConfig};
    use crate::system_status::SystemStatusConfig;
    use std::sync::atomic::AtomicU32;

    fn system_status() -> Arc<SystemStatus> {
        let snapshotter = Arc::new(Snapshotter::new(SnapshotterConfig::default()));
        Arc::new(SystemStatus::new(snapshotter, SystemStatusConfig::default()))
    }

    #[tokio::test]
    async fn drains_a_fixed_number_of_ready_tasks() {
        let completed = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 1,
                max_concurrency: 4,
                initial_concurrency: 2,
                tick_interval: Duration::from_millis(10),
                ..AutoscaledPoolConfig::default()
            },
            system_status(),
        ));

        let remaining = Arc::new(AtomicU32::new(5));
        let run_completed = completed.clone();
        let run_task: TaskFn = {
            let completed = run_completed.clone();
            Arc::new(move || {
                let completed = completed.clone();
                Box::pin(async move {
                    completed.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }) as BoxFuture<'static, Result<()>>
            })
        };

        let ready_remaining = remaining.clone();
        let is_task_ready: PredicateFn = Arc::new(move || {
            let remaining = ready_remaining.clone();
            Box::pin(async move {
                remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n - 1))
                    .is_ok()
            }) as BoxFuture<'static, bool>
        });

        let is_finished: PredicateFn = Arc::new(move || {
            let remaining = remaining.clone();
            Box::pin(async move { remaining.load(Ordering::Relaxed) == 0 }) as BoxFuture<'static, bool>
        });

        pool.run(run_task, is_task_ready, is_finished).await.unwrap();
        assert_eq!(completed.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn step_is_at_least_one() {
        assert_eq!(AutoscaledPool::step(1, 0.05), 1);
        assert_eq!(AutoscaledPool::step(100, 0.05), 5);
    }

    #[tokio::test]
    async fn abort_stops_dispatch_without_draining() {
        let pool = Arc::new(AutoscaledPool::new(AutoscaledPoolConfig::default(), system_status()));
        pool.abort();
        let run_task: TaskFn = Arc::new(|| Box::pin(async { Ok(()) }) as BoxFuture<'static, Result<()>>);
        let never_ready: PredicateFn = Arc::new(|| Box::pin(async { false }) as BoxFuture<'static, bool>);
        let never_finished: PredicateFn = Arc::new(|| Box::pin(async { false }) as BoxFuture<'static, bool>);
        pool.run(run_task, never_ready, never_finished).await.unwrap();
    }
}
