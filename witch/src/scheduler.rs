//! Single-flight interval scheduler.
//!
//! [`IntervalScheduler::run`] invokes a unit of work, waits until at least
//! `interval` has passed since that tick started, and repeats until the
//! cancellation token fires or the work fails. Without an interval it runs the
//! work exactly once.
//!
//! Cancellation is cooperative: the token is observed before every tick and
//! while waiting between ticks. A tick that has already started always runs
//! to completion.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, WitchError};

/// Why [`IntervalScheduler::run`] returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStop {
    /// One-shot mode finished its single tick.
    Completed,
    /// The cancellation token fired before the next tick started.
    Cancelled,
}

/// In-memory bookkeeping of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRecord {
    pub running: bool,
    pub last_tick_started: Option<Instant>,
    /// Ticks started since construction.
    pub ticks: u64,
}

pub struct IntervalScheduler {
    interval: Option<Duration>,
    running: AtomicBool,
    ticks: AtomicU64,
    last_tick_started: Mutex<Option<Instant>>,
}

/// Clears the running flag when `run` finishes or its future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl IntervalScheduler {
    /// Periodic scheduler. `interval` must be non-zero.
    pub fn periodic(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(WitchError::Config(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self::new(Some(interval)))
    }

    /// Scheduler that runs its work exactly once per `run` call.
    pub fn one_shot() -> Self {
        Self::new(None)
    }

    fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            last_tick_started: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn record(&self) -> RunRecord {
        let last_tick_started = *self
            .last_tick_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        RunRecord {
            running: self.running.load(Ordering::Acquire),
            last_tick_started,
            ticks: self.ticks.load(Ordering::Acquire),
        }
    }

    fn mark_tick_started(&self, at: Instant) {
        *self
            .last_tick_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(at);
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }

    /// Run `tick` until cancelled, until it fails, or once in one-shot mode.
    ///
    /// Fails immediately with [`WitchError::AlreadyRunning`] if another `run`
    /// on this instance is still in progress; that run is left untouched.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut tick: F,
    ) -> Result<SchedulerStop>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("scheduler run requested while already running");
            return Err(WitchError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        debug!(interval = ?self.interval, "scheduler started");

        loop {
            if cancel.is_cancelled() {
                info!("scheduler cancelled before tick");
                return Ok(SchedulerStop::Cancelled);
            }

            let started = Instant::now();
            self.mark_tick_started(started);
            debug!(tick = self.ticks.load(Ordering::Acquire), "tick started");
            tick().await?;

            let Some(interval) = self.interval else {
                debug!("one-shot tick completed");
                return Ok(SchedulerStop::Completed);
            };

            let wait = interval.saturating_sub(started.elapsed());
            debug!(wait_ms = wait.as_millis() as u64, "waiting for next tick");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("scheduler cancelled while waiting");
                    return Ok(SchedulerStop::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl std::fmt::Debug for IntervalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field("interval", &self.interval)
            .field("record", &self.record())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use crate::error::HookPhase;

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_are_spaced_by_interval() {
        let scheduler = IntervalScheduler::periodic(Duration::from_secs(10)).expect("scheduler");
        let cancel = CancellationToken::new();
        let mut starts: Vec<Instant> = Vec::new();

        let stop = scheduler
            .run(&cancel, || {
                starts.push(Instant::now());
                if starts.len() == 4 {
                    cancel.cancel();
                }
                async { Ok(()) }
            })
            .await
            .expect("run");

        assert_eq!(stop, SchedulerStop::Cancelled);
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(10));
        }
        assert_eq!(scheduler.record().ticks, 4);
        assert!(!scheduler.record().running);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tick_shortens_the_wait() {
        let scheduler = IntervalScheduler::periodic(Duration::from_secs(10)).expect("scheduler");
        let cancel = CancellationToken::new();
        let mut starts: Vec<Instant> = Vec::new();

        scheduler
            .run(&cancel, || {
                starts.push(Instant::now());
                if starts.len() == 2 {
                    cancel.cancel();
                }
                async {
                    tokio::time::sleep(Duration::from_secs(4)).await;
                    Ok(())
                }
            })
            .await
            .expect("run");

        assert_eq!(starts[1] - starts[0], Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_runs_exactly_once() {
        let scheduler = IntervalScheduler::one_shot();
        let calls = AtomicUsize::new(0);
        let stop = scheduler
            .run(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .expect("run");
        assert_eq!(stop, SchedulerStop::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The instance is reusable once the previous run returned.
        scheduler
            .run(&CancellationToken::new(), || async { Ok(()) })
            .await
            .expect("second run");
        assert_eq!(scheduler.record().ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tick_terminates_run() {
        let scheduler = IntervalScheduler::periodic(Duration::from_secs(1)).expect("scheduler");
        let calls = AtomicUsize::new(0);
        let err = scheduler
            .run(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(WitchError::Hook {
                        phase: HookPhase::Pre,
                        hook: "boom".to_string(),
                        source: anyhow::anyhow!("exit 1"),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WitchError::Hook { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.record().running);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_runs_nothing() {
        let scheduler = IntervalScheduler::periodic(Duration::from_secs(1)).expect("scheduler");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let stop = scheduler
            .run(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .expect("run");
        assert_eq!(stop, SchedulerStop::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_interrupts_sleep() {
        let scheduler =
            Arc::new(IntervalScheduler::periodic(Duration::from_secs(3600)).expect("scheduler"));
        let cancel = CancellationToken::new();

        let task = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(&cancel, || async { Ok(()) }).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(scheduler.record().running);
        cancel.cancel();

        let stop = task.await.expect("join").expect("run");
        assert_eq!(stop, SchedulerStop::Cancelled);
        assert_eq!(scheduler.record().ticks, 1);
        assert!(!scheduler.record().running);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_tick_lets_tick_finish() {
        let scheduler = IntervalScheduler::periodic(Duration::from_secs(1)).expect("scheduler");
        let cancel = CancellationToken::new();
        let finished = AtomicUsize::new(0);

        let stop = scheduler
            .run(&cancel, || {
                cancel.cancel();
                let finished = &finished;
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .expect("run");

        assert_eq!(stop, SchedulerStop::Cancelled);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_run_is_rejected_without_disturbing_first() {
        let scheduler =
            Arc::new(IntervalScheduler::periodic(Duration::from_secs(60)).expect("scheduler"));
        let cancel = CancellationToken::new();

        let first = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(&cancel, || async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = scheduler
            .run(&CancellationToken::new(), || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, WitchError::AlreadyRunning));
        assert!(scheduler.record().running);
        assert_eq!(scheduler.record().ticks, 1);

        cancel.cancel();
        let stop = first.await.expect("join").expect("first run");
        assert_eq!(stop, SchedulerStop::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_run_releases_single_flight() {
        let scheduler = IntervalScheduler::periodic(Duration::from_secs(2)).expect("scheduler");
        let cancel = CancellationToken::new();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.run(&cancel, || async { Ok(()) }),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!scheduler.record().running);

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.run(&cancel, || async { Ok(()) }),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(scheduler.record().ticks, 2);
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            IntervalScheduler::periodic(Duration::ZERO),
            Err(WitchError::Config(_))
        ));
    }
}
