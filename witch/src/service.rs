//! Binds a unit of work to a scheduler and its own scoped state.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::io::scoped_state::ScopedState;
use crate::io::state_store::StateStore;
use crate::scheduler::{IntervalScheduler, SchedulerStop};

/// A unit of work executed once per scheduler tick.
pub trait Work: Send {
    fn execute(&mut self, state: &ScopedState) -> impl Future<Output = Result<()>> + Send;
}

/// A scheduled [`Work`] with durable memory under a stable namespace.
pub struct Service<W> {
    scheduler: IntervalScheduler,
    state: ScopedState,
    work: Mutex<W>,
}

impl<W: Work> Service<W> {
    pub fn new(
        scheduler: IntervalScheduler,
        store: Arc<StateStore>,
        namespace: &str,
        work: W,
    ) -> Result<Self> {
        Ok(Self {
            scheduler,
            state: ScopedState::new(store, namespace)?,
            work: Mutex::new(work),
        })
    }

    /// Run the work on the scheduler until cancelled, failed, or completed.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SchedulerStop> {
        self.scheduler
            .run(cancel, move || async move {
                let mut work = self.work.lock().await;
                work.execute(&self.state).await
            })
            .await
    }

    pub fn state(&self) -> &ScopedState {
        &self.state
    }

    pub fn scheduler(&self) -> &IntervalScheduler {
        &self.scheduler
    }

    /// Locked access to the work value. Waits for an in-flight tick to finish.
    pub async fn work(&self) -> MutexGuard<'_, W> {
        self.work.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::WitchError;

    /// Adds `step` to an in-memory value and persists the tick count.
    struct CountWork {
        value: i64,
        step: i64,
    }

    impl Work for CountWork {
        async fn execute(&mut self, state: &ScopedState) -> Result<()> {
            self.value += self.step;
            let ticks: u64 = state.get_or("ticks", 0)?;
            state.set("ticks", &(ticks + 1))
        }
    }

    fn count_service(
        temp: &tempfile::TempDir,
        interval: Duration,
        namespace: &str,
    ) -> Service<CountWork> {
        let store =
            Arc::new(StateStore::open_json(temp.path().join("state.json")).expect("store"));
        Service::new(
            IntervalScheduler::periodic(interval).expect("scheduler"),
            store,
            namespace,
            CountWork { value: 0, step: 1 },
        )
        .expect("service")
    }

    #[tokio::test(start_paused = true)]
    async fn service_ticks_and_resumes_after_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let interval = Duration::from_secs(2);
        let service = count_service(&temp, interval, "count-service");
        let cancel = CancellationToken::new();

        // Shorter than one interval: exactly one tick.
        let res =
            tokio::time::timeout(interval - Duration::from_secs(1), service.run(&cancel)).await;
        assert!(res.is_err());
        assert_eq!(service.work().await.value, 1);

        // A fresh run starts with an immediate tick.
        let res =
            tokio::time::timeout(interval - Duration::from_secs(1), service.run(&cancel)).await;
        assert!(res.is_err());
        assert_eq!(service.work().await.value, 2);
        assert_eq!(service.state().get_or("ticks", 0u64).expect("ticks"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_concurrent_run_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let service = Arc::new(count_service(&temp, Duration::from_secs(2), "count-service"));
        let cancel = CancellationToken::new();

        let running = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = service.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WitchError::AlreadyRunning));

        cancel.cancel();
        let stop = running.await.expect("join").expect("run");
        assert_eq!(stop, SchedulerStop::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn state_survives_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let once = || {
            let store =
                Arc::new(StateStore::open_json(temp.path().join("state.json")).expect("store"));
            Service::new(
                IntervalScheduler::one_shot(),
                store,
                "count-service",
                CountWork { value: 0, step: 5 },
            )
            .expect("service")
        };

        once().run(&CancellationToken::new()).await.expect("first");
        let restarted = once();
        restarted.run(&CancellationToken::new()).await.expect("second");
        assert_eq!(restarted.state().get_or("ticks", 0u64).expect("ticks"), 2);
        assert_eq!(restarted.work().await.value, 5);
    }
}
