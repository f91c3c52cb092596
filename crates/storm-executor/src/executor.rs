//! The generic polling executor.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ExecutorResult;

/// A component that drives observed state toward desired state.
#[async_trait]
pub trait Reconciler: Send {
    /// One-time initialisation: resolve groups, upsert recipes,
    /// instantiate sub-managers.
    async fn setup(&mut self) -> ExecutorResult<()>;

    /// Whether observed state has changed since the last snapshot.
    /// Implementations update their snapshot before deciding, so a
    /// single change triggers exactly one reconcile.
    async fn poll(&mut self) -> ExecutorResult<bool>;

    /// One reconcile pass.
    async fn run(&mut self) -> ExecutorResult<()>;
}

/// Runs a reconciler forever: setup, then poll-and-reconcile every
/// `poll_interval` until the shutdown signal fires.
///
/// Transient errors are logged and retried on the next tick; fatal
/// errors (desired state the executor cannot interpret) propagate and
/// terminate the process. The loop only exits between reconciles, so
/// an in-flight reconcile always finishes.
pub struct PollingExecutor<R> {
    reconciler: R,
    poll_interval: Duration,
}

impl<R: Reconciler> PollingExecutor<R> {
    pub fn new(reconciler: R, poll_interval: Duration) -> Self {
        Self {
            reconciler,
            poll_interval,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ExecutorResult<()> {
        self.reconciler.setup().await?;
        info!("executor setup complete");

        // The first iteration always reconciles; afterwards a failed
        // reconcile keeps the flag raised so it is retried even if the
        // membership snapshot saw no further change.
        let mut force = true;

        loop {
            match self.tick(force).await {
                Ok(ran) => {
                    if ran {
                        force = false;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal error, stopping executor");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "reconcile failed, retrying next tick");
                    force = true;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping executor");
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&mut self, force: bool) -> ExecutorResult<bool> {
        let changed = self.reconciler.poll().await?;
        if !changed && !force {
            return Ok(false);
        }

        debug!(changed, force, "running reconcile");
        self.reconciler.run().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use storm_api::ApiError;

    struct Script {
        polls: Vec<bool>,
        poll_count: Arc<AtomicUsize>,
        run_count: Arc<AtomicUsize>,
        fail_runs: usize,
        fatal_on_run: bool,
    }

    #[async_trait]
    impl Reconciler for Script {
        async fn setup(&mut self) -> ExecutorResult<()> {
            Ok(())
        }

        async fn poll(&mut self) -> ExecutorResult<bool> {
            let i = self.poll_count.fetch_add(1, Ordering::SeqCst);
            Ok(self.polls.get(i).copied().unwrap_or(false))
        }

        async fn run(&mut self) -> ExecutorResult<()> {
            let i = self.run_count.fetch_add(1, Ordering::SeqCst);
            if self.fatal_on_run {
                return Err(ExecutorError::Config("bad desired state".to_string()));
            }
            if i < self.fail_runs {
                return Err(ExecutorError::Api(ApiError::Client {
                    status: 503,
                    body: String::new(),
                }));
            }
            Ok(())
        }
    }

    fn script(polls: Vec<bool>) -> (Script, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let poll_count = Arc::new(AtomicUsize::new(0));
        let run_count = Arc::new(AtomicUsize::new(0));
        (
            Script {
                polls,
                poll_count: poll_count.clone(),
                run_count: run_count.clone(),
                fail_runs: 0,
                fatal_on_run: false,
            },
            poll_count,
            run_count,
        )
    }

    async fn drive(reconciler: Script, ticks: u64) -> ExecutorResult<()> {
        let executor = PollingExecutor::new(reconciler, Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(executor.run(rx));
        tokio::time::sleep(Duration::from_millis(5 * ticks)).await;
        let _ = tx.send(true);
        task.await.unwrap()
    }

    #[tokio::test]
    async fn first_iteration_always_reconciles() {
        let (reconciler, _, runs) = script(vec![false, false, false]);
        drive(reconciler, 4).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn change_triggers_exactly_one_reconcile() {
        // Tick 1: forced. Tick 2: change. Ticks 3+: quiet.
        let (reconciler, _, runs) = script(vec![false, true, false, false, false]);
        drive(reconciler, 6).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_run_failure_is_retried() {
        let (mut reconciler, _, runs) = script(vec![false; 8]);
        reconciler.fail_runs = 2;
        drive(reconciler, 6).await.unwrap();
        // Two failed attempts plus the successful retry.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_the_loop() {
        let (mut reconciler, _, _) = script(vec![false; 8]);
        reconciler.fatal_on_run = true;

        let executor = PollingExecutor::new(reconciler, Duration::from_millis(5));
        let (_tx, rx) = watch::channel(false);
        let result = executor.run(rx).await;
        assert!(matches!(result, Err(ExecutorError::Config(_))));
    }
}
