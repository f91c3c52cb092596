//! Trigger handler host.
//!
//! Dequeues pending triggers for one handler name, claims each,
//! dispatches to the worker, and publishes the outcome. A heartbeat
//! keeps claimed triggers alive while the worker runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use storm_api::{claim, complete, fail, ApiClient, Heartbeat};
use storm_core::{Query, Trigger};

use crate::error::{ExecutorError, ExecutorResult};

/// Executes one kind of trigger.
#[async_trait]
pub trait TriggerWorker: Send + Sync {
    /// The trigger name this worker handles (the handler selector,
    /// e.g. `recipe`).
    fn name(&self) -> &str;

    /// Execute a claimed trigger, returning its result map.
    async fn execute(
        &self,
        api: &ApiClient,
        trigger: &Trigger,
    ) -> ExecutorResult<BTreeMap<String, Value>>;
}

/// Hosts a [`TriggerWorker`], feeding it pending triggers.
pub struct HandlerHost<W> {
    api: ApiClient,
    worker: W,
    poll_interval: Duration,
}

impl<W: TriggerWorker> HandlerHost<W> {
    pub fn new(api: ApiClient, worker: W) -> Self {
        Self {
            api,
            worker,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll-and-dispatch until the shutdown signal fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ExecutorResult<()> {
        info!(handler = self.worker.name(), "handler host started");

        loop {
            match self.drain().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "trigger dispatch failed, retrying next tick"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!(handler = self.worker.name(), "handler host stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Handle every pending trigger currently queued for this worker.
    /// Returns the number of triggers dispatched.
    pub async fn drain(&self) -> ExecutorResult<usize> {
        let pending = self
            .api
            .triggers()
            .query(&Query::and([
                Query::eq("status", "pending"),
                Query::eq("name", self.worker.name()),
            ]))
            .await?;

        let mut dispatched = 0;
        for trigger in pending {
            // Another host may have claimed it since the listing.
            let claimed = match claim(&self.api, &trigger).await {
                Ok(t) => t,
                Err(e) if e.is_conflict() || e.is_not_found() || e.is_transient() => {
                    debug!(uuid = %trigger.uuid, error = %e, "trigger not claimable, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.dispatch(&claimed).await?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn dispatch(&self, trigger: &Trigger) -> ExecutorResult<()> {
        let heartbeat = Heartbeat::start(self.api.clone(), trigger.uuid);
        let outcome = self.worker.execute(&self.api, trigger).await;
        heartbeat.stop();

        match outcome {
            Ok(result) => {
                if let Err(e) = complete(&self.api, trigger.uuid, result).await {
                    warn!(uuid = %trigger.uuid, error = %e, "failed to publish trigger result");
                }
                info!(uuid = %trigger.uuid, "trigger done");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(publish_err) = fail(&self.api, trigger.uuid, &reason).await {
                    warn!(uuid = %trigger.uuid, error = %publish_err, "failed to publish trigger failure");
                }
                warn!(uuid = %trigger.uuid, %reason, "trigger failed");

                // Desired state the handler cannot interpret takes the
                // whole host down, not just this trigger.
                if e.is_fatal() {
                    return Err(e);
                }
                Ok(())
            }
        }
    }
}
