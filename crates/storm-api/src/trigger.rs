//! Trigger driver and handler-side protocol.
//!
//! Reconcilers submit triggers and wait for a terminal status; handler
//! hosts claim pending triggers, keep them alive with heartbeats, and
//! publish the result.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use storm_core::{RecipeInvocation, Trigger};

use crate::client::{ApiClient, ApiResource};
use crate::error::{ApiError, ApiResult};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval at which a handler refreshes a running trigger. The server
/// reaps running triggers whose heartbeat goes stale.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct NewTrigger<'a> {
    name: &'a str,
    arguments: &'a BTreeMap<String, Value>,
}

/// Submits triggers and waits for their completion.
#[derive(Debug, Clone)]
pub struct TriggerDriver {
    client: ApiClient,
    poll_interval: Duration,
}

impl TriggerDriver {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Create a trigger and return its handle.
    pub async fn submit(
        &self,
        name: &str,
        arguments: BTreeMap<String, Value>,
    ) -> ApiResult<Trigger> {
        let trigger: Trigger = self
            .client
            .send_json(
                Method::POST,
                Trigger::PATH,
                &NewTrigger {
                    name,
                    arguments: &arguments,
                },
            )
            .await?;
        debug!(uuid = %trigger.uuid, name, "trigger submitted");
        Ok(trigger)
    }

    /// Poll until the trigger reaches a terminal status.
    ///
    /// The trigger is deleted best-effort once terminal; an `error`
    /// status surfaces as [`ApiError::TriggerFailed`].
    pub async fn wait(&self, mut trigger: Trigger) -> ApiResult<Trigger> {
        while !trigger.is_complete() {
            tokio::time::sleep(self.poll_interval).await;
            trigger = self.client.triggers().get(&trigger.identifier()).await?;
        }

        if let Err(e) = self.client.triggers().destroy(&trigger.identifier()).await {
            warn!(uuid = %trigger.uuid, error = %e, "failed to delete completed trigger");
        }

        if trigger.is_error() {
            return Err(ApiError::TriggerFailed {
                uuid: trigger.uuid,
                reason: trigger
                    .error_reason()
                    .unwrap_or("no reason reported")
                    .to_string(),
            });
        }

        Ok(trigger)
    }

    /// Submit and wait.
    pub async fn run(&self, name: &str, arguments: BTreeMap<String, Value>) -> ApiResult<Trigger> {
        let trigger = self.submit(name, arguments).await?;
        self.wait(trigger).await
    }

    /// Submit a `recipe` trigger and wait for it.
    pub async fn run_recipe(&self, invocation: &RecipeInvocation) -> ApiResult<Trigger> {
        self.run("recipe", invocation.to_arguments()).await
    }
}

// ── Handler side ───────────────────────────────────────────────────

/// Claim a pending trigger for execution and return its fresh state.
pub async fn claim(client: &ApiClient, trigger: &Trigger) -> ApiResult<Trigger> {
    client
        .post_action(&format!("v1/triggers/{}/handle/", trigger.uuid))
        .await?;
    client.triggers().get(&trigger.identifier()).await
}

/// Publish a successful result.
pub async fn complete(
    client: &ApiClient,
    uuid: Uuid,
    result: BTreeMap<String, Value>,
) -> ApiResult<()> {
    client
        .send_json_discard(
            Method::PATCH,
            &format!("v1/triggers/{uuid}/"),
            &json!({ "status": "done", "result": result }),
        )
        .await
}

/// Publish a failure with its reason.
pub async fn fail(client: &ApiClient, uuid: Uuid, reason: &str) -> ApiResult<()> {
    client
        .send_json_discard(
            Method::PATCH,
            &format!("v1/triggers/{uuid}/"),
            &json!({ "status": "error", "result": { "reason": reason } }),
        )
        .await
}

/// Background heartbeat for a claimed trigger.
pub struct Heartbeat {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the heartbeat loop for `uuid`.
    pub fn start(client: ApiClient, uuid: Uuid) -> Self {
        Self::with_interval(client, uuid, HEARTBEAT_INTERVAL)
    }

    pub fn with_interval(client: ApiClient, uuid: Uuid, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let path = format!("v1/triggers/{uuid}/heartbeat/");
                        if let Err(e) = client.post_action(&path).await {
                            warn!(%uuid, error = %e, "trigger heartbeat failed");
                        } else {
                            debug!(%uuid, "trigger heartbeat sent");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the heartbeat.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}
