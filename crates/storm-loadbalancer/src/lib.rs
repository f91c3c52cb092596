//! Load-balancer reconciler.
//!
//! Driven by the applications monitor: every exposed service of every
//! observed application gets a dedicated HAProxy instance plus
//! slot-based backend membership tracking the exposed group.

mod backend;
mod recipe;
mod server;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use storm_api::{ApiClient, ApiError, TriggerDriver};
use storm_core::{Application, Group, ServiceRef};
use storm_executor::{
    ApplicationsDiff, ApplicationsMonitor, ExecutorError, ExecutorResult, GroupWatch, Reconciler,
};

pub use backend::{backend_diff, GroupBackendManager};
pub use recipe::{lb_recipe, LB_RECIPE, SLOT_COUNT};
pub use server::SingleServerManager;

/// Shared state of the load-balancer executor.
pub struct LbContext {
    pub api: ApiClient,
    pub driver: TriggerDriver,
    pub pool_group: String,
}

impl LbContext {
    pub fn new(api: ApiClient, nodes_pool: &str) -> Self {
        let driver = TriggerDriver::new(api.clone());
        Self {
            api,
            driver,
            pool_group: nodes_pool.to_string(),
        }
    }
}

/// One load-balanced exposed service.
pub struct ManagedService {
    pub app: String,
    pub expose: ServiceRef,
    pub port: u16,
    /// Group holding the HAProxy container for this service.
    pub lb_group: String,
    /// Watch over the exposed component group's membership.
    pub watch: GroupWatch,
    /// `host:port` of the instance's runtime socket, once resolved.
    pub runtime_addr: Option<String>,
}

/// Group name backing one exposed service's load balancer.
pub fn lb_group_name(app: &str, expose: &ServiceRef) -> String {
    format!("{app}-{}-{}-lb", expose.component, expose.service)
}

fn service_key(app: &str, expose: &ServiceRef) -> String {
    format!("{app}/{expose}")
}

pub struct LoadBalancerReconciler {
    ctx: LbContext,
    monitor: ApplicationsMonitor,
    services: BTreeMap<String, ManagedService>,
    pending: ApplicationsDiff,
    server: SingleServerManager,
    backend: GroupBackendManager,
}

impl LoadBalancerReconciler {
    pub fn new(api: ApiClient, nodes_pool: &str) -> Self {
        Self {
            ctx: LbContext::new(api, nodes_pool),
            monitor: ApplicationsMonitor::new(),
            services: BTreeMap::new(),
            pending: ApplicationsDiff::default(),
            server: SingleServerManager,
            backend: GroupBackendManager,
        }
    }

    /// Start managing every exposed service of an application.
    async fn add_application(&mut self, app: &Application) {
        for expose in &app.expose {
            let key = service_key(&app.name, expose);
            if self.services.contains_key(&key) {
                continue;
            }

            // The exposed service must be declared on its component
            // group; that declaration carries the frontend port.
            let port = match self.ctx.api.groups().get(&expose.component).await {
                Ok(group) => {
                    if let Err(reason) = group.validate() {
                        warn!(app = %app.name, service = %expose, %reason, "component group invalid, skipped");
                        continue;
                    }
                    match group.service(&expose.service) {
                        Some(spec) => spec.port,
                        None => {
                            warn!(
                                app = %app.name,
                                service = %expose,
                                "exposed service not declared on its component group, skipped"
                            );
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!(app = %app.name, service = %expose, error = %e,
                          "component group unavailable, skipped");
                    continue;
                }
            };

            let lb_group = lb_group_name(&app.name, expose);
            if let Err(e) = self
                .ctx
                .api
                .groups()
                .update_or_create(&Group::named(lb_group.clone()))
                .await
            {
                warn!(service = %expose, error = %e, "cannot upsert load-balancer group, skipped");
                continue;
            }

            info!(app = %app.name, service = %expose, port, "managing exposed service");
            self.services.insert(
                key,
                ManagedService {
                    app: app.name.clone(),
                    expose: expose.clone(),
                    port,
                    lb_group,
                    watch: GroupWatch::new(&expose.component),
                    runtime_addr: None,
                },
            );
        }
    }

    /// Stop managing an application's services. The HAProxy containers
    /// are left running; tearing them down is an operator decision.
    fn remove_application(&mut self, name: &str) {
        self.services.retain(|_, service| {
            if service.app == name {
                info!(app = name, service = %service.expose, "application gone, unmanaging service");
                false
            } else {
                true
            }
        });
    }

    /// Drop services an updated application no longer exposes.
    fn prune_application(&mut self, app: &Application) {
        self.services.retain(|_, service| {
            if service.app == app.name && !app.expose.contains(&service.expose) {
                info!(app = %app.name, service = %service.expose, "service no longer exposed, unmanaging");
                false
            } else {
                true
            }
        });
    }
}

#[async_trait]
impl Reconciler for LoadBalancerReconciler {
    async fn setup(&mut self) -> ExecutorResult<()> {
        self.ctx
            .api
            .groups()
            .get(&self.ctx.pool_group)
            .await
            .map_err(|e| match e {
                ApiError::NotFound { .. } => {
                    ExecutorError::Config(format!("nodes pool {} not found", self.ctx.pool_group))
                }
                other => other.into(),
            })?;

        self.ctx.api.recipes().update_or_create(&lb_recipe()).await?;

        info!(pool = %self.ctx.pool_group, "load-balancer executor ready");
        Ok(())
    }

    async fn poll(&mut self) -> ExecutorResult<bool> {
        let diff = self.monitor.poll(&self.ctx.api).await?;
        let mut changed = !diff.is_empty();

        // Accumulate until consumed; a transiently failed run must not
        // lose the applications it was about to pick up.
        self.pending.added.extend(diff.added);
        self.pending.updated.extend(diff.updated);
        self.pending.deleted.extend(diff.deleted);

        for service in self.services.values_mut() {
            if service.watch.changed(&self.ctx.api).await? {
                changed = true;
            }
        }

        Ok(changed)
    }

    async fn run(&mut self) -> ExecutorResult<()> {
        let diff = std::mem::take(&mut self.pending);

        for app in &diff.deleted {
            self.remove_application(&app.name);
        }
        for app in &diff.updated {
            self.prune_application(app);
            self.add_application(app).await;
        }
        for app in &diff.added {
            self.add_application(app).await;
        }

        // One broken service never stops the reconcile of the others.
        let ctx = &self.ctx;
        let server = &self.server;
        let backend = &self.backend;
        for (key, service) in self.services.iter_mut() {
            let outcome = async {
                server.update(ctx, service).await?;
                backend.update(ctx, service).await
            }
            .await;

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(service = %key, error = %e, "service reconcile failed, retrying next tick"),
            }
        }

        Ok(())
    }
}
