//! Consul cluster reconciler.
//!
//! Keeps one Consul deployment converged per nodes pool: exactly one
//! server, a client on every other UP node, a service catalog that
//! mirrors the declared group services, and WAN links to federated
//! pools. Sub-managers run sequentially every tick; later managers
//! read state the earlier ones just established.

mod catalog;
mod clients;
mod federation;
mod recipes;
mod server;
mod services;

use async_trait::async_trait;
use tracing::info;

use storm_api::{ApiClient, ApiError, ApiResult, TriggerDriver};
use storm_core::{Group, Member, Node, Query};
use storm_executor::{ExecutorError, ExecutorResult, GroupWatch, Reconciler};

pub use catalog::{CatalogClient, CONSUL_HTTP_PORT, MANAGED_TAG};
pub use clients::ClientsManager;
pub use federation::FederationManager;
pub use recipes::{
    client_recipe, join_wan_recipe, server_recipe, CLIENT_RECIPE, JOIN_WAN_RECIPE, SERVER_RECIPE,
};
pub use server::ServerManager;
pub use services::{ServiceInstance, ServicesManager};

pub fn server_group_name(pool: &str) -> String {
    format!("{pool}-consul-server")
}

pub fn server_nodes_group_name(pool: &str) -> String {
    format!("{pool}-consul-server-nodes")
}

pub fn clients_group_name(pool: &str) -> String {
    format!("{pool}-consul-clients")
}

/// Shared state of one Consul executor: the API client, the trigger
/// driver, and the resolved group names. The pool name doubles as the
/// Consul datacenter.
pub struct ConsulContext {
    pub api: ApiClient,
    pub driver: TriggerDriver,
    pub datacenter: String,
    pub pool_group: String,
    pub server_group: String,
    pub server_nodes_group: String,
    pub clients_group: String,
    pub federate: Vec<String>,
}

impl ConsulContext {
    pub fn new(api: ApiClient, nodes_pool: &str, federate: Vec<String>) -> Self {
        let driver = TriggerDriver::new(api.clone());
        Self {
            api,
            driver,
            datacenter: nodes_pool.to_string(),
            pool_group: nodes_pool.to_string(),
            server_group: server_group_name(nodes_pool),
            server_nodes_group: server_nodes_group_name(nodes_pool),
            clients_group: clients_group_name(nodes_pool),
            federate,
        }
    }

    /// Node records backing the members of `group`.
    pub async fn nodes_in_group(&self, group: &str) -> ApiResult<Vec<Node>> {
        let members = self.api.groups().members(group, None).await?;
        let ids: Vec<String> = members.into_iter().map(|m| m.cloud_id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.api.nodes().query(&Query::is_in("cloud_id", ids)).await
    }

    /// Node records of the pool.
    pub async fn pool_nodes(&self) -> ApiResult<Vec<Node>> {
        self.nodes_in_group(&self.pool_group).await
    }

    /// The running Consul server container and its host node, if any.
    ///
    /// An unresolvable host is reported but treated as absent; the
    /// server manager will re-establish the deployment.
    pub async fn server_deployment(&self) -> ExecutorResult<Option<(Member, Node)>> {
        let members = self.api.groups().members(&self.server_group, None).await?;
        let Some(member) = members.into_iter().find(Member::is_up) else {
            return Ok(None);
        };

        match self.api.shortcuts().node_for(&member).await {
            Ok(node) => Ok(Some((member, node))),
            Err(e @ ApiError::Resolution(_)) => {
                tracing::warn!(error = %e, "cannot resolve consul server host");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The Consul reconciler: four sub-managers over one shared context.
pub struct ConsulReconciler {
    ctx: ConsulContext,
    watches: Vec<GroupWatch>,
    server: ServerManager,
    clients: ClientsManager,
    services: ServicesManager,
    federation: FederationManager,
}

impl ConsulReconciler {
    pub fn new(api: ApiClient, nodes_pool: &str, federate: Vec<String>) -> Self {
        let ctx = ConsulContext::new(api, nodes_pool, federate);
        let watches = vec![
            GroupWatch::new(&ctx.pool_group),
            GroupWatch::new(&ctx.server_group),
            GroupWatch::new(&ctx.clients_group),
        ];
        Self {
            ctx,
            watches,
            server: ServerManager,
            clients: ClientsManager,
            services: ServicesManager::new(),
            federation: FederationManager::new(),
        }
    }
}

#[async_trait]
impl Reconciler for ConsulReconciler {
    async fn setup(&mut self) -> ExecutorResult<()> {
        // The pool is operator-provided; a missing pool is
        // misconfiguration, not a condition to converge on.
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

        for name in [
            &self.ctx.server_group,
            &self.ctx.server_nodes_group,
            &self.ctx.clients_group,
        ] {
            self.ctx
                .api
                .groups()
                .update_or_create(&Group::named(name.clone()))
                .await?;
        }

        for recipe in [server_recipe(), client_recipe(), join_wan_recipe()] {
            self.ctx.api.recipes().update_or_create(&recipe).await?;
        }

        info!(
            pool = %self.ctx.pool_group,
            datacenter = %self.ctx.datacenter,
            federate = ?self.ctx.federate,
            "consul executor ready"
        );
        Ok(())
    }

    async fn poll(&mut self) -> ExecutorResult<bool> {
        // Every watch refreshes its snapshot, even once a change is
        // already known; a skipped refresh would re-report the same
        // change next tick.
        let mut changed = false;
        for watch in &mut self.watches {
            if watch.changed(&self.ctx.api).await? {
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn run(&mut self) -> ExecutorResult<()> {
        self.server.update(&self.ctx).await?;
        self.clients.update(&self.ctx).await?;
        self.services.update(&self.ctx).await?;
        self.federation.update(&self.ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_group_names() {
        assert_eq!(server_group_name("p1"), "p1-consul-server");
        assert_eq!(server_nodes_group_name("p1"), "p1-consul-server-nodes");
        assert_eq!(clients_group_name("p1"), "p1-consul-clients");
    }

    #[test]
    fn context_uses_pool_as_datacenter() {
        let api = ApiClient::new("http://127.0.0.1:8000/").unwrap();
        let ctx = ConsulContext::new(api, "p1", vec!["p2".to_string()]);
        assert_eq!(ctx.datacenter, "p1");
        assert_eq!(ctx.server_group, "p1-consul-server");
        assert_eq!(ctx.federate, ["p2"]);
    }
}
