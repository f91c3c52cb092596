//! Server election and placement.

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use storm_core::{Member, Node, RecipeInvocation};
use storm_executor::ExecutorResult;

use crate::recipes::SERVER_RECIPE;
use crate::ConsulContext;

/// Ensures the pool has one running Consul server.
///
/// Placement is sticky: once a node lands in the server-nodes group it
/// stays the preferred host, so a crashed server container comes back
/// on the same node.
pub struct ServerManager;

impl ServerManager {
    pub async fn update(&self, ctx: &ConsulContext) -> ExecutorResult<()> {
        let servers = ctx.api.groups().members(&ctx.server_group, None).await?;
        if servers.iter().any(Member::is_up) {
            debug!(group = %ctx.server_group, "consul server already running");
            return Ok(());
        }

        let Some(node) = self.pick_server_node(ctx).await? else {
            warn!(pool = %ctx.pool_group, "no UP node available to host the consul server");
            return Ok(());
        };

        // Idempotent: re-adding an existing member is a no-op.
        ctx.api
            .groups()
            .add_members(&ctx.server_nodes_group, std::slice::from_ref(&node.cloud_id))
            .await?;

        let address = ctx.api.shortcuts().address_for(&node)?;
        let invocation = RecipeInvocation::new(SERVER_RECIPE)
            .param("DATACENTER", ctx.datacenter.as_str())
            .param("SERVER_ADDRESS", address.as_str())
            .param("CLIENT_ADDRESS", address.as_str())
            .target_node(node.cloud_id.as_str())
            .add_to(ctx.server_group.as_str());

        info!(node = %node.cloud_id, %address, "starting consul server");
        match ctx.driver.run_recipe(&invocation).await {
            Ok(_) => info!(node = %node.cloud_id, "consul server started"),
            Err(e) => warn!(
                node = %node.cloud_id,
                error = %e,
                "consul server trigger failed, retrying next tick"
            ),
        }
        Ok(())
    }

    /// Prefer an UP member of the server-nodes group; fall back to a
    /// uniform-random UP node of the pool.
    async fn pick_server_node(&self, ctx: &ConsulContext) -> ExecutorResult<Option<Node>> {
        let preferred = ctx.nodes_in_group(&ctx.server_nodes_group).await?;
        if let Some(node) = preferred.into_iter().find(Node::is_up) {
            debug!(node = %node.cloud_id, "reusing designated server node");
            return Ok(Some(node));
        }

        let pool: Vec<Node> = ctx
            .pool_nodes()
            .await?
            .into_iter()
            .filter(Node::is_up)
            .collect();
        Ok(pool.choose(&mut rand::thread_rng()).cloned())
    }
}
