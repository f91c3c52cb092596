//! Client fan-out: one Consul client per UP pool node.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use storm_core::{Node, RecipeInvocation};
use storm_executor::ExecutorResult;

use crate::recipes::CLIENT_RECIPE;
use crate::ConsulContext;

/// Starts a Consul client on every UP pool node that has neither a
/// client container nor the server.
pub struct ClientsManager;

impl ClientsManager {
    pub async fn update(&self, ctx: &ConsulContext) -> ExecutorResult<()> {
        let Some((_, server_node)) = ctx.server_deployment().await? else {
            debug!("no consul server yet, skipping client fan-out");
            return Ok(());
        };
        let server_ip = ctx.api.shortcuts().address_for(&server_node)?;

        // A pool node already has a client when its engine hosts one of
        // the client containers.
        let clients = ctx.api.groups().members(&ctx.clients_group, None).await?;
        let client_engines: HashSet<String> = clients
            .iter()
            .filter_map(|member| member.engine.as_ref().map(|engine| engine.id.clone()))
            .collect();

        let pool_nodes = ctx.pool_nodes().await?;
        let have: HashSet<String> = pool_nodes
            .iter()
            .filter(|node| client_engines.contains(&node.engine.id))
            .map(|node| node.cloud_id.clone())
            .chain([server_node.cloud_id.clone()])
            .collect();

        for node in missing_client_nodes(&pool_nodes, &have) {
            // One bad node never stops the fan-out to the others.
            let address = match ctx.api.shortcuts().address_for(node) {
                Ok(address) => address,
                Err(e) => {
                    warn!(node = %node.cloud_id, error = %e, "skipping client, unresolvable address");
                    continue;
                }
            };

            let invocation = RecipeInvocation::new(CLIENT_RECIPE)
                .param("DATACENTER", ctx.datacenter.as_str())
                .param("SERVER_ADDRESS", server_ip.as_str())
                .param("CLIENT_ADDRESS", address.as_str())
                .target_node(node.cloud_id.as_str())
                .add_to(ctx.clients_group.as_str());

            match ctx.driver.run_recipe(&invocation).await {
                Ok(_) => info!(node = %node.cloud_id, %address, "consul client started"),
                Err(e) => warn!(
                    node = %node.cloud_id,
                    error = %e,
                    "consul client trigger failed, retrying next tick"
                ),
            }
        }

        Ok(())
    }
}

/// UP pool nodes that are not yet covered by a client or the server.
fn missing_client_nodes<'a>(pool: &'a [Node], have: &HashSet<String>) -> Vec<&'a Node> {
    pool.iter()
        .filter(|node| node.is_up() && !have.contains(&node.cloud_id))
        .collect()
}
