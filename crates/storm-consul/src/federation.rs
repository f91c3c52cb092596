//! WAN federation with remote pools.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use storm_core::{Member, RecipeInvocation};
use storm_executor::ExecutorResult;

use crate::recipes::JOIN_WAN_RECIPE;
use crate::{server_group_name, ConsulContext};

/// Joins the local server to each federated pool's server over WAN.
///
/// A remote pool is only joined while it has exactly one UP server;
/// any other count is surfaced as a warning and skipped this tick.
/// Successful joins are remembered so the join is submitted once per
/// executor lifetime (the join itself is idempotent on restart).
pub struct FederationManager {
    joined: BTreeSet<String>,
}

impl Default for FederationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FederationManager {
    pub fn new() -> Self {
        Self {
            joined: BTreeSet::new(),
        }
    }

    pub async fn update(&mut self, ctx: &ConsulContext) -> ExecutorResult<()> {
        if ctx.federate.is_empty() {
            return Ok(());
        }

        let Some((server_member, _)) = ctx.server_deployment().await? else {
            debug!("no local consul server yet, skipping federation");
            return Ok(());
        };

        for pool in &ctx.federate {
            if self.joined.contains(pool) {
                continue;
            }
            self.join_pool(ctx, pool, &server_member).await;
        }

        Ok(())
    }

    async fn join_pool(&mut self, ctx: &ConsulContext, pool: &str, server_member: &Member) {
        let remote_group = server_group_name(pool);
        let members = match ctx.api.groups().members(&remote_group, None).await {
            Ok(members) => members,
            Err(e) => {
                warn!(pool, error = %e, "remote server group unavailable, skipping WAN join");
                return;
            }
        };

        let up: Vec<&Member> = members.iter().filter(|m| m.is_up()).collect();
        if up.len() != 1 {
            warn!(
                pool,
                servers = up.len(),
                "skipping WAN join, expected exactly one UP remote server"
            );
            return;
        }

        let wan_address = match ctx.api.shortcuts().address_for_member(up[0]).await {
            Ok(address) => address,
            Err(e) => {
                warn!(pool, error = %e, "remote server unresolvable, skipping WAN join");
                return;
            }
        };

        let invocation = RecipeInvocation::new(JOIN_WAN_RECIPE)
            .param("WAN_ADDRESS", wan_address.as_str())
            .target_node(server_member.cloud_id.as_str());

        match ctx.driver.run_recipe(&invocation).await {
            Ok(_) => {
                info!(pool, address = %wan_address, "WAN federation established");
                self.joined.insert(pool.to_string());
            }
            Err(e) => {
                warn!(pool, error = %e, "WAN join trigger failed, retrying next tick");
            }
        }
    }
}
