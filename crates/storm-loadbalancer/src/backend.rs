//! Backend membership reconciliation over the HAProxy slot table.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use storm_executor::{ExecutorError, ExecutorResult};
use storm_haproxy::{HaproxyError, RuntimeClient};

use crate::{LbContext, ManagedService};

/// Converges one HAProxy backend onto the addresses backing the
/// exposed service. Removals run first so freed slots are available
/// to the adds of the same tick.
pub struct GroupBackendManager;

impl GroupBackendManager {
    pub async fn update(&self, ctx: &LbContext, service: &ManagedService) -> ExecutorResult<()> {
        let Some(runtime_addr) = &service.runtime_addr else {
            debug!(service = %service.expose, "no load-balancer instance yet, skipping backend sync");
            return Ok(());
        };

        let desired = self.desired_endpoints(ctx, service).await?;

        let client = RuntimeClient::new(runtime_addr.clone());
        let mut table = client.slots().await.map_err(runtime_error)?;
        let observed = table.members();

        let (to_remove, to_add) = backend_diff(&desired, &observed);
        if !to_remove.is_empty() || !to_add.is_empty() {
            info!(
                service = %service.expose,
                remove = to_remove.len(),
                add = to_add.len(),
                "backend drift detected"
            );
        }

        for addr in to_remove {
            client
                .remove_member(&mut table, &addr)
                .await
                .map_err(runtime_error)?;
            info!(service = %service.expose, %addr, "backend member drained");
        }

        for addr in to_add {
            match client.add_member(&mut table, &addr).await {
                Ok(slot) => {
                    info!(service = %service.expose, %addr, %slot, "backend member enabled")
                }
                Err(HaproxyError::NoFreeSlot { backend }) => {
                    // Capacity limit: members beyond the slot pool are
                    // dropped until existing members leave.
                    warn!(
                        service = %service.expose,
                        backend,
                        "slot pool exhausted, remaining members dropped this tick"
                    );
                    break;
                }
                Err(e) => return Err(runtime_error(e)),
            }
        }

        Ok(())
    }

    /// Addresses of UP members of the exposed group whose host node is
    /// in the pool.
    async fn desired_endpoints(
        &self,
        ctx: &LbContext,
        service: &ManagedService,
    ) -> ExecutorResult<BTreeSet<String>> {
        let pool_ids: HashSet<String> = ctx
            .api
            .groups()
            .members(&ctx.pool_group, None)
            .await?
            .into_iter()
            .map(|member| member.cloud_id)
            .collect();

        let members = ctx
            .api
            .groups()
            .members(&service.expose.component, None)
            .await?;

        let mut endpoints = BTreeSet::new();
        for member in members.iter().filter(|m| m.is_up()) {
            let node = match ctx.api.shortcuts().node_for(member).await {
                Ok(node) => node,
                Err(e) => {
                    debug!(member = %member.cloud_id, error = %e, "endpoint host unresolvable, skipped");
                    continue;
                }
            };
            if !pool_ids.contains(&node.cloud_id) {
                continue;
            }
            match ctx.api.shortcuts().address_for(&node) {
                Ok(address) => {
                    endpoints.insert(address);
                }
                Err(e) => {
                    debug!(node = %node.cloud_id, error = %e, "endpoint address unresolvable, skipped")
                }
            }
        }

        Ok(endpoints)
    }
}

/// `(to_remove, to_add)` between the desired endpoint set and the
/// observed slot membership.
pub fn backend_diff(
    desired: &BTreeSet<String>,
    observed: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_remove = observed.difference(desired).cloned().collect();
    let to_add = desired.difference(observed).cloned().collect();
    (to_remove, to_add)
}

fn runtime_error(e: HaproxyError) -> ExecutorError {
    ExecutorError::Handler(e.to_string())
}
