//! Service catalog synchronisation.
//!
//! The Consul catalog is converged onto the services declared by
//! groups whose members run in the pool. Only entries tagged with
//! [`MANAGED_TAG`](crate::MANAGED_TAG) are ever added or removed;
//! foreign registrations are invisible to the diff.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use storm_core::Group;
use storm_executor::ExecutorResult;

use crate::catalog::{CatalogClient, MANAGED_TAG};
use crate::ConsulContext;

/// One desired or observed catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceInstance {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// Keeps the catalog equal to the declared group services.
pub struct ServicesManager {
    catalog: CatalogClient,
}

impl Default for ServicesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicesManager {
    pub fn new() -> Self {
        Self {
            catalog: CatalogClient::new(),
        }
    }

    pub async fn update(&self, ctx: &ConsulContext) -> ExecutorResult<()> {
        let Some((_, server_node)) = ctx.server_deployment().await? else {
            debug!("no consul server yet, skipping catalog sync");
            return Ok(());
        };
        let server_ip = ctx.api.shortcuts().address_for(&server_node)?;

        let desired = self.desired_services(ctx).await?;
        let observed = self.observed_services(&server_ip).await?;
        let (to_register, to_deregister) = services_diff(&desired, &observed);

        if !to_register.is_empty() || !to_deregister.is_empty() {
            info!(
                register = to_register.len(),
                deregister = to_deregister.len(),
                "catalog drift detected"
            );
        }

        for instance in to_register {
            if let Err(e) = self
                .catalog
                .register(&instance.address, &instance.name, instance.port)
                .await
            {
                warn!(service = %instance.name, agent = %instance.address, error = %e,
                      "service registration failed");
            }
        }

        for instance in to_deregister {
            if let Err(e) = self.catalog.deregister(&instance.address, &instance.name).await {
                warn!(service = %instance.name, agent = %instance.address, error = %e,
                      "service deregistration failed");
            }
        }

        Ok(())
    }

    /// Every group contributes a port-0 presence entry per UP member
    /// hosted in the pool, plus one entry per declared service.
    async fn desired_services(&self, ctx: &ConsulContext) -> ExecutorResult<BTreeSet<ServiceInstance>> {
        let pool_ids: HashSet<String> = ctx
            .api
            .groups()
            .members(&ctx.pool_group, None)
            .await?
            .into_iter()
            .map(|member| member.cloud_id)
            .collect();

        let groups = ctx.api.groups().all().await?;
        let mut desired = BTreeSet::new();

        for group in &groups {
            let members = match ctx.api.groups().members(&group.name, None).await {
                Ok(members) => members,
                Err(e) => {
                    warn!(group = %group.name, error = %e, "skipping group in catalog sync");
                    continue;
                }
            };

            for member in members.iter().filter(|m| m.is_up()) {
                let node = match ctx.api.shortcuts().node_for(member).await {
                    Ok(node) => node,
                    Err(e) => {
                        debug!(member = %member.cloud_id, error = %e, "member host unresolvable, skipped");
                        continue;
                    }
                };
                if !pool_ids.contains(&node.cloud_id) {
                    continue;
                }
                let address = match ctx.api.shortcuts().address_for(&node) {
                    Ok(address) => address,
                    Err(e) => {
                        debug!(node = %node.cloud_id, error = %e, "node address unresolvable, skipped");
                        continue;
                    }
                };

                desired.extend(service_entries(group, &address));
            }
        }

        Ok(desired)
    }

    /// Managed entries currently in the catalog.
    async fn observed_services(&self, server_ip: &str) -> ExecutorResult<BTreeSet<ServiceInstance>> {
        let mut observed = BTreeSet::new();

        for (name, tags) in self.catalog.services(server_ip).await? {
            if !tags.iter().any(|tag| tag == MANAGED_TAG) {
                continue;
            }
            for entry in self.catalog.service(server_ip, &name).await? {
                if entry.tags.iter().any(|tag| tag == MANAGED_TAG) {
                    observed.insert(ServiceInstance {
                        name: name.clone(),
                        address: entry.address,
                        port: entry.port,
                    });
                }
            }
        }

        Ok(observed)
    }
}

/// Catalog entries one group member contributes at `address`.
fn service_entries(group: &Group, address: &str) -> Vec<ServiceInstance> {
    let mut entries = vec![ServiceInstance {
        name: group.name.clone(),
        address: address.to_string(),
        port: 0,
    }];
    for service in &group.services {
        entries.push(ServiceInstance {
            name: format!("{}-{}", group.name, service.name),
            address: address.to_string(),
            port: service.port,
        });
    }
    entries
}

/// `(to_register, to_deregister)` between desired and observed sets.
pub fn services_diff(
    desired: &BTreeSet<ServiceInstance>,
    observed: &BTreeSet<ServiceInstance>,
) -> (Vec<ServiceInstance>, Vec<ServiceInstance>) {
    let to_register = desired.difference(observed).cloned().collect();
    let to_deregister = observed.difference(desired).cloned().collect();
    (to_register, to_deregister)
}
