//! Load-balancer instance lifecycle.

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use storm_core::{Node, Query, RecipeInvocation};
use storm_executor::ExecutorResult;
use storm_haproxy::RUNTIME_PORT;

use crate::recipe::LB_RECIPE;
use crate::{LbContext, ManagedService};

/// Ensures exactly one HAProxy container is up for a managed service,
/// and keeps the service's runtime-socket address current.
pub struct SingleServerManager;

impl SingleServerManager {
    pub async fn update(&self, ctx: &LbContext, service: &mut ManagedService) -> ExecutorResult<()> {
        let members = ctx.api.groups().members(&service.lb_group, None).await?;

        if let Some(member) = members.iter().find(|m| m.is_up()) {
            match ctx.api.shortcuts().address_for_member(member).await {
                Ok(host) => {
                    service.runtime_addr = Some(format!("{host}:{RUNTIME_PORT}"));
                    debug!(service = %service.expose, %host, "load-balancer instance up");
                }
                Err(e) => {
                    service.runtime_addr = None;
                    warn!(service = %service.expose, error = %e, "load-balancer host unresolvable");
                }
            }
            return Ok(());
        }

        service.runtime_addr = None;

        let pool: Vec<Node> = {
            let members = ctx.api.groups().members(&ctx.pool_group, None).await?;
            let ids: Vec<String> = members.into_iter().map(|m| m.cloud_id).collect();
            if ids.is_empty() {
                Vec::new()
            } else {
                ctx.api.nodes().query(&Query::is_in("cloud_id", ids)).await?
            }
        };
        let up: Vec<Node> = pool.into_iter().filter(Node::is_up).collect();

        let Some(node) = up.choose(&mut rand::thread_rng()) else {
            warn!(service = %service.expose, "no UP node available for the load balancer");
            return Ok(());
        };

        let invocation = RecipeInvocation::new(LB_RECIPE)
            .param("PORT", service.port.to_string())
            .target_node(node.cloud_id.as_str())
            .add_to(service.lb_group.as_str());

        info!(
            service = %service.expose,
            node = %node.cloud_id,
            port = service.port,
            "starting load balancer"
        );
        match ctx.driver.run_recipe(&invocation).await {
            Ok(_) => info!(service = %service.expose, "load balancer started"),
            Err(e) => warn!(
                service = %service.expose,
                error = %e,
                "load-balancer trigger failed, retrying next tick"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storm_api::testutil::{serve, Route};
    use storm_api::ApiClient;
    use storm_core::ServiceRef;
    use storm_executor::GroupWatch;

    fn managed_service() -> ManagedService {
        ManagedService {
            app: "a1".to_string(),
            expose: ServiceRef {
                component: "frontend".to_string(),
                service: "http".to_string(),
            },
            port: 80,
            lb_group: "a1-frontend-http-lb".to_string(),
            watch: GroupWatch::new("frontend"),
            runtime_addr: None,
        }
    }

    #[tokio::test]
    async fn resolves_runtime_address_of_running_instance() {
        let addr = serve(vec![
            Route::json(
                "GET",
                "/v1/groups/a1-frontend-http-lb/members/",
                r#"[{"cloud_id":"lb1","name":"lb1","status":"UP",
                     "engine":{"_id":"e-n1","options":""}}]"#,
            ),
            Route::json(
                "GET",
                "/v1/nodes/",
                r#"[{"cloud_id":"n1","name":"n1","status":"UP",
                     "engine":{"_id":"e-n1","options":""},"addresses":["10.0.0.3"]}]"#,
            ),
        ])
        .await;

        let api = ApiClient::new(&format!("http://{addr}/")).unwrap();
        let ctx = LbContext::new(api, "p1");
        let mut service = managed_service();

        SingleServerManager.update(&ctx, &mut service).await.unwrap();
        assert_eq!(service.runtime_addr.as_deref(), Some("10.0.0.3:9000"));
    }

    #[tokio::test]
    async fn empty_pool_leaves_service_unstarted() {
        let addr = serve(vec![
            Route::json("GET", "/v1/groups/a1-frontend-http-lb/members/", "[]"),
            Route::json("GET", "/v1/groups/p1/members/", "[]"),
        ])
        .await;

        let api = ApiClient::new(&format!("http://{addr}/")).unwrap();
        let ctx = LbContext::new(api, "p1");
        let mut service = managed_service();

        SingleServerManager.update(&ctx, &mut service).await.unwrap();
        assert!(service.runtime_addr.is_none());
    }
}
