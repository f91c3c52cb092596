//! The `recipe` trigger worker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use storm_api::ApiClient;
use storm_core::{Member, Node, Query, Recipe, RecipeInvocation, Trigger};
use storm_executor::{ExecutorError, ExecutorResult, TriggerWorker};

use crate::cli::DockerCli;
use crate::recipe::{expand_args, find_node_with_free_ports, host_ports, RecipeAction, RecipeContent};
use crate::DockerError;

/// Executes `recipe` triggers against docker engines.
#[derive(Debug, Default)]
pub struct DockerWorker {
    cli: DockerCli,
}

impl DockerWorker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn member_by_id(&self, api: &ApiClient, id: &str) -> ExecutorResult<Member> {
        let matches = api.query_resources(&Query::eq("cloud_id", id)).await?;
        let mut matches = matches.into_iter();
        match (matches.next(), matches.next()) {
            (Some(member), None) => Ok(member),
            (None, _) => Err(ExecutorError::Handler(format!("target {id} not found"))),
            _ => Err(ExecutorError::Handler(format!("target {id} is ambiguous"))),
        }
    }

    /// Host address of the engine backing a target id (node or
    /// container).
    async fn host_for(&self, api: &ApiClient, id: &str) -> ExecutorResult<String> {
        let member = self.member_by_id(api, id).await?;
        let node = api.shortcuts().node_for(&member).await?;
        Ok(api.shortcuts().address_for(&node)?)
    }

    /// Choose the node a run command lands on: the concrete target if
    /// given, otherwise any `targetAnyOf` member with the required
    /// host ports free.
    async fn pick_run_node(
        &self,
        api: &ApiClient,
        recipe: &Recipe,
        target_node: Option<&str>,
        required_ports: &[u16],
    ) -> ExecutorResult<Node> {
        if let Some(id) = target_node {
            let member = self.member_by_id(api, id).await?;
            return Ok(api.shortcuts().node_for(&member).await?);
        }

        let group = recipe.target_any_of.as_deref().ok_or_else(|| {
            ExecutorError::Recipe(format!(
                "recipe {} needs targetNode or targetAnyOf for run",
                recipe.name
            ))
        })?;

        let members = api.groups().members(group, None).await?;
        let ids: Vec<String> = members.into_iter().map(|m| m.cloud_id).collect();
        let nodes = if ids.is_empty() {
            Vec::new()
        } else {
            api.nodes().query(&Query::is_in("cloud_id", ids)).await?
        };

        find_node_with_free_ports(&nodes, required_ports)
            .cloned()
            .ok_or_else(|| {
                ExecutorError::Handler(format!(
                    "no UP node in {group} with free ports {required_ports:?}"
                ))
            })
    }

    async fn run_commands(
        &self,
        api: &ApiClient,
        recipe: &Recipe,
        commands: Vec<Vec<String>>,
        params: &BTreeMap<String, String>,
        target_node: Option<&str>,
        add_to: Option<&str>,
    ) -> ExecutorResult<BTreeMap<String, Value>> {
        let mut created = Vec::new();

        for command in commands {
            let args = expand_args(&command, params);
            let required = host_ports(&args);
            let node = self.pick_run_node(api, recipe, target_node, &required).await?;
            let host = api.shortcuts().address_for(&node)?;

            debug!(node = %node.cloud_id, %host, ports = ?required, "running container");
            let container_id = self
                .cli
                .run_detached(&host, &args)
                .await
                .map_err(handler_error)?;
            info!(container = %container_id, node = %node.cloud_id, "container started");
            created.push(container_id);
        }

        if let Some(group) = add_to {
            api.groups().add_members(group, &created).await?;
        }

        Ok(BTreeMap::from([("created".to_string(), json!(created))]))
    }

    async fn exec_commands(
        &self,
        api: &ApiClient,
        commands: Vec<Vec<String>>,
        params: &BTreeMap<String, String>,
        target: &str,
    ) -> ExecutorResult<BTreeMap<String, Value>> {
        let host = self.host_for(api, target).await?;

        let mut output = Vec::new();
        for command in commands {
            let args = expand_args(&command, params);
            output.push(
                self.cli
                    .exec(&host, target, &args)
                    .await
                    .map_err(handler_error)?,
            );
        }

        Ok(BTreeMap::from([("output".to_string(), json!(output))]))
    }

    async fn rm_commands(
        &self,
        api: &ApiClient,
        commands: Vec<Vec<String>>,
        params: &BTreeMap<String, String>,
        target: &str,
    ) -> ExecutorResult<BTreeMap<String, Value>> {
        let host = self.host_for(api, target).await?;

        let mut removed = Vec::new();
        for command in commands {
            let ids = expand_args(&command, params);
            self.cli.remove(&host, &ids).await.map_err(handler_error)?;
            removed.extend(ids);
        }

        Ok(BTreeMap::from([("removed".to_string(), json!(removed))]))
    }
}

#[async_trait]
impl TriggerWorker for DockerWorker {
    fn name(&self) -> &str {
        "recipe"
    }

    async fn execute(
        &self,
        api: &ApiClient,
        trigger: &Trigger,
    ) -> ExecutorResult<BTreeMap<String, Value>> {
        let invocation = RecipeInvocation::from_arguments(&trigger.arguments)
            .map_err(|e| ExecutorError::Recipe(format!("bad trigger arguments: {e}")))?;

        let recipe = api.recipes().get(&invocation.recipe).await?;

        // Invocation params override the recipe's defaults.
        let mut params = recipe.params.clone();
        params.extend(invocation.params.clone());

        let action = RecipeContent::parse(&recipe.content)
            .and_then(RecipeContent::action)
            .map_err(|e| ExecutorError::Recipe(format!("recipe {}: {e}", recipe.name)))?;

        let target_node = invocation.target_node.or_else(|| recipe.target_node.clone());
        let add_to = invocation.add_to.clone().or_else(|| recipe.add_to.clone());

        match action {
            RecipeAction::Run(commands) => {
                self.run_commands(
                    api,
                    &recipe,
                    commands,
                    &params,
                    target_node.as_deref(),
                    add_to.as_deref(),
                )
                .await
            }
            RecipeAction::Exec(commands) => {
                let target = target_node.ok_or_else(|| {
                    ExecutorError::Recipe(format!(
                        "recipe {} needs a concrete targetNode for exec",
                        recipe.name
                    ))
                })?;
                self.exec_commands(api, commands, &params, &target).await
            }
            RecipeAction::Rm(commands) => {
                let target = target_node.ok_or_else(|| {
                    ExecutorError::Recipe(format!(
                        "recipe {} needs a concrete targetNode for rm",
                        recipe.name
                    ))
                })?;
                self.rm_commands(api, commands, &params, &target).await
            }
        }
    }
}

/// Runtime docker failures are retryable, not misconfiguration.
fn handler_error(e: DockerError) -> ExecutorError {
    ExecutorError::Handler(e.to_string())
}
