//! Resolution shortcuts: member → hosting node → routable address.
//!
//! Containers are linked to their host through the engine record; a
//! container's `engine._id` names the engine of the node it runs on.
//! Every resolution must be unambiguous.

use storm_core::{Member, Node, Query};

use crate::client::ApiClient;
use crate::error::{ApiError, ApiResult};

pub struct Shortcuts<'a> {
    client: &'a ApiClient,
}

impl<'a> Shortcuts<'a> {
    pub(crate) fn new(client: &'a ApiClient) -> Self {
        Self { client }
    }

    /// Resolve a member (node or container) to its hosting node.
    pub async fn node_for(&self, member: &Member) -> ApiResult<Node> {
        let engine = member.engine.as_ref().ok_or_else(|| {
            ApiError::Resolution(format!("member {} has no engine record", member.cloud_id))
        })?;

        let nodes = self
            .client
            .nodes()
            .query(&Query::eq("engine._id", engine.id.clone()))
            .await?;

        let mut nodes = nodes.into_iter();
        match (nodes.next(), nodes.next()) {
            (Some(node), None) => Ok(node),
            (None, _) => Err(ApiError::Resolution(format!(
                "no host node for member {} (engine {})",
                member.cloud_id, engine.id
            ))),
            (Some(_), Some(_)) => Err(ApiError::Resolution(format!(
                "multiple host nodes for member {} (engine {})",
                member.cloud_id, engine.id
            ))),
        }
    }

    /// The node's single routable IP address.
    pub fn address_for(&self, node: &Node) -> ApiResult<String> {
        match node.addresses.as_slice() {
            [address] => Ok(address.clone()),
            [] => Err(ApiError::Resolution(format!(
                "node {} has no address",
                node.cloud_id
            ))),
            addresses => Err(ApiError::Resolution(format!(
                "node {} has {} addresses, expected 1",
                node.cloud_id,
                addresses.len()
            ))),
        }
    }

    /// Resolve a member all the way to its host's address.
    pub async fn address_for_member(&self, member: &Member) -> ApiResult<String> {
        let node = self.node_for(member).await?;
        self.address_for(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{serve, Route};
    use storm_core::{EngineInfo, ResourceStatus};

    fn node(cloud_id: &str, addresses: &[&str]) -> Node {
        Node {
            cloud_id: cloud_id.to_string(),
            name: cloud_id.to_string(),
            status: ResourceStatus::Up,
            engine: EngineInfo {
                id: format!("{cloud_id}-engine"),
                engine_type: Some("docker".to_string()),
                options: String::new(),
            },
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn container(cloud_id: &str, engine_id: &str) -> Member {
        Member {
            cloud_id: cloud_id.to_string(),
            name: cloud_id.to_string(),
            status: ResourceStatus::Up,
            engine: Some(EngineInfo {
                id: engine_id.to_string(),
                engine_type: None,
                options: String::new(),
            }),
        }
    }

    #[test]
    fn address_resolution() {
        let client = ApiClient::new(DEFAULT).unwrap();
        let shortcuts = client.shortcuts();

        assert_eq!(
            shortcuts.address_for(&node("n1", &["10.0.0.5"])).unwrap(),
            "10.0.0.5"
        );
        assert!(matches!(
            shortcuts.address_for(&node("n1", &[])),
            Err(ApiError::Resolution(_))
        ));
        assert!(matches!(
            shortcuts.address_for(&node("n1", &["10.0.0.5", "10.0.0.6"])),
            Err(ApiError::Resolution(_))
        ));
    }

    #[tokio::test]
    async fn member_without_engine_fails() {
        let client = ApiClient::new(DEFAULT).unwrap();
        let mut member = container("c1", "e1");
        member.engine = None;

        let err = client.shortcuts().node_for(&member).await.unwrap_err();
        assert!(matches!(err, ApiError::Resolution(_)));
    }

    #[tokio::test]
    async fn node_for_resolves_single_host() {
        let addr = serve(vec![Route::json(
            "GET",
            "/v1/nodes/",
            r#"[{"cloud_id":"n1","name":"n1","status":"UP",
                 "engine":{"_id":"e1","options":""},
                 "addresses":["10.0.0.5"]}]"#,
        )])
        .await;

        let client = ApiClient::new(&format!("http://{addr}/")).unwrap();
        let node = client
            .shortcuts()
            .node_for(&container("c1", "e1"))
            .await
            .unwrap();
        assert_eq!(node.cloud_id, "n1");
    }

    #[tokio::test]
    async fn node_for_rejects_ambiguity() {
        let addr = serve(vec![Route::json(
            "GET",
            "/v1/nodes/",
            r#"[{"cloud_id":"n1","name":"n1","status":"UP",
                 "engine":{"_id":"e1","options":""},"addresses":[]},
                {"cloud_id":"n2","name":"n2","status":"UP",
                 "engine":{"_id":"e1","options":""},"addresses":[]}]"#,
        )])
        .await;

        let client = ApiClient::new(&format!("http://{addr}/")).unwrap();
        let err = client
            .shortcuts()
            .node_for(&container("c1", "e1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Resolution(_)));
    }

    const DEFAULT: &str = "http://127.0.0.1:8000/";
}
