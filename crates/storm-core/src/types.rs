//! Resource types stored by the API server.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::query::Query;

/// Stable identifier of a cloud resource (node or container).
pub type CloudId = String;

// ── Nodes and members ──────────────────────────────────────────────

/// Status of a managed machine or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceStatus {
    Up,
    Down,
    #[serde(other)]
    Unknown,
}

/// The hosting-runtime sub-record of a node or container.
///
/// `options` is free-form text; for Docker engines it embeds a JSON
/// blob that includes the list of already-published ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub engine_type: Option<String>,
    #[serde(default)]
    pub options: String,
}

/// A managed machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub cloud_id: CloudId,
    pub name: String,
    pub status: ResourceStatus,
    pub engine: EngineInfo,
    /// Routable IP addresses of this node.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Node {
    pub fn is_up(&self) -> bool {
        self.status == ResourceStatus::Up
    }
}

/// An element of a group-members listing. Members may be nodes or
/// containers; containers carry the engine record of their host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub cloud_id: CloudId,
    #[serde(default)]
    pub name: String,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineInfo>,
}

impl Member {
    pub fn is_up(&self) -> bool {
        self.status == ResourceStatus::Up
    }
}

// ── Groups and services ────────────────────────────────────────────

/// Transport protocol of a declared service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A service declared on a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
}

/// A named, query-defined bag of nodes or containers.
///
/// Membership is dynamic: the server evaluates `query` plus the
/// `include`/`exclude` overrides on every members listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<CloudId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<CloudId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
}

impl Group {
    /// A group with the given name, no query, and no services.
    /// Membership of such a group is manipulated explicitly.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: None,
            include: Vec::new(),
            exclude: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Look up a declared service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Service names must be unique within a group.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(format!(
                    "group {}: duplicate service name {}",
                    self.name, service.name
                ));
            }
        }
        Ok(())
    }
}

// ── Applications ───────────────────────────────────────────────────

/// Reference to a service declared on a component group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceRef {
    pub component: String,
    pub service: String,
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.component, self.service)
    }
}

/// A directed link from a component to a service of another component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLink {
    pub from_component: String,
    pub to_service: ServiceRef,
}

/// A named logical system composed of groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ComponentLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<ServiceRef>,
}

// ── Recipes ────────────────────────────────────────────────────────

/// A typed template describing how to instantiate or mutate cloud
/// resources. `content` is opaque at the executor level; only the
/// matching trigger handler parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(rename = "type")]
    pub recipe_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(rename = "targetNode", default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<CloudId>,
    #[serde(rename = "targetAnyOf", default, skip_serializing_if = "Option::is_none")]
    pub target_any_of: Option<String>,
    #[serde(rename = "targetAllIn", default, skip_serializing_if = "Option::is_none")]
    pub target_all_in: Option<String>,
    #[serde(rename = "addTo", default, skip_serializing_if = "Option::is_none")]
    pub add_to: Option<String>,
}

/// Arguments of a `recipe` trigger: the recipe to run plus per-invocation
/// parameter and targeting overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeInvocation {
    pub recipe: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(rename = "targetNode", default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<CloudId>,
    #[serde(rename = "addTo", default, skip_serializing_if = "Option::is_none")]
    pub add_to: Option<String>,
}

impl RecipeInvocation {
    pub fn new(recipe: impl Into<String>) -> Self {
        Self {
            recipe: recipe.into(),
            ..Self::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn target_node(mut self, node: impl Into<CloudId>) -> Self {
        self.target_node = Some(node.into());
        self
    }

    pub fn add_to(mut self, group: impl Into<String>) -> Self {
        self.add_to = Some(group.into());
        self
    }

    /// Render as a trigger arguments map.
    pub fn to_arguments(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Parse back from a trigger arguments map.
    pub fn from_arguments(arguments: &BTreeMap<String, Value>) -> Result<Self, serde_json::Error> {
        let map: serde_json::Map<String, Value> =
            arguments.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(Value::Object(map))
    }
}

// ── Triggers ───────────────────────────────────────────────────────

/// Lifecycle status of a trigger. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl TriggerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TriggerStatus::Done | TriggerStatus::Error)
    }
}

/// An asynchronously executed command. Created by a reconciler,
/// claimed by a handler host, and consumed by the creator once it
/// reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    pub status: TriggerStatus,
    #[serde(default)]
    pub result: BTreeMap<String, Value>,
}

impl Trigger {
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_error(&self) -> bool {
        self.status == TriggerStatus::Error
    }

    /// The failure reason carried by an `error` result.
    pub fn error_reason(&self) -> Option<&str> {
        self.result.get("reason").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_group() -> Group {
        Group {
            name: "web".to_string(),
            query: None,
            include: Vec::new(),
            exclude: Vec::new(),
            services: vec![ServiceSpec {
                name: "http".to_string(),
                protocol: Protocol::Tcp,
                port: 80,
            }],
        }
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ResourceStatus::Up).unwrap(),
            "\"UP\""
        );
        let parsed: ResourceStatus = serde_json::from_str("\"DOWN\"").unwrap();
        assert_eq!(parsed, ResourceStatus::Down);
    }

    #[test]
    fn unknown_status_tolerated() {
        let parsed: ResourceStatus = serde_json::from_str("\"REBOOTING\"").unwrap();
        assert_eq!(parsed, ResourceStatus::Unknown);
    }

    #[test]
    fn group_service_lookup() {
        let group = web_group();
        assert_eq!(group.service("http").unwrap().port, 80);
        assert!(group.service("https").is_none());
    }

    #[test]
    fn group_rejects_duplicate_service_names() {
        let mut group = web_group();
        group.services.push(ServiceSpec {
            name: "http".to_string(),
            protocol: Protocol::Udp,
            port: 8080,
        });
        assert!(group.validate().is_err());
    }

    #[test]
    fn service_ref_display() {
        let r = ServiceRef {
            component: "frontend".to_string(),
            service: "http".to_string(),
        };
        assert_eq!(r.to_string(), "frontend[http]");
    }

    #[test]
    fn recipe_uses_camel_case_targeting_keys() {
        let recipe = Recipe {
            name: "consul-server".to_string(),
            recipe_type: "docker".to_string(),
            content: String::new(),
            options: BTreeMap::new(),
            params: BTreeMap::new(),
            target_node: Some("n1".to_string()),
            target_any_of: None,
            target_all_in: None,
            add_to: Some("p1-consul-server".to_string()),
        };
        let value = serde_json::to_value(&recipe).unwrap();
        assert_eq!(value["targetNode"], "n1");
        assert_eq!(value["addTo"], "p1-consul-server");
        assert_eq!(value["type"], "docker");
    }

    #[test]
    fn invocation_arguments_round_trip() {
        let invocation = RecipeInvocation::new("consul-server")
            .param("DATACENTER", "p1")
            .param("SERVER_ADDRESS", "10.0.0.1")
            .target_node("n1")
            .add_to("p1-consul-server");

        let arguments = invocation.to_arguments();
        assert_eq!(arguments["recipe"], "consul-server");
        assert_eq!(arguments["params"]["DATACENTER"], "p1");

        let parsed = RecipeInvocation::from_arguments(&arguments).unwrap();
        assert_eq!(parsed, invocation);
    }

    #[test]
    fn trigger_terminal_states() {
        assert!(!TriggerStatus::Pending.is_terminal());
        assert!(!TriggerStatus::Running.is_terminal());
        assert!(TriggerStatus::Done.is_terminal());
        assert!(TriggerStatus::Error.is_terminal());
    }

    #[test]
    fn trigger_error_reason() {
        let mut trigger = Trigger {
            uuid: Uuid::new_v4(),
            name: "recipe".to_string(),
            arguments: BTreeMap::new(),
            status: TriggerStatus::Error,
            result: BTreeMap::new(),
        };
        assert_eq!(trigger.error_reason(), None);

        trigger.result.insert(
            "reason".to_string(),
            Value::String("no node available".to_string()),
        );
        assert_eq!(trigger.error_reason(), Some("no node available"));
    }
}
