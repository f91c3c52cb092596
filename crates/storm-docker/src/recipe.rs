//! Recipe content decoding, variable expansion, and port-aware node
//! selection.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use storm_core::Node;

use crate::DockerError;

/// Decoded recipe content. Exactly one action may be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeContent {
    #[serde(default)]
    pub run: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub exec: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub rm: Option<Vec<Vec<String>>>,
}

/// The single action a recipe performs.
#[derive(Debug, Clone, PartialEq)]
pub enum RecipeAction {
    /// `docker run -d <args>` per command.
    Run(Vec<Vec<String>>),
    /// `docker exec <target> <args>` per command.
    Exec(Vec<Vec<String>>),
    /// `docker rm -f <args>` per command.
    Rm(Vec<Vec<String>>),
}

impl RecipeContent {
    pub fn parse(text: &str) -> Result<Self, DockerError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn action(self) -> Result<RecipeAction, DockerError> {
        match (self.run, self.exec, self.rm) {
            (Some(run), None, None) => Ok(RecipeAction::Run(run)),
            (None, Some(exec), None) => Ok(RecipeAction::Exec(exec)),
            (None, None, Some(rm)) => Ok(RecipeAction::Rm(rm)),
            (None, None, None) => Err(DockerError::MissingAction),
            _ => Err(DockerError::ExclusiveActions),
        }
    }
}

/// Expand `$VAR` placeholders from `params`. Unknown variables are
/// left verbatim.
pub fn expand_vars(text: &str, params: &BTreeMap<String, String>) -> String {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let var = VAR.get_or_init(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

    var.replace_all(text, |captures: &regex::Captures<'_>| {
        let name = &captures[1];
        params
            .get(name)
            .cloned()
            .unwrap_or_else(|| captures[0].to_string())
    })
    .into_owned()
}

/// Expand every argument of a command.
pub fn expand_args(args: &[String], params: &BTreeMap<String, String>) -> Vec<String> {
    args.iter().map(|arg| expand_vars(arg, params)).collect()
}

/// Host ports required by the `-p`/`--publish` specs of a run command.
pub fn host_ports(args: &[String]) -> Vec<u16> {
    let mut ports = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let spec = if arg == "-p" || arg == "--publish" {
            iter.next().map(String::as_str)
        } else {
            arg.strip_prefix("-p=").or_else(|| arg.strip_prefix("--publish="))
        };

        if let Some(port) = spec.and_then(parse_host_port) {
            ports.push(port);
        }
    }

    ports
}

/// The host side of a publish spec: `host:container`, optionally with
/// a leading bind address or a trailing protocol.
fn parse_host_port(spec: &str) -> Option<u16> {
    let spec = spec.split('/').next()?;
    let parts: Vec<&str> = spec.split(':').collect();
    let host = match parts.as_slice() {
        [host, _container] => host,
        [_addr, host, _container] => host,
        _ => return None,
    };
    host.parse().ok()
}

/// Host ports a node already publishes, detected from the JSON blob in
/// its engine options.
pub fn published_ports(options: &str) -> Vec<u16> {
    static PORT: OnceLock<Regex> = OnceLock::new();
    let port =
        PORT.get_or_init(|| Regex::new(r#""(\d{1,5}):\d{1,5}(?:/(?:tcp|udp))?""#).unwrap());

    port.captures_iter(options)
        .filter_map(|captures| captures[1].parse().ok())
        .collect()
}

/// First UP node that publishes none of the required host ports.
pub fn find_node_with_free_ports<'a>(nodes: &'a [Node], required: &[u16]) -> Option<&'a Node> {
    nodes.iter().find(|node| {
        if !node.is_up() {
            return false;
        }
        let taken = published_ports(&node.engine.options);
        required.iter().all(|port| !taken.contains(port))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use storm_core::{EngineInfo, ResourceStatus};

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn node(id: &str, status: ResourceStatus, options: &str) -> Node {
        Node {
            cloud_id: id.to_string(),
            name: id.to_string(),
            status,
            engine: EngineInfo {
                id: format!("e-{id}"),
                engine_type: Some("docker".to_string()),
                options: options.to_string(),
            },
            addresses: vec!["10.0.0.1".to_string()],
        }
    }

    #[test]
    fn parses_run_action() {
        let content = RecipeContent::parse("run:\n  - [nginx]\n").unwrap();
        assert_eq!(
            content.action().unwrap(),
            RecipeAction::Run(vec![vec!["nginx".to_string()]])
        );
    }

    #[test]
    fn run_and_exec_together_is_a_hard_error() {
        let content =
            RecipeContent::parse("run:\n  - [nginx]\nexec:\n  - [ls]\n").unwrap();
        assert!(matches!(
            content.action(),
            Err(DockerError::ExclusiveActions)
        ));
    }

    #[test]
    fn empty_content_has_no_action() {
        let content = RecipeContent::parse("{}").unwrap();
        assert!(matches!(content.action(), Err(DockerError::MissingAction)));
    }

    #[test]
    fn garbage_yaml_is_rejected() {
        assert!(matches!(
            RecipeContent::parse(": not yaml ["),
            Err(DockerError::Content(_))
        ));
    }

    #[test]
    fn expands_known_vars_and_keeps_unknown() {
        let expanded = expand_vars(
            "consul-server-$DATACENTER on $UNSET",
            &params(&[("DATACENTER", "p1")]),
        );
        assert_eq!(expanded, "consul-server-p1 on $UNSET");
    }

    #[test]
    fn expansion_covers_whole_commands() {
        let expanded = expand_args(
            &args(&["-retry-join", "$SERVER_ADDRESS", "-client", "$CLIENT_ADDRESS"]),
            &params(&[("SERVER_ADDRESS", "10.0.0.1"), ("CLIENT_ADDRESS", "10.0.0.2")]),
        );
        assert_eq!(expanded, args(&["-retry-join", "10.0.0.1", "-client", "10.0.0.2"]));
    }

    #[test]
    fn host_ports_from_publish_specs() {
        let found = host_ports(&args(&[
            "-p", "80:8080", "--publish", "443:8443", "-p=53:53/udp", "-p",
            "0.0.0.0:8500:8500", "nginx",
        ]));
        assert_eq!(found, vec![80, 443, 53, 8500]);
    }

    #[test]
    fn dynamic_host_ports_are_ignored() {
        assert!(host_ports(&args(&["-p", ":8080"])).is_empty());
        assert!(host_ports(&args(&["-p", "8080"])).is_empty());
    }

    #[test]
    fn published_ports_from_engine_options() {
        let options = r#"{"labels": [], "ports": ["80:80", "443:8443/tcp"]}"#;
        assert_eq!(published_ports(options), vec![80, 443]);
        assert!(published_ports("").is_empty());
    }

    #[test]
    fn port_conflict_excludes_node() {
        let nodes = vec![
            node("n1", ResourceStatus::Up, r#"{"ports": ["80:80"]}"#),
            node("n2", ResourceStatus::Up, r#"{"ports": ["443:443"]}"#),
        ];

        // Recipe wants host port 80: n1 already publishes it.
        let chosen = find_node_with_free_ports(&nodes, &[80]).unwrap();
        assert_eq!(chosen.cloud_id, "n2");
    }

    #[test]
    fn down_nodes_are_never_eligible() {
        let nodes = vec![node("n1", ResourceStatus::Down, "{}")];
        assert!(find_node_with_free_ports(&nodes, &[]).is_none());
    }

    #[test]
    fn all_ports_taken_finds_nothing() {
        let nodes = vec![node("n1", ResourceStatus::Up, r#"{"ports": ["80:80"]}"#)];
        assert!(find_node_with_free_ports(&nodes, &[80]).is_none());
    }
}
