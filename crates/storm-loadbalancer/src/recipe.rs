//! The load-balancer recipe.

use storm_core::Recipe;
use storm_haproxy::RUNTIME_PORT;

pub const LB_RECIPE: &str = "load-balancer";

/// Slots pre-declared in the `nodes` backend. Membership beyond this
/// is dropped until existing members leave.
pub const SLOT_COUNT: usize = 1024;

/// HAProxy config written by the container's entry command. Rendered
/// as one printf format string, so newlines stay `\n` escapes.
fn haproxy_config() -> String {
    [
        "global".to_string(),
        format!("    stats socket ipv4@0.0.0.0:{RUNTIME_PORT} level admin"),
        String::new(),
        "defaults".to_string(),
        "    mode tcp".to_string(),
        "    timeout connect 5s".to_string(),
        "    timeout client 50s".to_string(),
        "    timeout server 50s".to_string(),
        String::new(),
        "frontend service".to_string(),
        "    bind *:$PORT".to_string(),
        "    default_backend nodes".to_string(),
        String::new(),
        "backend nodes".to_string(),
        format!("    server-template member {SLOT_COUNT} 127.0.0.1:$PORT disabled"),
    ]
    .join("\\n")
}

/// HAProxy in host-network mode: one frontend on the exposed service
/// port, one backend of disabled template slots, runtime socket at
/// admin level for slot rebinding.
pub fn lb_recipe() -> Recipe {
    let config = haproxy_config();
    let command = format!(
        "printf '{config}\\n' > /usr/local/etc/haproxy/haproxy.cfg \
         && haproxy -f /usr/local/etc/haproxy/haproxy.cfg -db"
    );

    let content = [
        "run:",
        "  - - --name",
        "    - load-balancer-$PORT",
        "    - --net",
        "    - host",
        "    - haproxy:2.8",
        "    - sh",
        "    - -c",
        &format!("    - {command}"),
    ]
    .join("\n")
        + "\n";

    Recipe {
        name: LB_RECIPE.to_string(),
        recipe_type: "docker".to_string(),
        content,
        options: Default::default(),
        params: Default::default(),
        target_node: None,
        target_any_of: None,
        target_all_in: None,
        add_to: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use storm_docker::{expand_args, host_ports, RecipeAction, RecipeContent};

    fn run_args() -> Vec<String> {
        let content = RecipeContent::parse(&lb_recipe().content).unwrap();
        let RecipeAction::Run(commands) = content.action().unwrap() else {
            panic!("load-balancer recipe must be a run action");
        };
        let params = BTreeMap::from([("PORT".to_string(), "80".to_string())]);
        expand_args(&commands[0], &params)
    }

    #[test]
    fn recipe_runs_haproxy_in_host_network() {
        let args = run_args();
        assert!(args.contains(&"load-balancer-80".to_string()));
        let net = args.iter().position(|a| a == "--net").unwrap();
        assert_eq!(args[net + 1], "host");
        // Host networking: no published ports to conflict on.
        assert!(host_ports(&args).is_empty());
    }

    #[test]
    fn config_declares_slot_template_and_runtime_socket() {
        let script = run_args().join(" ");
        assert!(script.contains(&format!(
            "server-template member {SLOT_COUNT} 127.0.0.1:80 disabled"
        )));
        assert!(script.contains("stats socket ipv4@0.0.0.0:9000 level admin"));
        assert!(script.contains("bind *:80"));
    }
}
