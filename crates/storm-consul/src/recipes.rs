//! Canonical recipes upserted by the Consul executor.
//!
//! Content is YAML interpreted by the docker trigger handler; the
//! `$VAR` placeholders are filled from the trigger's params at
//! invocation time.

use storm_core::Recipe;

pub const SERVER_RECIPE: &str = "consul-server";
pub const CLIENT_RECIPE: &str = "consul-client";
pub const JOIN_WAN_RECIPE: &str = "consul-server-join-wan";

const SERVER_CONTENT: &str = "\
run:
  - [--name, consul-server-$DATACENTER,
     -p, '8300:8300',
     -p, '8301:8301', -p, '8301:8301/udp',
     -p, '8302:8302', -p, '8302:8302/udp',
     -p, '8500:8500',
     -p, '8600:8600', -p, '8600:8600/udp',
     consul, agent, -server, -bootstrap-expect=1, -ui,
     -datacenter, $DATACENTER,
     -advertise, $SERVER_ADDRESS,
     -client, $CLIENT_ADDRESS]
";

const CLIENT_CONTENT: &str = "\
run:
  - [--name, consul-client-$DATACENTER,
     -p, '8301:8301', -p, '8301:8301/udp',
     -p, '8500:8500',
     -p, '8600:8600', -p, '8600:8600/udp',
     consul, agent,
     -datacenter, $DATACENTER,
     -retry-join, $SERVER_ADDRESS,
     -advertise, $CLIENT_ADDRESS,
     -client, $CLIENT_ADDRESS]
";

const JOIN_WAN_CONTENT: &str = "\
exec:
  - [consul, join, -wan, $WAN_ADDRESS]
";

fn docker_recipe(name: &str, content: &str) -> Recipe {
    Recipe {
        name: name.to_string(),
        recipe_type: "docker".to_string(),
        content: content.to_string(),
        options: Default::default(),
        params: Default::default(),
        target_node: None,
        target_any_of: None,
        target_all_in: None,
        add_to: None,
    }
}

/// Starts the single Consul server for a datacenter.
pub fn server_recipe() -> Recipe {
    docker_recipe(SERVER_RECIPE, SERVER_CONTENT)
}

/// Starts a Consul client joined to the datacenter's server.
pub fn client_recipe() -> Recipe {
    docker_recipe(CLIENT_RECIPE, CLIENT_CONTENT)
}

/// Joins the local server to a remote pool's server over WAN.
pub fn join_wan_recipe() -> Recipe {
    docker_recipe(JOIN_WAN_RECIPE, JOIN_WAN_CONTENT)
}
