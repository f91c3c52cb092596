//! Docker recipe handler.
//!
//! Decodes recipe content, expands `$VAR` placeholders, infers host
//! port requirements, picks a node with those ports free, and drives
//! the docker CLI against the node's engine.

mod cli;
mod recipe;
mod worker;

use thiserror::Error;

pub use cli::{DockerCli, DOCKER_TCP_PORT};
pub use recipe::{
    expand_args, expand_vars, find_node_with_free_ports, host_ports, published_ports,
    RecipeAction, RecipeContent,
};
pub use worker::DockerWorker;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("invalid recipe content: {0}")]
    Content(#[from] serde_yaml::Error),

    #[error("recipe declares no action, one of run, exec, rm is required")]
    MissingAction,

    #[error("recipe actions are exclusive, found more than one of run, exec, rm")]
    ExclusiveActions,

    #[error("docker command {command:?} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("docker i/o error: {0}")]
    Io(#[from] std::io::Error),
}
