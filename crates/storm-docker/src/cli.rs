//! Thin wrapper over the docker CLI against a remote engine.

use tokio::process::Command;
use tracing::debug;

use crate::DockerError;

/// Port the node engines expose the docker daemon on.
pub const DOCKER_TCP_PORT: u16 = 2375;

#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    /// `docker run -d <args>`; returns the created container id.
    pub async fn run_detached(&self, host: &str, args: &[String]) -> Result<String, DockerError> {
        let mut full = vec!["run".to_string(), "-d".to_string()];
        full.extend_from_slice(args);
        self.invoke(host, &full).await
    }

    /// `docker exec <container> <args>`.
    pub async fn exec(
        &self,
        host: &str,
        container: &str,
        args: &[String],
    ) -> Result<String, DockerError> {
        let mut full = vec!["exec".to_string(), container.to_string()];
        full.extend_from_slice(args);
        self.invoke(host, &full).await
    }

    /// `docker rm -f <ids>`.
    pub async fn remove(&self, host: &str, ids: &[String]) -> Result<String, DockerError> {
        let mut full = vec!["rm".to_string(), "-f".to_string()];
        full.extend_from_slice(ids);
        self.invoke(host, &full).await
    }

    async fn invoke(&self, host: &str, args: &[String]) -> Result<String, DockerError> {
        debug!(host, command = %args.join(" "), "docker invocation");

        let output = Command::new("docker")
            .arg("-H")
            .arg(format!("tcp://{host}:{DOCKER_TCP_PORT}"))
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(DockerError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
