//! stormd — the Perfect Storm executors.
//!
//! One binary, one executor role per subcommand:
//!
//! - **consul** — server election, client fan-out, catalog sync, WAN
//!   federation for one nodes pool
//! - **load-balancer** — HAProxy lifecycle + backend membership for
//!   every exposed application service
//! - **docker** — the `recipe` trigger handler driving docker engines
//!
//! # Usage
//!
//! ```text
//! stormd consul -n pool1 --federate pool2 --server http://127.0.0.1:8000/
//! stormd load-balancer -n pool1
//! stormd docker
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use storm_api::{ApiClient, DEFAULT_SERVER};
use storm_consul::ConsulReconciler;
use storm_docker::DockerWorker;
use storm_executor::{HandlerHost, PollingExecutor};
use storm_loadbalancer::LoadBalancerReconciler;

#[derive(Parser)]
#[command(name = "stormd", about = "Perfect Storm executors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile a Consul deployment over one nodes pool.
    Consul {
        /// Group of nodes this executor manages.
        #[arg(short = 'n', long)]
        nodes_pool: String,

        /// Remote pool to federate with over WAN (repeatable).
        #[arg(short = 'f', long)]
        federate: Vec<String>,

        /// Seconds between convergence ticks.
        #[arg(long, default_value = "1")]
        poll_interval: u64,

        /// API server URL.
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Reconcile load balancers for exposed application services.
    LoadBalancer {
        /// Group of nodes this executor manages.
        #[arg(short = 'n', long)]
        nodes_pool: String,

        /// Seconds between convergence ticks.
        #[arg(long, default_value = "1")]
        poll_interval: u64,

        /// API server URL.
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Handle `recipe` triggers against docker engines.
    Docker {
        /// Seconds between trigger-queue polls.
        #[arg(long, default_value = "1")]
        poll_interval: u64,

        /// API server URL.
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stormd=debug".parse().expect("static filter")),
        )
        .init();

    let cli = Cli::parse();

    // Termination stops the loop after the current reconcile;
    // in-flight triggers are left to the API server's TTL cleanup.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Command::Consul {
            nodes_pool,
            federate,
            poll_interval,
            server,
        } => {
            info!(pool = %nodes_pool, %server, "consul executor starting");
            let api = ApiClient::new(&server)?;
            let reconciler = ConsulReconciler::new(api, &nodes_pool, federate);
            PollingExecutor::new(reconciler, Duration::from_secs(poll_interval))
                .run(shutdown_rx)
                .await?;
        }

        Command::LoadBalancer {
            nodes_pool,
            poll_interval,
            server,
        } => {
            info!(pool = %nodes_pool, %server, "load-balancer executor starting");
            let api = ApiClient::new(&server)?;
            let reconciler = LoadBalancerReconciler::new(api, &nodes_pool);
            PollingExecutor::new(reconciler, Duration::from_secs(poll_interval))
                .run(shutdown_rx)
                .await?;
        }

        Command::Docker {
            poll_interval,
            server,
        } => {
            info!(%server, "docker trigger handler starting");
            let api = ApiClient::new(&server)?;
            HandlerHost::new(api, DockerWorker::new())
                .with_poll_interval(Duration::from_secs(poll_interval))
                .run(shutdown_rx)
                .await?;
        }
    }

    info!("stormd stopped");
    Ok(())
}
