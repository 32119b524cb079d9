//! Cluster node entry point
//!
//! Configuration comes from the environment: `NODE_ID`, `PORT`,
//! `CLUSTER_PORT`, `PEERS` (`id=host:port,..`), and `COORDINATOR`. With no
//! environment set this starts a standalone single-node cluster on port
//! 4040.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley::cluster::NodeConfig;
use parley::server::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::from_env().context("invalid configuration")?;
    info!(
        "starting node {} (coordinator: {}, {} peers)",
        config.node_id,
        config.coordinator,
        config.peers.len()
    );

    let node = Node::new(config);
    node.start().await.context("node failed")?;
    Ok(())
}
