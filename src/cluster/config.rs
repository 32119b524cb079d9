//! Node configuration
//!
//! Everything comes from the environment at startup. The defaults stand up a
//! working single-node cluster: the node is its own coordinator and has no
//! peers.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{NodeError, Result};
use crate::NodeId;

/// Default client port
pub const DEFAULT_PORT: u16 = 4040;

/// Default cluster (peer) port
pub const DEFAULT_CLUSTER_PORT: u16 = 4041;

/// Configuration for one cluster node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Cluster-unique name of this node
    pub node_id: NodeId,
    /// Client listener bind address
    pub client_addr: String,
    /// Peer listener bind address
    pub cluster_addr: String,
    /// Dial addresses of every other node's peer listener
    pub peers: HashMap<NodeId, String>,
    /// Node hosting the authoritative name registry
    pub coordinator: NodeId,
    /// Per-call timeout for remote invocations
    pub call_timeout: Duration,
}

impl NodeConfig {
    /// Read the configuration from the environment:
    /// `NODE_ID`, `PORT`, `CLUSTER_PORT`, `PEERS` (`id=host:port,..`),
    /// `COORDINATOR`.
    pub fn from_env() -> Result<Self> {
        let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node".to_string());

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| NodeError::protocol(format!("invalid PORT: {}", raw)))?,
            Err(_) => DEFAULT_PORT,
        };
        let cluster_port = match env::var("CLUSTER_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| NodeError::protocol(format!("invalid CLUSTER_PORT: {}", raw)))?,
            Err(_) => DEFAULT_CLUSTER_PORT,
        };

        let peers = match env::var("PEERS") {
            Ok(raw) => parse_peers(&raw)?,
            Err(_) => HashMap::new(),
        };

        let coordinator = env::var("COORDINATOR").unwrap_or_else(|_| node_id.clone());
        if coordinator != node_id && !peers.contains_key(&coordinator) {
            return Err(NodeError::protocol(format!(
                "coordinator '{}' is not listed in PEERS",
                coordinator
            )));
        }

        Ok(Self {
            node_id,
            client_addr: format!("0.0.0.0:{}", port),
            cluster_addr: format!("0.0.0.0:{}", cluster_port),
            peers,
            coordinator,
            call_timeout: Duration::from_secs(5),
        })
    }

    /// A standalone single-node configuration, handy for tests
    pub fn standalone<T: Into<String>>(node_id: T) -> Self {
        let node_id = node_id.into();
        Self {
            node_id: node_id.clone(),
            client_addr: "127.0.0.1:0".to_string(),
            cluster_addr: "127.0.0.1:0".to_string(),
            peers: HashMap::new(),
            coordinator: node_id,
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.node_id == self.coordinator
    }
}

/// Parse the `PEERS` list: comma-separated `id=host:port` pairs.
fn parse_peers(raw: &str) -> Result<HashMap<NodeId, String>> {
    let mut peers = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (id, addr) = pair
            .split_once('=')
            .ok_or_else(|| NodeError::protocol(format!("invalid PEERS entry: {}", pair)))?;
        let id = id.trim();
        let addr = addr.trim();
        if id.is_empty() || addr.is_empty() {
            return Err(NodeError::protocol(format!("invalid PEERS entry: {}", pair)));
        }
        peers.insert(id.to_string(), addr.to_string());
    }
    Ok(peers)
}
