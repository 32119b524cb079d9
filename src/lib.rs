//! Parley - a multi-node line-oriented chat server
//!
//! Clients connect over TCP, log in with a numeric identity, and talk in
//! rooms. The interesting part is placement: the cluster decides where room
//! state lives and makes it reachable from every node.
//!
//! ## Architecture
//!
//! - **Cluster registry**: a coordinator-backed name service mapping users
//!   and public rooms to nodes, mirrored on every member for listings.
//! - **Public rooms**: one authoritative instance, resident on the admin's
//!   node; the instance migrates when the admin leaves.
//! - **Private rooms**: one replica per member node, converged by fanning
//!   every mutation out to all replica hosts.
//! - **Router**: resolves each room operation to its call site and carries
//!   it there over request/reply peer links.
//! - **Sessions**: one task per client connection reading `\n`-terminated
//!   command lines; one write task per connection serializing replies and
//!   broadcast deliveries.
//!
//! ## Example
//!
//! ```rust,ignore
//! use parley::cluster::NodeConfig;
//! use parley::server::Node;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::from_env()?);
//!     node.start().await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

// Re-export error types
pub use error::{NodeError, OpError, Result};

// Re-export the pieces most callers touch
pub use cluster::{NodeConfig, Peers};
pub use protocol::{parse, Command};
pub use registry::{ClusterRegistry, LocalRooms, RegistryKey};
pub use router::Router;
pub use server::{Node, Room, RoomInfo, Session, User, UserRecord, Visibility};

/// Cluster-unique node identifier
pub type NodeId = String;
