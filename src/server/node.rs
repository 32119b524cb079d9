//! The per-node server
//!
//! A [`Node`] owns everything resident on one cluster member: the registry
//! view, the local room index, the logged-in users, and the peer transport.
//! It accepts client connections on one listener and peer connections on
//! another; both loops stop when the node's cancellation token fires.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::config::NodeConfig;
use crate::cluster::peer::Peers;
use crate::error::{OpError, Result};
use crate::registry::{ClusterRegistry, LocalRooms, RegistryKey};
use crate::server::room::{Room, Visibility};
use crate::server::session;
use crate::server::user::{LocalUsers, UserRecord};
use crate::NodeId;

/// One cluster member
pub struct Node {
    config: NodeConfig,
    peers: Arc<Peers>,
    registry: ClusterRegistry,
    rooms: LocalRooms,
    users: LocalUsers,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let peers = Peers::new(
            config.node_id.clone(),
            config.coordinator.clone(),
            config.peers.clone(),
            config.call_timeout,
            cancel.clone(),
        );
        let registry = ClusterRegistry::new(
            config.node_id.clone(),
            config.coordinator.clone(),
            Arc::clone(&peers),
        );

        let node = Arc::new(Self {
            config,
            peers,
            registry,
            rooms: LocalRooms::new(),
            users: LocalUsers::new(),
            cancel,
        });
        node.peers.bind_node(&node);
        node
    }

    pub fn id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &LocalRooms {
        &self.rooms
    }

    pub fn users(&self) -> &LocalUsers {
        &self.users
    }

    pub fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    /// Bind both listeners from the configuration and serve until cancelled
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let client = TcpListener::bind(&self.config.client_addr).await?;
        let cluster = TcpListener::bind(&self.config.cluster_addr).await?;
        info!(
            "node {} up: clients on {}, cluster on {}",
            self.id(),
            client.local_addr()?,
            cluster.local_addr()?
        );
        self.start_cluster(cluster);
        self.serve_clients(client).await
    }

    /// Spawn the peer listener loop
    pub fn start_cluster(self: &Arc<Self>, listener: TcpListener) {
        tokio::spawn(Arc::clone(&self.peers).serve(listener));
    }

    /// Accept client connections, one session task each
    pub async fn serve_clients(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("client listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let node = Arc::clone(self);
                        tokio::spawn(async move {
                            session::run(node, stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("client accept error: {}", e);
                    }
                }
            }
        }
    }

    /// Stop listeners and peer loops
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Create a room resident on this node. Public rooms claim their
    /// cluster-wide name first; the local index is the only gate for
    /// private replicas.
    pub async fn create_room_local(
        &self,
        name: &str,
        visibility: Visibility,
        description: String,
        owner: UserRecord,
        members: Vec<UserRecord>,
    ) -> std::result::Result<Arc<Room>, OpError> {
        let room = Arc::new(Room::new(name, visibility, description, owner, members));
        let name = room.name().to_string();

        match visibility {
            Visibility::Public => {
                let registered = self
                    .registry
                    .register(RegistryKey::room(&name), self.id().clone())
                    .await
                    .map_err(|e| e.into_op())?;
                if !registered {
                    return Err(OpError::RoomExists {
                        name,
                        private: false,
                    });
                }
                if !self.rooms.register_unique(Arc::clone(&room)).await {
                    // A private room of the same normalized name cannot
                    // collide, so this is a raced public create; give the
                    // cluster name back.
                    if let Err(e) = self.registry.unregister(RegistryKey::room(&name)).await {
                        warn!("rollback unregister of {} failed: {}", name, e);
                    }
                    return Err(OpError::RoomExists {
                        name,
                        private: true,
                    });
                }
                info!("public room {} created on {}", name, self.id());
            }
            Visibility::Private => {
                if !self.rooms.register_unique(Arc::clone(&room)).await {
                    return Err(OpError::RoomExists {
                        name,
                        private: true,
                    });
                }
                info!("private replica {} created on {}", name, self.id());
            }
        }

        Ok(room)
    }

    /// Tear down a resident room: local index always, cluster entry for
    /// public rooms. Returns the removed room so callers can keep its last
    /// member list.
    pub async fn delete_room_local(&self, name: &str) -> std::result::Result<Arc<Room>, OpError> {
        let room = self
            .rooms
            .unregister(name)
            .await
            .ok_or_else(|| OpError::RoomNotFound {
                name: name.to_string(),
            })?;

        if !room.is_private() {
            if let Err(e) = self.registry.unregister(RegistryKey::room(name)).await {
                warn!("cluster unregister of {} failed: {}", name, e);
            }
        }
        info!("room {} deleted on {}", name, self.id());
        Ok(room)
    }

    /// Drop a private replica once no remaining member lives here. Several
    /// members can share a node and share one replica, so the last local
    /// member leaving is the teardown point, not any member leaving.
    pub async fn reap_replica_if_stranded(&self, room: &Arc<Room>) {
        if !room.is_private() {
            return;
        }
        let members = room.members().await;
        if members.iter().any(|m| m.node == *self.id()) {
            return;
        }
        if self.rooms.unregister(room.name()).await.is_some() {
            info!("reaped stranded replica {} on {}", room.name(), self.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::NodeConfig;

    fn record(number: &str, name: &str, node: &str) -> UserRecord {
        UserRecord {
            user_number: number.to_string(),
            user_name: name.to_string(),
            node: node.to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_public_create_claims_cluster_name() {
        let node = Node::new(NodeConfig::standalone("a"));
        let alice = record("1", "alice", "a");

        let room = node
            .create_room_local("general", Visibility::Public, String::new(), alice.clone(), vec![])
            .await
            .unwrap();
        assert_eq!(room.name(), "general");
        assert_eq!(
            node.registry()
                .lookup(&RegistryKey::room("general"))
                .await
                .unwrap(),
            Some("a".to_string())
        );

        let err = node
            .create_room_local("general", Visibility::Public, String::new(), alice, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::RoomExists { private: false, .. }));
    }

    #[tokio::test]
    async fn test_private_create_is_local_only() {
        let node = Node::new(NodeConfig::standalone("a"));
        let alice = record("1", "alice", "a");

        let room = node
            .create_room_local("secret", Visibility::Private, String::new(), alice.clone(), vec![])
            .await
            .unwrap();
        assert_eq!(room.name(), "secret@private");
        assert_eq!(
            node.registry()
                .lookup(&RegistryKey::room("secret@private"))
                .await
                .unwrap(),
            None
        );

        let err = node
            .create_room_local("secret", Visibility::Private, String::new(), alice, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::RoomExists { private: true, .. }));
    }

    #[tokio::test]
    async fn test_delete_room_unregisters_everywhere() {
        let node = Node::new(NodeConfig::standalone("a"));
        let alice = record("1", "alice", "a");
        node.create_room_local("general", Visibility::Public, String::new(), alice, vec![])
            .await
            .unwrap();

        node.delete_room_local("general").await.unwrap();
        assert!(node.rooms().lookup("general").await.is_none());
        assert_eq!(
            node.registry()
                .lookup(&RegistryKey::room("general"))
                .await
                .unwrap(),
            None
        );
        assert!(matches!(
            node.delete_room_local("general").await,
            Err(OpError::RoomNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reap_keeps_replica_with_local_member() {
        let node = Node::new(NodeConfig::standalone("a"));
        let alice = record("1", "alice", "a");
        let bob = record("2", "bob", "b");
        let room = node
            .create_room_local(
                "secret",
                Visibility::Private,
                String::new(),
                alice,
                vec![bob],
            )
            .await
            .unwrap();

        // Bob (remote) leaves: a local member remains, replica stays.
        room.remove_member("2").await.unwrap();
        node.reap_replica_if_stranded(&room).await;
        assert!(node.rooms().lookup("secret@private").await.is_some());

        // Alice (local) leaves too: replica is stranded and reaped.
        room.remove_member("1").await.unwrap();
        node.reap_replica_if_stranded(&room).await;
        assert!(node.rooms().lookup("secret@private").await.is_none());
    }
}
