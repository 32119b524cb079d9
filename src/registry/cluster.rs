//! Cluster-wide name registry
//!
//! One node (the coordinator) owns the authoritative key-to-node map; every
//! mutation funnels through it, serialized under the map's write lock, which
//! gives per-key linearizability. Other nodes keep a mirror maintained by
//! events the coordinator pushes after each mutation and by a full snapshot
//! fetched when their coordinator link comes up. Keyed lookups are answered
//! by the coordinator; `enumerate` reads the mirror and is only eventually
//! consistent, which is all attribute listings need.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::cluster::peer::Peers;
use crate::cluster::rpc::{OpResult, RegistryRequest, RemoteOp};
use crate::error::{NodeError, Result};
use crate::registry::key::{RegistryEvent, RegistryKey};
use crate::NodeId;

/// The cluster name registry as seen from one node
pub struct ClusterRegistry {
    node_id: NodeId,
    coordinator: NodeId,
    peers: Arc<Peers>,
    /// Authoritative map on the coordinator, mirror everywhere else
    entries: RwLock<HashMap<RegistryKey, NodeId>>,
}

impl ClusterRegistry {
    pub fn new(node_id: NodeId, coordinator: NodeId, peers: Arc<Peers>) -> Self {
        Self {
            node_id,
            coordinator,
            peers,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.node_id == self.coordinator
    }

    /// Atomically bind a key to a node. Returns false when the key is
    /// already taken.
    pub async fn register(&self, key: RegistryKey, node: NodeId) -> Result<bool> {
        if self.is_coordinator() {
            return Ok(self.coordinator_register(key, node).await);
        }

        let result = self
            .peers
            .call(
                &self.coordinator,
                RemoteOp::Registry(RegistryRequest::Register {
                    key: key.clone(),
                    node: node.clone(),
                }),
            )
            .await?;
        match result {
            OpResult::Flag(true) => {
                let mut entries = self.entries.write().await;
                entries.insert(key, node);
                Ok(true)
            }
            OpResult::Flag(false) => Ok(false),
            other => Err(NodeError::protocol(format!(
                "unexpected register response: {:?}",
                other
            ))),
        }
    }

    /// Drop a key binding; silently a no-op when absent
    pub async fn unregister(&self, key: RegistryKey) -> Result<()> {
        if self.is_coordinator() {
            self.coordinator_unregister(key).await;
            return Ok(());
        }

        self.peers
            .call(
                &self.coordinator,
                RemoteOp::Registry(RegistryRequest::Unregister { key: key.clone() }),
            )
            .await?;
        let mut entries = self.entries.write().await;
        entries.remove(&key);
        Ok(())
    }

    /// Authoritative keyed lookup
    pub async fn lookup(&self, key: &RegistryKey) -> Result<Option<NodeId>> {
        if self.is_coordinator() {
            return Ok(self.coordinator_lookup(key).await);
        }

        let result = self
            .peers
            .call(
                &self.coordinator,
                RemoteOp::Registry(RegistryRequest::Lookup { key: key.clone() }),
            )
            .await?;
        match result {
            OpResult::Found(found) => {
                // Keep the mirror honest with what the coordinator said.
                let mut entries = self.entries.write().await;
                match &found {
                    Some(node) => {
                        entries.insert(key.clone(), node.clone());
                    }
                    None => {
                        entries.remove(key);
                    }
                }
                Ok(found)
            }
            other => Err(NodeError::protocol(format!(
                "unexpected lookup response: {:?}",
                other
            ))),
        }
    }

    /// Filtered listing from the local map (mirror on non-coordinators)
    pub async fn enumerate<F>(&self, predicate: F) -> Vec<(RegistryKey, NodeId)>
    where
        F: Fn(&RegistryKey) -> bool,
    {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect()
    }

    /// Names of every registered public room
    pub async fn public_rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .enumerate(RegistryKey::is_room)
            .await
            .into_iter()
            .map(|(key, _)| match key {
                RegistryKey::Room { name } => name,
                RegistryKey::User { number } => number,
            })
            .collect();
        names.sort();
        names
    }

    /// Apply a mirror event pushed by the coordinator
    pub async fn apply_event(&self, event: RegistryEvent) {
        if self.is_coordinator() {
            // The coordinator's map is the source of these events.
            return;
        }
        let mut entries = self.entries.write().await;
        match event {
            RegistryEvent::Registered { key, node } => {
                entries.insert(key, node);
            }
            RegistryEvent::Unregistered { key } => {
                entries.remove(&key);
            }
            RegistryEvent::Snapshot {
                entries: snapshot,
            } => {
                debug!("applying registry snapshot ({} entries)", snapshot.len());
                *entries = snapshot.into_iter().collect();
            }
        }
    }

    /// Full map dump, served to peers syncing their mirror
    pub async fn snapshot(&self) -> Vec<(RegistryKey, NodeId)> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Coordinator-local entry points, also reached via peer requests
    // ------------------------------------------------------------------

    /// Insert-or-fail under the write lock; broadcasts on success
    pub async fn coordinator_register(&self, key: RegistryKey, node: NodeId) -> bool {
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&key) {
                return false;
            }
            entries.insert(key.clone(), node.clone());
        }
        debug!("registered {:?} -> {}", key, node);
        self.peers
            .broadcast_event(RegistryEvent::Registered { key, node })
            .await;
        true
    }

    /// Remove and broadcast; idempotent
    pub async fn coordinator_unregister(&self, key: RegistryKey) {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(&key).is_some()
        };
        if removed {
            debug!("unregistered {:?}", key);
            self.peers
                .broadcast_event(RegistryEvent::Unregistered { key })
                .await;
        }
    }

    pub async fn coordinator_lookup(&self, key: &RegistryKey) -> Option<NodeId> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn standalone_registry() -> ClusterRegistry {
        let peers = Peers::new(
            "a".to_string(),
            "a".to_string(),
            HashMap::new(),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        ClusterRegistry::new("a".to_string(), "a".to_string(), peers)
    }

    #[tokio::test]
    async fn test_register_is_exclusive() {
        let registry = standalone_registry();
        let key = RegistryKey::user("042");

        assert!(registry.register(key.clone(), "a".to_string()).await.unwrap());
        assert!(!registry.register(key.clone(), "b".to_string()).await.unwrap());
        assert_eq!(
            registry.lookup(&key).await.unwrap(),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let registry = standalone_registry();
        let key = RegistryKey::room("devs");

        registry.register(key.clone(), "a".to_string()).await.unwrap();
        registry.unregister(key.clone()).await.unwrap();
        registry.unregister(key.clone()).await.unwrap();
        assert_eq!(registry.lookup(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enumerate_by_kind() {
        let registry = standalone_registry();
        registry
            .register(RegistryKey::user("1"), "a".to_string())
            .await
            .unwrap();
        registry
            .register(RegistryKey::room("devs"), "a".to_string())
            .await
            .unwrap();
        registry
            .register(RegistryKey::room("general"), "a".to_string())
            .await
            .unwrap();

        let users = registry.enumerate(RegistryKey::is_user).await;
        assert_eq!(users.len(), 1);
        assert_eq!(
            registry.public_rooms().await,
            vec!["devs".to_string(), "general".to_string()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let registry = standalone_registry();
        registry
            .register(RegistryKey::room("devs"), "a".to_string())
            .await
            .unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);

        // A non-coordinator applies the snapshot wholesale.
        let peers = Peers::new(
            "b".to_string(),
            "a".to_string(),
            HashMap::new(),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let mirror = ClusterRegistry::new("b".to_string(), "a".to_string(), peers);
        mirror
            .apply_event(RegistryEvent::Snapshot { entries: snapshot })
            .await;
        assert_eq!(mirror.public_rooms().await, vec!["devs".to_string()]);
    }
}
