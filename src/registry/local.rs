//! Per-node unique-name index over resident rooms

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::server::room::Room;

/// Unique-name index of every room (public or private) resident on this
/// node. Private rooms have no cluster entry, so this index is the only
/// thing preventing two same-named rooms on one node.
pub struct LocalRooms {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl LocalRooms {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a resident room by normalized name
    pub async fn lookup(&self, name: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.get(name).cloned()
    }

    /// Register a room under its name; fails if the name is taken
    pub async fn register_unique(&self, room: Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room.name()) {
            return false;
        }
        rooms.insert(room.name().to_string(), room);
        true
    }

    /// Remove a room from the index; idempotent
    pub async fn unregister(&self, name: &str) -> Option<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        rooms.remove(name)
    }

    /// All resident rooms
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.values().cloned().collect()
    }

    /// Number of resident rooms
    pub async fn len(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for LocalRooms {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::room::Visibility;
    use crate::server::user::UserRecord;

    fn owner() -> UserRecord {
        UserRecord {
            user_number: "1".to_string(),
            user_name: "alice".to_string(),
            node: "a".to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_register_unique() {
        let index = LocalRooms::new();
        let room = Arc::new(Room::new(
            "general",
            Visibility::Public,
            String::new(),
            owner(),
            vec![],
        ));

        assert!(index.register_unique(Arc::clone(&room)).await);
        assert!(!index.register_unique(room).await);
        assert!(index.lookup("general").await.is_some());
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let index = LocalRooms::new();
        let room = Arc::new(Room::new(
            "general",
            Visibility::Public,
            String::new(),
            owner(),
            vec![],
        ));
        index.register_unique(room).await;

        assert!(index.unregister("general").await.is_some());
        assert!(index.unregister("general").await.is_none());
        assert!(index.is_empty().await);
    }
}
