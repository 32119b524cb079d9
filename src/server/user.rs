//! User state objects
//!
//! A [`User`] binds a profile record to the connection that created it. The
//! record is the unit that gets snapshotted into room member lists; the
//! outbox is the connection's write channel, so anything pushed here ends up
//! on the client socket in order.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::NodeId;

/// User profile snapshot as embedded in rooms and carried over the wire.
/// Identity is `user_number`; equality is over the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_number: String,
    pub user_name: String,
    pub node: NodeId,
    pub description: String,
}

/// A logged-in user resident on this node
#[derive(Debug)]
pub struct User {
    record: RwLock<UserRecord>,
    /// Id of the owning client connection
    conn_id: String,
    /// Line channel of the owning connection's write task
    outbox: mpsc::UnboundedSender<String>,
}

impl User {
    pub fn new(record: UserRecord, conn_id: String, outbox: mpsc::UnboundedSender<String>) -> Self {
        Self {
            record: RwLock::new(record),
            conn_id,
            outbox,
        }
    }

    /// Current profile snapshot
    pub async fn record(&self) -> UserRecord {
        self.record.read().await.clone()
    }

    /// Replace the description; returns the updated snapshot
    pub async fn set_description(&self, description: String) -> UserRecord {
        let mut record = self.record.write().await;
        record.description = description;
        record.clone()
    }

    /// Replace the display name; returns the updated snapshot
    pub async fn set_user_name(&self, user_name: String) -> UserRecord {
        let mut record = self.record.write().await;
        record.user_name = user_name;
        record.clone()
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Queue a line on the owning connection. Returns false when the
    /// connection's write task is gone.
    pub fn send(&self, line: String) -> bool {
        self.outbox.send(line).is_ok()
    }
}

/// All users logged in on this node, plus the connection binding used to
/// refuse a second LOGIN on an already-bound socket.
pub struct LocalUsers {
    users: RwLock<HashMap<String, Arc<User>>>,
    conns: RwLock<HashMap<String, String>>,
}

impl LocalUsers {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, user_number: &str) -> Option<Arc<User>> {
        let users = self.users.read().await;
        users.get(user_number).cloned()
    }

    /// The user bound to a connection, if any
    pub async fn by_conn(&self, conn_id: &str) -> Option<Arc<User>> {
        let number = {
            let conns = self.conns.read().await;
            conns.get(conn_id).cloned()
        }?;
        self.get(&number).await
    }

    /// Insert a user and bind its connection
    pub async fn insert(&self, user: Arc<User>) {
        let record = user.record().await;
        {
            let mut conns = self.conns.write().await;
            conns.insert(user.conn_id().to_string(), record.user_number.clone());
        }
        let mut users = self.users.write().await;
        users.insert(record.user_number, user);
    }

    /// Remove a user and unbind its connection
    pub async fn remove(&self, user_number: &str) -> Option<Arc<User>> {
        let user = {
            let mut users = self.users.write().await;
            users.remove(user_number)
        }?;
        {
            let mut conns = self.conns.write().await;
            conns.remove(user.conn_id());
        }
        Some(user)
    }

    /// Deliver one line to each listed user resident here. Missing users
    /// (raced with a logout) and closed outboxes are skipped.
    pub async fn deliver(&self, user_numbers: &[String], line: &str) {
        let users = self.users.read().await;
        for number in user_numbers {
            match users.get(number) {
                Some(user) => {
                    if !user.send(line.to_string()) {
                        debug!("dropping line for {}: connection gone", number);
                    }
                }
                None => debug!("dropping line for {}: not resident here", number),
            }
        }
    }

    pub async fn count(&self) -> usize {
        let users = self.users.read().await;
        users.len()
    }
}

impl Default for LocalUsers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(number: &str, name: &str) -> UserRecord {
        UserRecord {
            user_number: number.to_string(),
            user_name: name.to_string(),
            node: "a".to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let users = LocalUsers::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let alice = Arc::new(User::new(record("1", "alice"), "conn-1".to_string(), tx));

        users.insert(alice).await;
        assert!(users.get("1").await.is_some());
        assert!(users.by_conn("conn-1").await.is_some());
        assert!(users.by_conn("conn-2").await.is_none());
        assert_eq!(users.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_unbinds_connection() {
        let users = LocalUsers::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let alice = Arc::new(User::new(record("1", "alice"), "conn-1".to_string(), tx));
        users.insert(alice).await;

        assert!(users.remove("1").await.is_some());
        assert!(users.by_conn("conn-1").await.is_none());
        assert!(users.remove("1").await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_writes_to_outbox() {
        let users = LocalUsers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let alice = Arc::new(User::new(record("1", "alice"), "conn-1".to_string(), tx));
        users.insert(alice).await;

        users
            .deliver(&["1".to_string(), "99".to_string()], "hi\r\n")
            .await;
        assert_eq!(rx.recv().await.unwrap(), "hi\r\n");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_profile_mutation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let alice = User::new(record("1", "alice"), "conn-1".to_string(), tx);

        let updated = alice.set_user_name("alicia".to_string()).await;
        assert_eq!(updated.user_name, "alicia");
        let updated = alice.set_description("works nights".to_string()).await;
        assert_eq!(updated.description, "works nights");
        assert_eq!(alice.record().await, updated);
    }
}
