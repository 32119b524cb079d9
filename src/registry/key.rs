//! Tagged keys and mirror events for the cluster name registry

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A cluster-wide registry key. Users are keyed by number; only public rooms
/// are ever registered, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistryKey {
    User { number: String },
    Room { name: String },
}

impl RegistryKey {
    /// Key for a logged-in user
    pub fn user<T: Into<String>>(number: T) -> Self {
        RegistryKey::User {
            number: number.into(),
        }
    }

    /// Key for a public room
    pub fn room<T: Into<String>>(name: T) -> Self {
        RegistryKey::Room { name: name.into() }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, RegistryKey::User { .. })
    }

    pub fn is_room(&self) -> bool {
        matches!(self, RegistryKey::Room { .. })
    }
}

/// Mirror-maintenance events pushed by the coordinator after each mutation.
/// `Snapshot` carries the whole map and is served when a peer link comes up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    Registered { key: RegistryKey, node: NodeId },
    Unregistered { key: RegistryKey },
    Snapshot { entries: Vec<(RegistryKey, NodeId)> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_kinds() {
        assert!(RegistryKey::user("042").is_user());
        assert!(RegistryKey::room("general").is_room());
        assert_ne!(RegistryKey::user("x"), RegistryKey::room("x"));
    }

    #[test]
    fn test_key_serde_roundtrip() {
        let key = RegistryKey::room("devs");
        let json = serde_json::to_string(&key).unwrap();
        let back: RegistryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
