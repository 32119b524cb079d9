//! Error handling for the chat cluster node

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Node error types
#[derive(Debug, Clone)]
pub enum NodeError {
    /// Socket-level errors
    Io(String),
    /// Malformed frames or commands
    Protocol(String),
    /// Peer link errors (dial failure, link dropped, unknown node)
    Peer(String),
    /// Remote invocation timed out
    Timeout(String),
    /// Cluster registry failures other than name collisions
    Registry(String),
    /// Server internal error
    Internal(String),
    /// Recoverable condition surfaced to the client
    Op(OpError),
}

impl NodeError {
    /// Create an io error
    pub fn io<T: Into<String>>(msg: T) -> Self {
        NodeError::Io(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        NodeError::Protocol(msg.into())
    }

    /// Create a peer link error
    pub fn peer<T: Into<String>>(msg: T) -> Self {
        NodeError::Peer(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        NodeError::Timeout(msg.into())
    }

    /// Create a registry error
    pub fn registry<T: Into<String>>(msg: T) -> Self {
        NodeError::Registry(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        NodeError::Internal(msg.into())
    }

    /// Collapse into the serializable error layer for a peer response.
    pub fn into_op(self) -> OpError {
        match self {
            NodeError::Op(op) => op,
            other => OpError::Failed {
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Io(msg) => write!(f, "IO error: {}", msg),
            NodeError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            NodeError::Peer(msg) => write!(f, "Peer error: {}", msg),
            NodeError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            NodeError::Registry(msg) => write!(f, "Registry error: {}", msg),
            NodeError::Internal(msg) => write!(f, "Internal error: {}", msg),
            NodeError::Op(op) => write!(f, "{}", op),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<OpError> for NodeError {
    fn from(err: OpError) -> Self {
        NodeError::Op(err)
    }
}

/// Recoverable conditions a command can run into. These travel inside peer
/// responses so the originating node can render the exact reply text even
/// when the operation failed on a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpError {
    /// A room with that name already exists (cluster-wide for public names,
    /// on this node for private ones)
    RoomExists { name: String, private: bool },
    /// No public room registered under that name
    RoomNotFound { name: String },
    /// No logged-in user with that number
    UserNotFound { number: String },
    /// The user number is already bound somewhere in the cluster
    AlreadyLoggedIn { number: String },
    /// The connection already carries a logged-in user
    ConnectionInUse { name: String },
    /// The user is already on the member list
    MemberExists { number: String },
    /// The user is not on the member list
    MemberNotFound { number: String },
    /// Caller is not the room admin
    NotAdmin { room: String },
    /// Caller is not a room member
    NotMember { room: String },
    /// REMOVE MEMBER aimed at the caller
    SelfRemoval { room: String },
    /// Anything else that crossed the wire (timeouts, dropped links)
    Failed { reason: String },
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::RoomExists {
                name,
                private: false,
            } => {
                write!(f, "public room '{}' already exists", name)
            }
            OpError::RoomExists {
                name,
                private: true,
            } => {
                write!(f, "room '{}' already exists on this node", name)
            }
            OpError::RoomNotFound { name } => write!(f, "room '{}' not found", name),
            OpError::UserNotFound { number } => write!(f, "user {} not found", number),
            OpError::AlreadyLoggedIn { number } => {
                write!(f, "user {} is already logged in", number)
            }
            OpError::ConnectionInUse { name } => {
                write!(f, "connection already belongs to {}", name)
            }
            OpError::MemberExists { number } => {
                write!(f, "user {} is already a member", number)
            }
            OpError::MemberNotFound { number } => {
                write!(f, "user {} is not a member", number)
            }
            OpError::NotAdmin { room } => write!(f, "not the admin of room '{}'", room),
            OpError::NotMember { room } => write!(f, "not a member of room '{}'", room),
            OpError::SelfRemoval { room } => {
                write!(f, "cannot remove yourself from room '{}'", room)
            }
            OpError::Failed { reason } => write!(f, "operation failed: {}", reason),
        }
    }
}

impl std::error::Error for OpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_error_roundtrip() {
        let err = OpError::RoomExists {
            name: "general".to_string(),
            private: false,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: OpError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn test_into_op_passthrough() {
        let err = NodeError::Op(OpError::NotAdmin {
            room: "devs".to_string(),
        });
        assert_eq!(
            err.into_op(),
            OpError::NotAdmin {
                room: "devs".to_string()
            }
        );
    }

    #[test]
    fn test_into_op_collapses_transport() {
        let err = NodeError::timeout("call to node b timed out");
        match err.into_op() {
            OpError::Failed { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
