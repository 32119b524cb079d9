//! Remote invocations
//!
//! The operation set a node accepts from its peers, plus the local dispatch
//! executing them against this node's state. Every operation addressed to a
//! room resolves against the local room index: by the time a request lands
//! here, the caller has already decided this node is the right call site.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::OpError;
use crate::registry::RegistryKey;
use crate::server::node::Node;
use crate::server::room::{RoomInfo, Visibility};
use crate::server::user::UserRecord;
use crate::NodeId;

/// Registry operations, only ever executed on the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryRequest {
    Register { key: RegistryKey, node: NodeId },
    Unregister { key: RegistryKey },
    Lookup { key: RegistryKey },
    Snapshot,
}

/// Operations on a room resident on the receiving node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomOp {
    AddMember { user: UserRecord },
    RemoveMember { user_number: String },
    SetDescription { description: String },
    SetAdmin { user: UserRecord },
    UpdateMember { user: UserRecord },
    Delete,
    Members,
    Description,
    Inspect,
    IsMember { user: UserRecord },
    IsAdmin { user: UserRecord },
    IsMemberByNumber { user_number: String },
}

/// A remote invocation as carried inside a request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Registry mutation or query (coordinator only)
    Registry(RegistryRequest),

    /// Operation on a resident room
    Room { room: String, op: RoomOp },

    /// Create a room on the receiving node (public migration target or
    /// private replica spawn)
    CreateRoom {
        name: String,
        visibility: Visibility,
        description: String,
        owner: UserRecord,
        members: Vec<UserRecord>,
    },

    /// Fetch the profile of a user resident on the receiving node
    GetUser { user_number: String },

    /// Write a line to the listed users' sockets on the receiving node
    DeliverLines {
        user_numbers: Vec<String>,
        line: String,
    },
}

/// Result payload of a successful remote invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    Unit,
    Flag(bool),
    Found(Option<NodeId>),
    Members(Vec<UserRecord>),
    Text(String),
    Info(RoomInfo),
    Profile(UserRecord),
    Snapshot(Vec<(RegistryKey, NodeId)>),
}

/// Execute an operation that arrived from a peer (or is being short-circuited
/// by the router because this node is the target).
pub async fn handle(node: &Arc<Node>, op: RemoteOp) -> Result<OpResult, OpError> {
    match op {
        RemoteOp::Registry(req) => handle_registry(node, req).await,
        RemoteOp::Room { room, op } => handle_room(node, &room, op).await,
        RemoteOp::CreateRoom {
            name,
            visibility,
            description,
            owner,
            members,
        } => {
            node.create_room_local(&name, visibility, description, owner, members)
                .await?;
            Ok(OpResult::Unit)
        }
        RemoteOp::GetUser { user_number } => match node.users().get(&user_number).await {
            Some(user) => Ok(OpResult::Profile(user.record().await)),
            None => Err(OpError::UserNotFound {
                number: user_number,
            }),
        },
        RemoteOp::DeliverLines { user_numbers, line } => {
            node.users().deliver(&user_numbers, &line).await;
            Ok(OpResult::Unit)
        }
    }
}

async fn handle_registry(node: &Arc<Node>, req: RegistryRequest) -> Result<OpResult, OpError> {
    let registry = node.registry();
    if !registry.is_coordinator() {
        return Err(OpError::Failed {
            reason: format!("node {} is not the registry coordinator", node.id()),
        });
    }

    match req {
        RegistryRequest::Register { key, node: owner } => {
            let registered = registry.coordinator_register(key, owner).await;
            Ok(OpResult::Flag(registered))
        }
        RegistryRequest::Unregister { key } => {
            registry.coordinator_unregister(key).await;
            Ok(OpResult::Unit)
        }
        RegistryRequest::Lookup { key } => {
            Ok(OpResult::Found(registry.coordinator_lookup(&key).await))
        }
        RegistryRequest::Snapshot => Ok(OpResult::Snapshot(registry.snapshot().await)),
    }
}

async fn handle_room(node: &Arc<Node>, room_name: &str, op: RoomOp) -> Result<OpResult, OpError> {
    let room = node
        .rooms()
        .lookup(room_name)
        .await
        .ok_or_else(|| OpError::RoomNotFound {
            name: room_name.to_string(),
        })?;

    match op {
        RoomOp::AddMember { user } => {
            let members = room.add_member(user).await?;
            Ok(OpResult::Members(members))
        }
        RoomOp::RemoveMember { user_number } => {
            let members = room.remove_member(&user_number).await?;
            debug!("removed {} from {} ({} left)", user_number, room_name, members.len());
            node.reap_replica_if_stranded(&room).await;
            Ok(OpResult::Members(members))
        }
        RoomOp::SetDescription { description } => {
            room.set_description(description).await;
            Ok(OpResult::Unit)
        }
        RoomOp::SetAdmin { user } => {
            room.set_admin(user).await;
            Ok(OpResult::Unit)
        }
        RoomOp::UpdateMember { user } => {
            room.update_member(user).await;
            Ok(OpResult::Unit)
        }
        RoomOp::Delete => {
            node.delete_room_local(room_name).await?;
            Ok(OpResult::Unit)
        }
        RoomOp::Members => Ok(OpResult::Members(room.members().await)),
        RoomOp::Description => Ok(OpResult::Text(room.description().await)),
        RoomOp::Inspect => Ok(OpResult::Info(room.inspect().await)),
        RoomOp::IsMember { user } => Ok(OpResult::Flag(room.is_member(&user).await)),
        RoomOp::IsAdmin { user } => Ok(OpResult::Flag(room.is_admin(&user).await)),
        RoomOp::IsMemberByNumber { user_number } => {
            Ok(OpResult::Flag(room.is_member_by_number(&user_number).await))
        }
    }
}
