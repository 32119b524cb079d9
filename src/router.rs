//! Operation routing
//!
//! Resolves a room operation to its call site. Private rooms are always the
//! local replica; public rooms resolve through the cluster registry to their
//! authoritative node. The self-addressed case short-circuits inside the
//! peer transport, so every path below reads the same whether the target is
//! this node or a neighbor.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::rpc::{OpResult, RemoteOp, RoomOp};
use crate::error::{NodeError, OpError, Result};
use crate::registry::RegistryKey;
use crate::server::node::Node;
use crate::server::room::is_private_name;
use crate::server::user::UserRecord;
use crate::NodeId;

/// Routing view over a node
pub struct Router<'a> {
    node: &'a Arc<Node>,
}

impl<'a> Router<'a> {
    pub fn new(node: &'a Arc<Node>) -> Self {
        Self { node }
    }

    /// Direct invocation on a specific node
    pub async fn route_to(&self, target: &NodeId, op: RemoteOp) -> Result<OpResult> {
        self.node.peers().call(target, op).await
    }

    /// Invoke a room operation wherever the room lives: on the local replica
    /// for private names, on the authoritative node for public ones.
    pub async fn room_call(&self, room_name: &str, op: RoomOp) -> Result<OpResult> {
        let target = if is_private_name(room_name) {
            self.node.id().clone()
        } else {
            self.node
                .registry()
                .lookup(&RegistryKey::room(room_name))
                .await?
                .ok_or_else(|| {
                    NodeError::Op(OpError::RoomNotFound {
                        name: room_name.to_string(),
                    })
                })?
        };

        self.route_to(
            &target,
            RemoteOp::Room {
                room: room_name.to_string(),
                op,
            },
        )
        .await
    }

    /// The node a public room is registered on, `None` for private names and
    /// unregistered rooms
    pub async fn node_of(&self, room_name: &str) -> Result<Option<NodeId>> {
        if is_private_name(room_name) {
            return Ok(None);
        }
        self.node
            .registry()
            .lookup(&RegistryKey::room(room_name))
            .await
    }

    /// Invoke an operation once per distinct node in `nodes`. Individual
    /// failures are logged and do not stop the sweep.
    pub async fn apply_to_nodes(&self, room_name: &str, nodes: &[NodeId], op: RoomOp) {
        let mut seen = HashSet::new();
        for target in nodes {
            if !seen.insert(target.clone()) {
                continue;
            }
            match self
                .route_to(
                    target,
                    RemoteOp::Room {
                        room: room_name.to_string(),
                        op: op.clone(),
                    },
                )
                .await
            {
                Ok(_) => {}
                // A replica that already converged answers with a domain
                // error; only transport trouble is worth a warning.
                Err(NodeError::Op(e)) => {
                    debug!("fanout to {} for room {}: {}", target, room_name, e)
                }
                Err(e) => warn!("fanout to {} for room {} failed: {}", target, room_name, e),
            }
        }
    }

    /// Fan a mutation out to every replica of a private room, driven by the
    /// local replica's member list. Returns the pre-mutation member snapshot.
    pub async fn apply_to_all_members(
        &self,
        room_name: &str,
        op: RoomOp,
    ) -> Result<Vec<UserRecord>> {
        let room = self
            .node
            .rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| {
                NodeError::Op(OpError::RoomNotFound {
                    name: room_name.to_string(),
                })
            })?;
        let members = room.members().await;
        let nodes: Vec<NodeId> = members.iter().map(|m| m.node.clone()).collect();
        self.apply_to_nodes(room_name, &nodes, op).await;
        Ok(members)
    }

    /// Routed membership check over the whole snapshot record
    pub async fn is_member(&self, room_name: &str, user: &UserRecord) -> Result<bool> {
        if is_private_name(room_name) {
            return Ok(match self.node.rooms().lookup(room_name).await {
                Some(room) => room.is_member(user).await,
                None => false,
            });
        }
        match self
            .room_call(room_name, RoomOp::IsMember { user: user.clone() })
            .await?
        {
            OpResult::Flag(flag) => Ok(flag),
            other => Err(unexpected(other)),
        }
    }

    /// Routed membership check by user number
    pub async fn is_member_by_number(&self, room_name: &str, user_number: &str) -> Result<bool> {
        if is_private_name(room_name) {
            return Ok(match self.node.rooms().lookup(room_name).await {
                Some(room) => room.is_member_by_number(user_number).await,
                None => false,
            });
        }
        match self
            .room_call(
                room_name,
                RoomOp::IsMemberByNumber {
                    user_number: user_number.to_string(),
                },
            )
            .await?
        {
            OpResult::Flag(flag) => Ok(flag),
            other => Err(unexpected(other)),
        }
    }

    /// Routed admin check
    pub async fn is_admin(&self, room_name: &str, user: &UserRecord) -> Result<bool> {
        if is_private_name(room_name) {
            return Ok(match self.node.rooms().lookup(room_name).await {
                Some(room) => room.is_admin(user).await,
                None => false,
            });
        }
        match self
            .room_call(room_name, RoomOp::IsAdmin { user: user.clone() })
            .await?
        {
            OpResult::Flag(flag) => Ok(flag),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(result: OpResult) -> NodeError {
    NodeError::protocol(format!("unexpected routing response: {:?}", result))
}
