//! Command dispatch
//!
//! Turns parsed commands into registry, router, room, and user operations,
//! and into reply envelopes. Handlers return the direct reply when there is
//! one; room notifications and chat lines go out through the fanout and the
//! caller, being a member, hears about them that way.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::rpc::{OpResult, RemoteOp, RoomOp};
use crate::error::{NodeError, OpError, Result};
use crate::protocol::command::Command;
use crate::protocol::envelope::{chat_line, direct, room_scoped};
use crate::registry::RegistryKey;
use crate::router::Router;
use crate::server::fanout;
use crate::server::node::Node;
use crate::server::room::{is_private_name, RoomInfo, Visibility};
use crate::server::session::Session;
use crate::server::user::{User, UserRecord};

/// Execute one command for a session. Returns the direct reply line, if any.
pub async fn handle(node: &Arc<Node>, session: &mut Session, cmd: Command) -> Option<String> {
    let cmd = match cmd {
        Command::Login {
            user_number,
            user_name,
        } => return Some(login(node, session, user_number, user_name).await),
        other => other,
    };

    let user = match &session.user {
        Some(user) => Arc::clone(user),
        None => return Some(crate::protocol::envelope::NOT_LOGGED_IN.to_string()),
    };

    match run_command(node, session, &user, cmd).await {
        Ok(reply) => reply,
        Err(e) => Some(direct(&op_text(&e.into_op()))),
    }
}

async fn run_command(
    node: &Arc<Node>,
    session: &mut Session,
    user: &Arc<User>,
    cmd: Command,
) -> Result<Option<String>> {
    let me = user.record().await;

    match cmd {
        Command::Login { .. } => Ok(None),

        Command::CreateRoom { name } => create_room(node, &me, &name, Visibility::Public).await,
        Command::CreatePrivateRoom { name } => {
            create_room(node, &me, &name, Visibility::Private).await
        }
        Command::JoinRoom { name } => join_room(node, &me, &name).await,

        Command::RoomLeave { room } => leave_room(node, &me, &room).await.map(|_| None),
        Command::RoomRemoveMember { room, user_number } => {
            remove_member(node, &me, &room, &user_number).await
        }
        Command::RoomSetDescription { room, description } => {
            set_description(node, &me, &room, description).await
        }
        Command::RoomGetDescription { room } => {
            let info = room_info_checked(node, &me, &room).await?;
            Ok(Some(direct(&info.description)))
        }
        Command::RoomGetMembers { room } => {
            let info = room_info_checked(node, &me, &room).await?;
            Ok(Some(direct(&format!(
                "Members of {}: {}",
                info.name,
                format_members(&info.members)
            ))))
        }
        Command::RoomInspect { room } => {
            let info = room_info_checked(node, &me, &room).await?;
            Ok(Some(direct(&format!(
                "{} | description: {} | admin: {} ({}) | members: {}",
                info.name,
                info.description,
                info.admin.user_name,
                info.admin.user_number,
                format_members(&info.members)
            ))))
        }
        Command::RoomWhichNode { room } => {
            let router = Router::new(node);
            Ok(Some(match router.node_of(&room).await? {
                Some(target) => direct(&format!("Room {} is on node {}", room, target)),
                None => direct(&format!("Room {} is not registered on any node", room)),
            }))
        }
        Command::RoomDelete { room } => delete_room(node, &me, &room).await,
        Command::RoomSend { room, message } => send_message(node, &me, &room, &message).await,
        Command::RoomInvite { room, user_number } => {
            invite(node, &me, &room, &user_number).await
        }

        Command::ListJoinedRooms => {
            let names = joined_room_names(node, &me).await;
            Ok(Some(if names.is_empty() {
                direct("You have not joined any room !")
            } else {
                direct(&format!("Joined rooms: {}", names.join(", ")))
            }))
        }
        Command::ListAccessibleRooms => {
            let names = node.registry().public_rooms().await;
            Ok(Some(if names.is_empty() {
                direct("There are no public rooms !")
            } else {
                direct(&format!("Accessible rooms: {}", names.join(", ")))
            }))
        }
        Command::GetMyself => Ok(Some(direct(&format!(
            "{} ({}) on node {} : {}",
            me.user_name, me.user_number, me.node, me.description
        )))),

        Command::SetMyDescription { description } => {
            let updated = user.set_description(description).await;
            propagate_profile(node, &updated).await;
            Ok(Some(direct("Description updated !")))
        }
        Command::SetMyUserName { user_name } => {
            let updated = user.set_user_name(user_name).await;
            propagate_profile(node, &updated).await;
            Ok(Some(direct(&format!(
                "You are now known as {} !",
                updated.user_name
            ))))
        }

        Command::LogOut => {
            let record = logout(node, user).await;
            session.user = None;
            Ok(Some(direct(&format!("Goodbye {} !", record.user_name))))
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn login(
    node: &Arc<Node>,
    session: &mut Session,
    user_number: String,
    user_name: String,
) -> String {
    if let Some(existing) = node.users().by_conn(&session.conn_id).await {
        let name = existing.record().await.user_name;
        return direct(&op_text(&OpError::ConnectionInUse { name }));
    }

    match node
        .registry()
        .register(RegistryKey::user(&user_number), node.id().clone())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return direct(&op_text(&OpError::AlreadyLoggedIn {
                number: user_number,
            }))
        }
        Err(e) => return direct(&op_text(&e.into_op())),
    }

    let record = UserRecord {
        user_number: user_number.clone(),
        user_name: user_name.clone(),
        node: node.id().clone(),
        description: String::new(),
    };
    let user = Arc::new(User::new(
        record,
        session.conn_id.clone(),
        session.outbox.clone(),
    ));
    node.users().insert(Arc::clone(&user)).await;
    session.user = Some(user);

    info!("user {} ({}) logged in on {}", user_name, user_number, node.id());
    direct(&format!("We welcome the glorious {} !", user_name))
}

async fn create_room(
    node: &Arc<Node>,
    me: &UserRecord,
    name: &str,
    visibility: Visibility,
) -> Result<Option<String>> {
    let room = node
        .create_room_local(name, visibility, String::new(), me.clone(), vec![])
        .await?;
    Ok(Some(direct(&format!("Room {} created !", room.name()))))
}

async fn join_room(node: &Arc<Node>, me: &UserRecord, name: &str) -> Result<Option<String>> {
    if is_private_name(name) {
        return Ok(Some(direct("You can't join a private room")));
    }

    let router = Router::new(node);
    let members = match router
        .room_call(name, RoomOp::AddMember { user: me.clone() })
        .await?
    {
        OpResult::Members(members) => members,
        other => return Err(unexpected(other)),
    };

    fanout::deliver(
        node,
        &members,
        &room_scoped(name, &format!("{} joined the room !", me.user_name)),
    )
    .await;
    Ok(None)
}

/// Leave semantics shared by `ROOM .. LEAVE` and the logout sweep: sole
/// member means deletion, a leaving admin hands the room to the first
/// remaining member (public rooms migrate to that member's node).
async fn leave_room(node: &Arc<Node>, me: &UserRecord, room_name: &str) -> Result<()> {
    let router = Router::new(node);

    if is_private_name(room_name) {
        let room = node
            .rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| not_member(room_name))?;
        if !room.is_member_by_number(&me.user_number).await {
            return Err(not_member(room_name));
        }

        let members = room.members().await;
        if members.len() == 1 {
            let nodes: Vec<_> = members.iter().map(|m| m.node.clone()).collect();
            router.apply_to_nodes(room_name, &nodes, RoomOp::Delete).await;
            fanout::deliver(
                node,
                &members,
                &room_scoped(
                    room_name,
                    &format!("Room {} deleted by {} !", room_name, me.user_name),
                ),
            )
            .await;
            return Ok(());
        }

        let was_admin = room.is_admin(me).await;
        let remaining: Vec<UserRecord> = members
            .iter()
            .filter(|m| m.user_number != me.user_number)
            .cloned()
            .collect();
        let all_nodes: Vec<_> = members.iter().map(|m| m.node.clone()).collect();
        router
            .apply_to_nodes(
                room_name,
                &all_nodes,
                RoomOp::RemoveMember {
                    user_number: me.user_number.clone(),
                },
            )
            .await;

        if was_admin {
            let new_admin = remaining
                .first()
                .cloned()
                .ok_or_else(|| NodeError::internal("no remaining member for admin transfer"))?;
            let surviving: Vec<_> = remaining.iter().map(|m| m.node.clone()).collect();
            router
                .apply_to_nodes(room_name, &surviving, RoomOp::SetAdmin { user: new_admin })
                .await;
        }

        fanout::deliver(
            node,
            &members,
            &room_scoped(room_name, &format!("{} left the room !", me.user_name)),
        )
        .await;
        return Ok(());
    }

    // Public room: everything happens on the authoritative node.
    let info = inspect_public(&router, room_name).await?;
    if !info
        .members
        .iter()
        .any(|m| m.user_number == me.user_number)
    {
        return Err(not_member(room_name));
    }

    if info.members.len() == 1 {
        router.room_call(room_name, RoomOp::Delete).await?;
        fanout::deliver(
            node,
            &info.members,
            &room_scoped(
                room_name,
                &format!("Room {} deleted by {} !", room_name, me.user_name),
            ),
        )
        .await;
        return Ok(());
    }

    if info.admin.user_number == me.user_number {
        // Admin leaves with members remaining: destroy here, recreate on the
        // new admin's node so the room keeps living next to its admin.
        let remaining: Vec<UserRecord> = info
            .members
            .iter()
            .filter(|m| m.user_number != me.user_number)
            .cloned()
            .collect();
        let new_admin = remaining
            .first()
            .cloned()
            .ok_or_else(|| NodeError::internal("no remaining member for migration"))?;
        let rest: Vec<UserRecord> = remaining[1..].to_vec();

        router.room_call(room_name, RoomOp::Delete).await?;
        router
            .route_to(
                &new_admin.node,
                RemoteOp::CreateRoom {
                    name: room_name.to_string(),
                    visibility: Visibility::Public,
                    description: info.description.clone(),
                    owner: new_admin.clone(),
                    members: rest,
                },
            )
            .await?;
        info!("room {} migrated to node {}", room_name, new_admin.node);
    } else {
        router
            .room_call(
                room_name,
                RoomOp::RemoveMember {
                    user_number: me.user_number.clone(),
                },
            )
            .await?;
    }

    fanout::deliver(
        node,
        &info.members,
        &room_scoped(room_name, &format!("{} left the room !", me.user_name)),
    )
    .await;
    Ok(())
}

async fn remove_member(
    node: &Arc<Node>,
    me: &UserRecord,
    room_name: &str,
    target: &str,
) -> Result<Option<String>> {
    if target == me.user_number {
        return Err(NodeError::Op(OpError::SelfRemoval {
            room: room_name.to_string(),
        }));
    }

    let router = Router::new(node);

    if is_private_name(room_name) {
        let room = node
            .rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| not_member(room_name))?;
        if !room.is_admin(me).await {
            return Err(not_admin(room_name));
        }
        if !room.is_member_by_number(target).await {
            return Err(NodeError::Op(OpError::MemberNotFound {
                number: target.to_string(),
            }));
        }

        let members = room.members().await;
        let removed_name = member_name(&members, target);
        let nodes: Vec<_> = members.iter().map(|m| m.node.clone()).collect();
        router
            .apply_to_nodes(
                room_name,
                &nodes,
                RoomOp::RemoveMember {
                    user_number: target.to_string(),
                },
            )
            .await;

        fanout::deliver(
            node,
            &members,
            &room_scoped(
                room_name,
                &format!("{} was removed from the room !", removed_name),
            ),
        )
        .await;
        return Ok(None);
    }

    let info = inspect_public(&router, room_name).await?;
    if info.admin.user_number != me.user_number {
        return Err(not_admin(room_name));
    }
    if !info.members.iter().any(|m| m.user_number == target) {
        return Err(NodeError::Op(OpError::MemberNotFound {
            number: target.to_string(),
        }));
    }

    let removed_name = member_name(&info.members, target);
    router
        .room_call(
            room_name,
            RoomOp::RemoveMember {
                user_number: target.to_string(),
            },
        )
        .await?;

    fanout::deliver(
        node,
        &info.members,
        &room_scoped(
            room_name,
            &format!("{} was removed from the room !", removed_name),
        ),
    )
    .await;
    Ok(None)
}

async fn set_description(
    node: &Arc<Node>,
    me: &UserRecord,
    room_name: &str,
    description: String,
) -> Result<Option<String>> {
    let router = Router::new(node);

    let members = if is_private_name(room_name) {
        let room = node
            .rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| not_member(room_name))?;
        if !room.is_admin(me).await {
            return Err(not_admin(room_name));
        }
        router
            .apply_to_all_members(
                room_name,
                RoomOp::SetDescription {
                    description: description.clone(),
                },
            )
            .await?
    } else {
        let info = inspect_public(&router, room_name).await?;
        if info.admin.user_number != me.user_number {
            return Err(not_admin(room_name));
        }
        router
            .room_call(
                room_name,
                RoomOp::SetDescription {
                    description: description.clone(),
                },
            )
            .await?;
        info.members
    };

    fanout::deliver(
        node,
        &members,
        &room_scoped(room_name, &format!("Description set to: {}", description)),
    )
    .await;
    Ok(None)
}

async fn delete_room(node: &Arc<Node>, me: &UserRecord, room_name: &str) -> Result<Option<String>> {
    let router = Router::new(node);

    let members = if is_private_name(room_name) {
        let room = node
            .rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| room_missing(room_name))?;
        if !room.is_admin(me).await {
            return Err(not_admin(room_name));
        }
        let members = room.members().await;
        let nodes: Vec<_> = members.iter().map(|m| m.node.clone()).collect();
        router.apply_to_nodes(room_name, &nodes, RoomOp::Delete).await;
        members
    } else {
        let info = inspect_public(&router, room_name).await?;
        if info.admin.user_number != me.user_number {
            return Err(not_admin(room_name));
        }
        router.room_call(room_name, RoomOp::Delete).await?;
        info.members
    };

    fanout::deliver(
        node,
        &members,
        &room_scoped(
            room_name,
            &format!("Room {} deleted by {} !", room_name, me.user_name),
        ),
    )
    .await;
    Ok(None)
}

async fn send_message(
    node: &Arc<Node>,
    me: &UserRecord,
    room_name: &str,
    message: &str,
) -> Result<Option<String>> {
    let info = room_info_checked(node, me, room_name).await?;
    fanout::deliver(
        node,
        &info.members,
        &chat_line(&me.user_name, room_name, message),
    )
    .await;
    Ok(None)
}

async fn invite(
    node: &Arc<Node>,
    me: &UserRecord,
    room_name: &str,
    target: &str,
) -> Result<Option<String>> {
    let router = Router::new(node);

    // The invitee must exist somewhere in the cluster; fetch their profile
    // from the node owning their connection.
    let target_node = node
        .registry()
        .lookup(&RegistryKey::user(target))
        .await?
        .ok_or_else(|| {
            NodeError::Op(OpError::UserNotFound {
                number: target.to_string(),
            })
        })?;
    let invitee = match router
        .route_to(
            &target_node,
            RemoteOp::GetUser {
                user_number: target.to_string(),
            },
        )
        .await?
    {
        OpResult::Profile(record) => record,
        other => return Err(unexpected(other)),
    };

    if is_private_name(room_name) {
        let room = node
            .rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| not_member(room_name))?;
        if !room.is_member_by_number(&me.user_number).await {
            return Err(not_member(room_name));
        }
        if room.is_member_by_number(&invitee.user_number).await {
            return Err(NodeError::Op(OpError::MemberExists {
                number: invitee.user_number,
            }));
        }

        let prior = room.members().await;
        room.add_member(invitee.clone()).await?;
        let updated = room.inspect().await;

        // Spawn a replica on the invitee's node. Another member may already
        // live there, in which case the name collision is the expected
        // answer and the convergence sweep below brings that replica up to
        // date.
        let replica_members: Vec<UserRecord> = updated
            .members
            .iter()
            .filter(|m| m.user_number != updated.admin.user_number)
            .cloned()
            .collect();
        match router
            .route_to(
                &invitee.node,
                RemoteOp::CreateRoom {
                    name: updated.name.clone(),
                    visibility: Visibility::Private,
                    description: updated.description.clone(),
                    owner: updated.admin.clone(),
                    members: replica_members,
                },
            )
            .await
        {
            Ok(_) => {}
            Err(NodeError::Op(OpError::RoomExists { .. })) => {}
            Err(e) => return Err(e),
        }

        let nodes: Vec<_> = updated.members.iter().map(|m| m.node.clone()).collect();
        router
            .apply_to_nodes(
                &updated.name,
                &nodes,
                RoomOp::AddMember {
                    user: invitee.clone(),
                },
            )
            .await;

        let mut recipients = vec![invitee.clone()];
        recipients.extend(prior);
        fanout::deliver(
            node,
            &recipients,
            &room_scoped(
                room_name,
                &format!("{} was invited by {} !", invitee.user_name, me.user_name),
            ),
        )
        .await;
        return Ok(None);
    }

    let info = inspect_public(&router, room_name).await?;
    if !info
        .members
        .iter()
        .any(|m| m.user_number == me.user_number)
    {
        return Err(not_member(room_name));
    }
    if info
        .members
        .iter()
        .any(|m| m.user_number == invitee.user_number)
    {
        return Err(NodeError::Op(OpError::MemberExists {
            number: invitee.user_number,
        }));
    }

    let members = match router
        .room_call(
            room_name,
            RoomOp::AddMember {
                user: invitee.clone(),
            },
        )
        .await?
    {
        OpResult::Members(members) => members,
        other => return Err(unexpected(other)),
    };

    fanout::deliver(
        node,
        &members,
        &room_scoped(
            room_name,
            &format!("{} was invited by {} !", invitee.user_name, me.user_name),
        ),
    )
    .await;
    Ok(None)
}

/// Push a refreshed profile into every room the user belongs to
async fn propagate_profile(node: &Arc<Node>, updated: &UserRecord) {
    let router = Router::new(node);

    for name in node.registry().public_rooms().await {
        let is_member = router
            .is_member_by_number(&name, &updated.user_number)
            .await
            .unwrap_or(false);
        if is_member {
            if let Err(e) = router
                .room_call(
                    &name,
                    RoomOp::UpdateMember {
                        user: updated.clone(),
                    },
                )
                .await
            {
                warn!("profile update in {} failed: {}", name, e);
            }
        }
    }

    for room in node.rooms().rooms().await {
        if room.is_private() && room.is_member_by_number(&updated.user_number).await {
            let members = room.members().await;
            let nodes: Vec<_> = members.iter().map(|m| m.node.clone()).collect();
            router
                .apply_to_nodes(
                    room.name(),
                    &nodes,
                    RoomOp::UpdateMember {
                        user: updated.clone(),
                    },
                )
                .await;
        }
    }
}

/// Leave every joined room (with the usual admin-transfer semantics), then
/// destroy the user. Also run by the session loop when a connection dies
/// without a proper LOG OUT.
pub async fn logout(node: &Arc<Node>, user: &Arc<User>) -> UserRecord {
    let record = user.record().await;

    for room_name in joined_room_names(node, &record).await {
        if let Err(e) = leave_room(node, &record, &room_name).await {
            warn!("logout: leaving {} failed: {}", room_name, e);
        }
    }

    if let Err(e) = node
        .registry()
        .unregister(RegistryKey::user(&record.user_number))
        .await
    {
        warn!("logout: unregistering {} failed: {}", record.user_number, e);
    }
    node.users().remove(&record.user_number).await;

    info!("user {} logged out of {}", record.user_number, node.id());
    record
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Public rooms (via the router) plus local private replicas the user is in
async fn joined_room_names(node: &Arc<Node>, me: &UserRecord) -> Vec<String> {
    let router = Router::new(node);
    let mut names = Vec::new();

    for name in node.registry().public_rooms().await {
        let is_member = router
            .is_member_by_number(&name, &me.user_number)
            .await
            .unwrap_or(false);
        if is_member {
            names.push(name);
        }
    }

    for room in node.rooms().rooms().await {
        if room.is_private() && room.is_member_by_number(&me.user_number).await {
            names.push(room.name().to_string());
        }
    }

    names.sort();
    names
}

/// Full room snapshot with the membership gate applied
async fn room_info_checked(
    node: &Arc<Node>,
    me: &UserRecord,
    room_name: &str,
) -> Result<RoomInfo> {
    let info = if is_private_name(room_name) {
        node.rooms()
            .lookup(room_name)
            .await
            .ok_or_else(|| not_member(room_name))?
            .inspect()
            .await
    } else {
        let router = Router::new(node);
        inspect_public(&router, room_name).await?
    };

    if !info
        .members
        .iter()
        .any(|m| m.user_number == me.user_number)
    {
        return Err(not_member(room_name));
    }
    Ok(info)
}

async fn inspect_public(router: &Router<'_>, room_name: &str) -> Result<RoomInfo> {
    match router.room_call(room_name, RoomOp::Inspect).await? {
        OpResult::Info(info) => Ok(info),
        other => Err(unexpected(other)),
    }
}

fn member_name(members: &[UserRecord], user_number: &str) -> String {
    members
        .iter()
        .find(|m| m.user_number == user_number)
        .map(|m| m.user_name.clone())
        .unwrap_or_else(|| user_number.to_string())
}

fn format_members(members: &[UserRecord]) -> String {
    members
        .iter()
        .map(|m| format!("{} ({})", m.user_name, m.user_number))
        .collect::<Vec<_>>()
        .join(", ")
}

fn not_member(room: &str) -> NodeError {
    NodeError::Op(OpError::NotMember {
        room: room.to_string(),
    })
}

fn not_admin(room: &str) -> NodeError {
    NodeError::Op(OpError::NotAdmin {
        room: room.to_string(),
    })
}

fn room_missing(room: &str) -> NodeError {
    NodeError::Op(OpError::RoomNotFound {
        name: room.to_string(),
    })
}

fn unexpected(result: OpResult) -> NodeError {
    NodeError::protocol(format!("unexpected dispatch response: {:?}", result))
}

/// The user-facing phrase for each recoverable condition
fn op_text(err: &OpError) -> String {
    match err {
        OpError::RoomExists {
            name,
            private: false,
        } => format!("Name '{}' is taken by an already existing public room.", name),
        OpError::RoomExists {
            name,
            private: true,
        } => format!(
            "Name '{}' is taken by an already existing room on this node.",
            name
        ),
        OpError::RoomNotFound { name } => format!("There is no room named {} !", name),
        OpError::UserNotFound { number } => format!("There is no user {} !", number),
        OpError::AlreadyLoggedIn { number } => {
            format!("User {} is already logged in !", number)
        }
        OpError::ConnectionInUse { name } => {
            format!("{} is already logged in on this connection !", name)
        }
        OpError::MemberExists { number } => {
            format!("User {} is already a member of the room !", number)
        }
        OpError::MemberNotFound { number } => {
            format!("User {} is not a member of the room !", number)
        }
        OpError::NotAdmin { room } => format!("You are not the admin of room {} !", room),
        OpError::NotMember { room } => format!("You are not a member of room {} !", room),
        OpError::SelfRemoval { room } => {
            format!("You can't remove yourself, use ROOM {} LEAVE !", room)
        }
        OpError::Failed { reason } => format!("Operation failed: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::NodeConfig;
    use crate::protocol::parse;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// A fake client: a session plus the receiving end of its outbox.
    /// Direct replies come back from `send`; broadcast lines land in `rx`.
    struct TestClient {
        session: Session,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl TestClient {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                session: Session {
                    conn_id: Uuid::new_v4().to_string(),
                    outbox: tx,
                    user: None,
                },
                rx,
            }
        }

        async fn send(&mut self, node: &Arc<Node>, line: &str) -> Option<String> {
            let cmd = parse(line).expect("test line must parse");
            handle(node, &mut self.session, cmd).await
        }

        fn drain(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(line) = self.rx.try_recv() {
                lines.push(line);
            }
            lines
        }
    }

    async fn login(node: &Arc<Node>, number: &str, name: &str) -> TestClient {
        let mut client = TestClient::new();
        let reply = client
            .send(node, &format!("LOGIN {} {}", number, name))
            .await
            .expect("login replies");
        assert_eq!(
            reply,
            format!("## We welcome the glorious {} ! ##\r\n", name)
        );
        client
    }

    async fn cluster_pair() -> (Arc<Node>, Arc<Node>) {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap().to_string();
        let addr_b = listener_b.local_addr().unwrap().to_string();

        let mut config_a = NodeConfig::standalone("a");
        config_a.peers.insert("b".to_string(), addr_b);
        let mut config_b = NodeConfig::standalone("b");
        config_b.coordinator = "a".to_string();
        config_b.peers.insert("a".to_string(), addr_a);

        let node_a = Node::new(config_a);
        let node_b = Node::new(config_b);
        node_a.start_cluster(listener_a);
        node_b.start_cluster(listener_b);
        (node_a, node_b)
    }

    // -- single node ------------------------------------------------------

    #[tokio::test]
    async fn test_login_collisions() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;

        let mut mallory = TestClient::new();
        let reply = mallory.send(&node, "LOGIN 1 Mallory").await.unwrap();
        assert_eq!(reply, "## User 1 is already logged in ! ##\r\n");

        let reply = alice.send(&node, "LOGIN 2 Alice2").await.unwrap();
        assert_eq!(
            reply,
            "## Alice is already logged in on this connection ! ##\r\n"
        );
    }

    #[tokio::test]
    async fn test_unique_room_creation() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;

        let reply = alice.send(&node, "CREATE ROOM general").await.unwrap();
        assert_eq!(reply, "## Room general created ! ##\r\n");

        let reply = bob.send(&node, "CREATE ROOM general").await.unwrap();
        assert_eq!(
            reply,
            "## Name 'general' is taken by an already existing public room. ##\r\n"
        );
    }

    #[tokio::test]
    async fn test_join_broadcast_and_leave_roundtrip() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;

        alice.send(&node, "CREATE ROOM devs").await;
        assert!(bob.send(&node, "JOIN ROOM devs").await.is_none());

        let joined_line = "(devs): ## Bob joined the room ! ##\r\n".to_string();
        assert_eq!(alice.drain(), vec![joined_line.clone()]);
        assert_eq!(bob.drain(), vec![joined_line]);

        let room = node.rooms().lookup("devs").await.unwrap();
        assert_eq!(room.member_count().await, 2);

        // Leaving returns the room to its post-creation state.
        assert!(bob.send(&node, "ROOM devs LEAVE").await.is_none());
        let left_line = "(devs): ## Bob left the room ! ##\r\n".to_string();
        assert_eq!(alice.drain(), vec![left_line.clone()]);
        assert_eq!(bob.drain(), vec![left_line]);

        let members = room.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_number, "1");
        assert!(room.is_admin(&members[0]).await);
    }

    #[tokio::test]
    async fn test_set_then_get_description() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;

        alice.send(&node, "CREATE ROOM devs").await;
        alice
            .send(&node, "ROOM devs SET DESCRIPTION TO where we talk")
            .await;
        let reply = alice.send(&node, "ROOM devs GET DESCRIPTION").await.unwrap();
        assert_eq!(reply, "## where we talk ##\r\n");
    }

    #[tokio::test]
    async fn test_send_delivers_exactly_once_per_member() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;
        let mut carol = login(&node, "3", "Carol").await;

        alice.send(&node, "CREATE ROOM t").await;
        bob.send(&node, "JOIN ROOM t").await;
        carol.send(&node, "JOIN ROOM t").await;
        alice.drain();
        bob.drain();
        carol.drain();

        assert!(alice.send(&node, "ROOM t SEND hello").await.is_none());
        let expected = "Alice (t): hello\r\n".to_string();
        assert_eq!(alice.drain(), vec![expected.clone()]);
        assert_eq!(bob.drain(), vec![expected.clone()]);
        assert_eq!(carol.drain(), vec![expected]);
    }

    #[tokio::test]
    async fn test_private_room_gate_and_invite() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;

        let reply = alice.send(&node, "CREATE PRIVATE ROOM secret").await.unwrap();
        assert_eq!(reply, "## Room secret@private created ! ##\r\n");

        // Private rooms cannot be joined, whether or not they exist.
        let reply = bob.send(&node, "JOIN ROOM secret@private").await.unwrap();
        assert_eq!(reply, "## You can't join a private room ##\r\n");

        assert!(bob
            .send(&node, "ROOM secret@private SEND psst")
            .await
            .unwrap()
            .contains("not a member"));

        assert!(alice
            .send(&node, "ROOM secret@private INVITE 2")
            .await
            .is_none());
        let invited = "(secret@private): ## Bob was invited by Alice ! ##\r\n".to_string();
        assert_eq!(alice.drain(), vec![invited.clone()]);
        assert_eq!(bob.drain(), vec![invited]);

        let room = node.rooms().lookup("secret@private").await.unwrap();
        assert!(room.is_member_by_number("2").await);

        // Inviting a user who does not exist is refused.
        let reply = alice
            .send(&node, "ROOM secret@private INVITE 99")
            .await
            .unwrap();
        assert_eq!(reply, "## There is no user 99 ! ##\r\n");
    }

    #[tokio::test]
    async fn test_remove_member_rules() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;

        alice.send(&node, "CREATE ROOM devs").await;
        bob.send(&node, "JOIN ROOM devs").await;

        // Self-removal is refused in favor of LEAVE.
        let reply = alice
            .send(&node, "ROOM devs REMOVE MEMBER 1")
            .await
            .unwrap();
        assert_eq!(
            reply,
            "## You can't remove yourself, use ROOM devs LEAVE ! ##\r\n"
        );

        // Only the admin removes members.
        let reply = bob.send(&node, "ROOM devs REMOVE MEMBER 1").await.unwrap();
        assert_eq!(reply, "## You are not the admin of room devs ! ##\r\n");

        alice.drain();
        bob.drain();
        assert!(alice
            .send(&node, "ROOM devs REMOVE MEMBER 2")
            .await
            .is_none());
        let removed = "(devs): ## Bob was removed from the room ! ##\r\n".to_string();
        assert_eq!(alice.drain(), vec![removed.clone()]);
        assert_eq!(bob.drain(), vec![removed]);

        let room = node.rooms().lookup("devs").await.unwrap();
        assert!(!room.is_member_by_number("2").await);
    }

    #[tokio::test]
    async fn test_profile_update_reaches_every_room() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;

        alice.send(&node, "CREATE ROOM devs").await;
        alice.send(&node, "CREATE ROOM ops").await;
        alice.send(&node, "CREATE PRIVATE ROOM secret").await;
        bob.send(&node, "JOIN ROOM devs").await;

        let reply = alice.send(&node, "SET MY USER NAME TO Alicia").await.unwrap();
        assert_eq!(reply, "## You are now known as Alicia ! ##\r\n");

        let reply = bob.send(&node, "ROOM devs GET MEMBERS").await.unwrap();
        assert!(reply.contains("Alicia (1)"));
        assert!(!reply.contains("Alice ("));

        let replica = node.rooms().lookup("secret@private").await.unwrap();
        assert_eq!(replica.admin().await.user_name, "Alicia");

        let ops = node.rooms().lookup("ops").await.unwrap();
        assert_eq!(ops.members().await[0].user_name, "Alicia");
    }

    #[tokio::test]
    async fn test_login_logout_roundtrip() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;

        alice.send(&node, "CREATE ROOM devs").await;
        alice.send(&node, "CREATE PRIVATE ROOM secret").await;

        let reply = alice.send(&node, "LOG OUT").await.unwrap();
        assert_eq!(reply, "## Goodbye Alice ! ##\r\n");

        // Sole-member rooms are gone, and so is the user's cluster entry.
        assert!(node.rooms().lookup("devs").await.is_none());
        assert!(node.rooms().lookup("secret@private").await.is_none());
        assert_eq!(
            node.registry()
                .lookup(&RegistryKey::user("1"))
                .await
                .unwrap(),
            None
        );
        assert!(node.registry().public_rooms().await.is_empty());

        // The same number can log in again afterwards.
        let reply = alice.send(&node, "LOGIN 1 Alice").await.unwrap();
        assert_eq!(reply, "## We welcome the glorious Alice ! ##\r\n");
    }

    #[tokio::test]
    async fn test_admin_leave_hands_room_over() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;
        let mut bob = login(&node, "2", "Bob").await;

        alice.send(&node, "CREATE ROOM devs").await;
        bob.send(&node, "JOIN ROOM devs").await;

        assert!(alice.send(&node, "ROOM devs LEAVE").await.is_none());

        let room = node.rooms().lookup("devs").await.unwrap();
        let members = room.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_number, "2");
        assert_eq!(room.admin().await.user_number, "2");
        assert_eq!(
            node.registry()
                .lookup(&RegistryKey::room("devs"))
                .await
                .unwrap(),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_which_node_and_listings() {
        let node = Node::new(NodeConfig::standalone("a"));
        let mut alice = login(&node, "1", "Alice").await;

        let reply = alice.send(&node, "LIST ACCESSIBLE ROOMS").await.unwrap();
        assert_eq!(reply, "## There are no public rooms ! ##\r\n");

        alice.send(&node, "CREATE ROOM devs").await;
        alice.send(&node, "CREATE PRIVATE ROOM secret").await;

        let reply = alice.send(&node, "ROOM devs ON WHICH NODE ?").await.unwrap();
        assert_eq!(reply, "## Room devs is on node a ##\r\n");
        let reply = alice
            .send(&node, "ROOM secret@private ON WHICH NODE ?")
            .await
            .unwrap();
        assert_eq!(
            reply,
            "## Room secret@private is not registered on any node ##\r\n"
        );

        let reply = alice.send(&node, "LIST ACCESSIBLE ROOMS").await.unwrap();
        assert_eq!(reply, "## Accessible rooms: devs ##\r\n");
        let reply = alice.send(&node, "LIST JOINED ROOMS").await.unwrap();
        assert_eq!(reply, "## Joined rooms: devs, secret@private ##\r\n");

        let reply = alice.send(&node, "GET MYSELF").await.unwrap();
        assert!(reply.contains("Alice (1) on node a"));
    }

    // -- two nodes --------------------------------------------------------

    #[tokio::test]
    async fn test_public_room_migration_across_nodes() {
        let (node_a, node_b) = cluster_pair().await;
        let mut alice = login(&node_a, "1", "Alice").await;
        let mut bob = login(&node_b, "2", "Bob").await;

        alice.send(&node_a, "CREATE ROOM devs").await;
        assert!(bob.send(&node_b, "JOIN ROOM devs").await.is_none());
        assert_eq!(
            alice.drain(),
            vec!["(devs): ## Bob joined the room ! ##\r\n".to_string()]
        );

        // The admin leaves: the room migrates to Bob's node.
        assert!(alice.send(&node_a, "ROOM devs LEAVE").await.is_none());

        assert!(node_a.rooms().lookup("devs").await.is_none());
        let room = node_b.rooms().lookup("devs").await.unwrap();
        let members = room.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_number, "2");
        assert_eq!(room.admin().await.user_number, "2");

        let reply = bob
            .send(&node_b, "ROOM devs ON WHICH NODE ?")
            .await
            .unwrap();
        assert_eq!(reply, "## Room devs is on node b ##\r\n");
    }

    #[tokio::test]
    async fn test_private_invite_replicates_across_nodes() {
        let (node_a, node_b) = cluster_pair().await;
        let mut alice = login(&node_a, "1", "Alice").await;
        let mut bob = login(&node_b, "2", "Bob").await;

        alice.send(&node_a, "CREATE PRIVATE ROOM secret").await;
        alice
            .send(&node_a, "ROOM secret@private SET DESCRIPTION TO hush")
            .await;
        assert!(alice
            .send(&node_a, "ROOM secret@private INVITE 2")
            .await
            .is_none());

        let replica_a = node_a.rooms().lookup("secret@private").await.unwrap();
        let replica_b = node_b.rooms().lookup("secret@private").await.unwrap();
        assert_eq!(replica_a.inspect().await, replica_b.inspect().await);
        assert_eq!(replica_b.description().await, "hush");
        assert_eq!(replica_b.admin().await.user_number, "1");

        assert_eq!(
            bob.drain(),
            vec!["(secret@private): ## Bob was invited by Alice ! ##\r\n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cross_node_broadcast() {
        let (node_a, node_b) = cluster_pair().await;
        let mut alice = login(&node_a, "1", "Alice").await;
        let mut bob = login(&node_b, "2", "Bob").await;
        let mut carol = login(&node_a, "3", "Carol").await;

        alice.send(&node_a, "CREATE ROOM t").await;
        bob.send(&node_b, "JOIN ROOM t").await;
        carol.send(&node_a, "JOIN ROOM t").await;
        alice.drain();
        bob.drain();
        carol.drain();

        assert!(alice.send(&node_a, "ROOM t SEND hello").await.is_none());
        let expected = "Alice (t): hello\r\n".to_string();
        assert_eq!(alice.drain(), vec![expected.clone()]);
        assert_eq!(bob.drain(), vec![expected.clone()]);
        assert_eq!(carol.drain(), vec![expected]);
    }

    #[tokio::test]
    async fn test_private_admin_leave_across_nodes() {
        let (node_a, node_b) = cluster_pair().await;
        let mut alice = login(&node_a, "1", "Alice").await;
        let mut bob = login(&node_b, "2", "Bob").await;

        alice.send(&node_a, "CREATE PRIVATE ROOM secret").await;
        alice.send(&node_a, "ROOM secret@private INVITE 2").await;
        bob.drain();

        assert!(alice
            .send(&node_a, "ROOM secret@private LEAVE")
            .await
            .is_none());

        // Alice's node hosts no member anymore, so its replica is gone;
        // Bob's replica survives with Bob as admin.
        assert!(node_a.rooms().lookup("secret@private").await.is_none());
        let replica = node_b.rooms().lookup("secret@private").await.unwrap();
        assert_eq!(replica.admin().await.user_number, "2");
        assert_eq!(replica.member_count().await, 1);

        let lines = bob.drain();
        assert!(lines
            .iter()
            .any(|l| l == "(secret@private): ## Alice left the room ! ##\r\n"));
    }
}
