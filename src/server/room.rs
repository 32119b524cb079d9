//! Room state object
//!
//! A room holds its description, the ordered member list, and the admin
//! snapshot behind one lock; every mutation goes through that lock, so
//! operations on a single room are one-at-a-time. Mutating member
//! operations hand back the post-mutation member list so callers can
//! broadcast it without a second read.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::OpError;
use crate::server::user::UserRecord;

/// Suffix marking a room name as private
pub const PRIVATE_SUFFIX: &str = "@private";

/// Room visibility classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    /// One authoritative instance cluster-wide, on the admin's node
    Public,
    /// One replica per member node, never registered cluster-wide
    Private,
}

/// Whether a room name designates a private room
pub fn is_private_name(name: &str) -> bool {
    name.contains(PRIVATE_SUFFIX)
}

/// Append the private suffix when the kind demands it and the name lacks it
pub fn normalize_name(name: &str, visibility: Visibility) -> String {
    match visibility {
        Visibility::Private if !name.ends_with(PRIVATE_SUFFIX) => {
            format!("{}{}", name, PRIVATE_SUFFIX)
        }
        _ => name.to_string(),
    }
}

/// Full room snapshot, also the INSPECT payload over the peer wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub visibility: Visibility,
    pub description: String,
    pub admin: UserRecord,
    pub members: Vec<UserRecord>,
}

/// Mutable part of a room, serialized by the room's lock
#[derive(Debug)]
struct RoomState {
    description: String,
    members: Vec<UserRecord>,
    admin: UserRecord,
}

/// A chat room (public instance or private replica)
#[derive(Debug)]
pub struct Room {
    /// Normalized name
    name: String,
    visibility: Visibility,
    state: RwLock<RoomState>,
}

impl Room {
    /// Build a room with `owner` as admin and first member. Extra `members`
    /// are appended in order, skipping duplicates of the owner.
    pub fn new(
        name: &str,
        visibility: Visibility,
        description: String,
        owner: UserRecord,
        members: Vec<UserRecord>,
    ) -> Self {
        let name = normalize_name(name, visibility);
        let mut all = vec![owner.clone()];
        for member in members {
            if !all.iter().any(|m| m.user_number == member.user_number) {
                all.push(member);
            }
        }

        Self {
            name,
            visibility,
            state: RwLock::new(RoomState {
                description,
                members: all,
                admin: owner,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    /// Append a member if absent; returns the updated member list
    pub async fn add_member(&self, user: UserRecord) -> Result<Vec<UserRecord>, OpError> {
        let mut state = self.state.write().await;
        if state
            .members
            .iter()
            .any(|m| m.user_number == user.user_number)
        {
            return Err(OpError::MemberExists {
                number: user.user_number,
            });
        }
        state.members.push(user);
        Ok(state.members.clone())
    }

    /// Remove the member with the given number; returns the updated member
    /// list. Does not reassign the admin.
    pub async fn remove_member(&self, user_number: &str) -> Result<Vec<UserRecord>, OpError> {
        let mut state = self.state.write().await;
        let idx = state
            .members
            .iter()
            .position(|m| m.user_number == user_number)
            .ok_or_else(|| OpError::MemberNotFound {
                number: user_number.to_string(),
            })?;
        state.members.remove(idx);
        Ok(state.members.clone())
    }

    pub async fn set_description(&self, description: String) {
        let mut state = self.state.write().await;
        state.description = description;
    }

    /// Replace the admin snapshot. Callers enforce membership.
    pub async fn set_admin(&self, user: UserRecord) {
        let mut state = self.state.write().await;
        state.admin = user;
    }

    /// Replace the member sharing `user.user_number` with the fresh record;
    /// the admin snapshot follows when the number matches.
    pub async fn update_member(&self, user: UserRecord) {
        let mut state = self.state.write().await;
        if state.admin.user_number == user.user_number {
            state.admin = user.clone();
        }
        if let Some(member) = state
            .members
            .iter_mut()
            .find(|m| m.user_number == user.user_number)
        {
            *member = user;
        }
    }

    pub async fn members(&self) -> Vec<UserRecord> {
        let state = self.state.read().await;
        state.members.clone()
    }

    pub async fn admin(&self) -> UserRecord {
        let state = self.state.read().await;
        state.admin.clone()
    }

    pub async fn description(&self) -> String {
        let state = self.state.read().await;
        state.description.clone()
    }

    pub async fn inspect(&self) -> RoomInfo {
        let state = self.state.read().await;
        RoomInfo {
            name: self.name.clone(),
            visibility: self.visibility,
            description: state.description.clone(),
            admin: state.admin.clone(),
            members: state.members.clone(),
        }
    }

    /// Membership check over the entire snapshot record
    pub async fn is_member(&self, user: &UserRecord) -> bool {
        let state = self.state.read().await;
        state.members.iter().any(|m| m == user)
    }

    /// Membership check by user number only
    pub async fn is_member_by_number(&self, user_number: &str) -> bool {
        let state = self.state.read().await;
        state.members.iter().any(|m| m.user_number == user_number)
    }

    pub async fn is_admin(&self, user: &UserRecord) -> bool {
        let state = self.state.read().await;
        state.admin.user_number == user.user_number
    }

    pub async fn member_count(&self) -> usize {
        let state = self.state.read().await;
        state.members.len()
    }
}
