//! Access gate — who may read and write a room.
//!
//! DESIGN
//! ======
//! [`can_access`] is a pure decision over a loaded [`Room`]. The async
//! `require_*` helpers load the room, run the decision, and turn a denial
//! into `SyncError::AccessDenied`; every mutating service calls one of them
//! before touching the store.
//!
//! DECISION TABLE
//! ==============
//! - no room                 → denied `not_found`
//! - public room             → granted (anonymous viewers read-only)
//! - private, admin          → granted
//! - private, member         → granted
//! - private, request queued → denied `pending`
//! - private, otherwise      → denied `none`

use std::fmt;

use serde::Serialize;

use super::{SyncContext, decode, decode_children, validate_id};
use crate::error::SyncError;
use crate::model::{Identity, PendingRequest, Room, RoomDetails, Visibility};
use crate::store::paths;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantReason {
    Public,
    Member,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotFound,
    Pending,
    None,
    Unauthenticated,
    NotAdmin,
    NotOwner,
}

impl DenyReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Pending => "pending",
            Self::None => "none",
            Self::Unauthenticated => "unauthenticated",
            Self::NotAdmin => "not_admin",
            Self::NotOwner => "not_owner",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Granted(GrantReason),
    Denied(DenyReason),
}

impl AccessDecision {
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// A user's relationship to a room, as shown to the user themself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    None,
    Pending,
    Approved,
}

// =============================================================================
// DECISIONS
// =============================================================================

/// Decide whether `user` (or an anonymous viewer) may access `room`.
#[must_use]
pub fn can_access(room: Option<&Room>, user: Option<&str>) -> AccessDecision {
    let Some(room) = room else {
        return AccessDecision::Denied(DenyReason::NotFound);
    };
    decide(&room.details, user, |uid| room.pending.contains_key(uid))
}

/// Same decision without the pending set; used when re-checking a live
/// details snapshot, where a denial always means `none`.
#[must_use]
pub fn can_access_details(details: &RoomDetails, user: Option<&str>) -> AccessDecision {
    decide(details, user, |_| false)
}

fn decide(details: &RoomDetails, user: Option<&str>, has_pending: impl Fn(&str) -> bool) -> AccessDecision {
    if details.visibility == Visibility::Public {
        return AccessDecision::Granted(GrantReason::Public);
    }
    let Some(uid) = user else {
        return AccessDecision::Denied(DenyReason::None);
    };
    if details.admin == uid {
        return AccessDecision::Granted(GrantReason::Admin);
    }
    if details.is_member(uid) {
        return AccessDecision::Granted(GrantReason::Member);
    }
    if has_pending(uid) {
        return AccessDecision::Denied(DenyReason::Pending);
    }
    AccessDecision::Denied(DenyReason::None)
}

/// Pending request first, then membership. Admins count as approved.
#[must_use]
pub fn access_status(room: &Room, user_id: &str) -> AccessStatus {
    if room.pending.contains_key(user_id) {
        return AccessStatus::Pending;
    }
    if room.details.admin == user_id || room.details.is_member(user_id) {
        return AccessStatus::Approved;
    }
    AccessStatus::None
}

// =============================================================================
// LOADING + ENFORCEMENT
// =============================================================================

/// Load a room's details and pending requests. `None` if the room is unknown.
///
/// # Errors
///
/// Returns `Validation` for a bad id, `Transport` on store failure, or
/// `Malformed` if the details record cannot be decoded.
pub async fn load_room(ctx: &SyncContext, room_id: &str) -> Result<Option<Room>, SyncError> {
    validate_id("room", room_id)?;
    let details_path = paths::details(room_id);
    let Some(raw) = ctx.store.read(&details_path).await? else {
        return Ok(None);
    };
    let details: RoomDetails = decode(&details_path, raw)?;
    let pending_path = paths::pending(room_id);
    let pending = decode_children::<PendingRequest>(&pending_path, ctx.store.read(&pending_path).await?)
        .into_iter()
        .collect();
    Ok(Some(Room { id: room_id.to_owned(), details, pending }))
}

/// Load a room and require read access for `user`.
///
/// # Errors
///
/// `NotFound` for an unknown room, `AccessDenied` when the gate refuses.
pub async fn require_access(ctx: &SyncContext, room_id: &str, user: Option<&str>) -> Result<Room, SyncError> {
    let room = load_room(ctx, room_id).await?;
    match can_access(room.as_ref(), user) {
        AccessDecision::Granted(_) => room.ok_or_else(|| SyncError::NotFound(format!("room {room_id}"))),
        AccessDecision::Denied(DenyReason::NotFound) => Err(SyncError::NotFound(format!("room {room_id}"))),
        AccessDecision::Denied(reason) => Err(SyncError::AccessDenied(reason)),
    }
}

/// Require an authenticated user with access to the room.
///
/// # Errors
///
/// `AccessDenied(Unauthenticated)` for anonymous callers, otherwise as
/// [`require_access`].
pub async fn require_writer<'a>(
    ctx: &SyncContext,
    room_id: &str,
    user: Option<&'a Identity>,
) -> Result<(Room, &'a Identity), SyncError> {
    let Some(user) = user else {
        return Err(SyncError::AccessDenied(DenyReason::Unauthenticated));
    };
    let room = require_access(ctx, room_id, Some(&user.uid)).await?;
    Ok((room, user))
}

/// Require the room admin.
///
/// # Errors
///
/// `AccessDenied(NotAdmin)` for anyone but the admin.
pub async fn require_admin(ctx: &SyncContext, room_id: &str, user: Option<&Identity>) -> Result<Room, SyncError> {
    let (room, user) = require_writer(ctx, room_id, user).await?;
    if room.details.admin != user.uid {
        return Err(SyncError::AccessDenied(DenyReason::NotAdmin));
    }
    Ok(room)
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
