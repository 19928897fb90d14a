//! Room directory — creation, settings, and private-room membership.
//!
//! DESIGN
//! ======
//! A user's relationship to a private room moves through
//! `none → pending → {approved | none}`. Approval and rejection both clear
//! the pending entry in the same write that grants (or doesn't) membership,
//! so the two never disagree. Removal returns the user to `none` and drops
//! their presence record.
//!
//! Two admin sessions racing on the same request are harmless: every
//! membership write is idempotent and any interleaving ends in a valid
//! state.

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::info;

use super::access::{self, AccessStatus, can_access, load_room, require_access, require_admin};
use super::{SyncContext, now_ms, validate_id};
use crate::error::SyncError;
use crate::model::{Identity, PendingRequest, RoomDetails, Visibility};
use crate::store::paths;

pub const MAX_NAME_LEN: usize = 120;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRoom {
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSettings {
    pub name: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
}

/// Outstanding access request, as listed to the admin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    pub user_id: String,
    #[serde(flatten)]
    pub request: PendingRequest,
}

fn validate_name(name: &str) -> Result<String, SyncError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SyncError::validation("room name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(SyncError::validation(format!("room name longer than {MAX_NAME_LEN} characters")));
    }
    Ok(name.to_owned())
}

// =============================================================================
// CREATE / SETTINGS
// =============================================================================

/// Create a room with `admin` as its first member. Returns the new id.
///
/// # Errors
///
/// `Validation` for a blank or overlong name.
pub async fn create_room(ctx: &SyncContext, admin: &Identity, new: NewRoom) -> Result<String, SyncError> {
    let name = validate_name(&new.name)?;
    let mut details = RoomDetails {
        name,
        description: new.description.trim().to_owned(),
        visibility: new.visibility,
        admin: admin.uid.clone(),
        created_at: now_ms(),
        ..RoomDetails::default()
    };
    details.members.insert(admin.uid.clone(), true);

    let value = serde_json::to_value(&details).map_err(|source| SyncError::Malformed {
        path: paths::ROOMS.to_owned(),
        source,
    })?;
    let room_id = ctx.store.append(paths::ROOMS, json!({ "details": value })).await?;
    info!(%room_id, admin = %admin.uid, visibility = ?details.visibility, "room: created");
    Ok(room_id)
}

/// Admin-only edit of name, description, and visibility.
///
/// # Errors
///
/// `AccessDenied(NotAdmin)` or `Validation`.
pub async fn update_room_settings(
    ctx: &SyncContext,
    room_id: &str,
    admin: &Identity,
    settings: RoomSettings,
) -> Result<RoomDetails, SyncError> {
    require_admin(ctx, room_id, Some(admin)).await?;
    let mut patch = Map::new();
    if let Some(name) = &settings.name {
        patch.insert("name".into(), json!(validate_name(name)?));
    }
    if let Some(description) = &settings.description {
        patch.insert("description".into(), json!(description.trim()));
    }
    if let Some(visibility) = settings.visibility {
        patch.insert("visibility".into(), json!(visibility));
    }
    if patch.is_empty() {
        return Err(SyncError::validation("empty settings patch"));
    }
    ctx.store.write(&paths::details(room_id), Value::Object(patch)).await?;
    info!(%room_id, "room: settings updated");

    let room = load_room(ctx, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;
    Ok(room.details)
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Queue an access request. A user who already has access gets their
/// current status back without a write.
///
/// # Errors
///
/// `NotFound` for an unknown room.
pub async fn request_access(ctx: &SyncContext, room_id: &str, user: &Identity) -> Result<AccessStatus, SyncError> {
    let room = load_room(ctx, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;
    if can_access(Some(&room), Some(&user.uid)).is_granted() {
        return Ok(AccessStatus::Approved);
    }
    let request = PendingRequest {
        name: user.name_or_anonymous(),
        avatar: user.photo_url.clone(),
        requested_at: now_ms(),
    };
    let value = serde_json::to_value(&request).map_err(|source| SyncError::Malformed {
        path: paths::pending(room_id),
        source,
    })?;
    ctx.store
        .write(&paths::pending(room_id), json!({ user.uid.clone(): value }))
        .await?;
    info!(%room_id, user_id = %user.uid, "room: access requested");
    Ok(AccessStatus::Pending)
}

/// Grant membership and clear the request in one write.
///
/// # Errors
///
/// `AccessDenied(NotAdmin)` for anyone but the admin.
pub async fn approve_access(ctx: &SyncContext, room_id: &str, admin: &Identity, user_id: &str) -> Result<(), SyncError> {
    require_admin(ctx, room_id, Some(admin)).await?;
    validate_id("user", user_id)?;
    ctx.store
        .write(
            &paths::room(room_id),
            json!({
                format!("details/members/{user_id}"): true,
                format!("pending/{user_id}"): null,
            }),
        )
        .await?;
    info!(%room_id, %user_id, "room: access approved");
    Ok(())
}

/// Drop a request without granting anything. The user may ask again.
///
/// # Errors
///
/// `AccessDenied(NotAdmin)` for anyone but the admin.
pub async fn reject_access(ctx: &SyncContext, room_id: &str, admin: &Identity, user_id: &str) -> Result<(), SyncError> {
    require_admin(ctx, room_id, Some(admin)).await?;
    validate_id("user", user_id)?;
    ctx.store.delete(&paths::pending_request(room_id, user_id)).await?;
    info!(%room_id, %user_id, "room: access rejected");
    Ok(())
}

/// Revoke membership and remove the member's presence record.
///
/// # Errors
///
/// `AccessDenied(NotAdmin)`, or `Validation` when the admin targets
/// themself.
pub async fn remove_member(ctx: &SyncContext, room_id: &str, admin: &Identity, user_id: &str) -> Result<(), SyncError> {
    require_admin(ctx, room_id, Some(admin)).await?;
    validate_id("user", user_id)?;
    if user_id == admin.uid {
        return Err(SyncError::validation("admin cannot remove themself"));
    }
    ctx.store
        .write(
            &paths::room(room_id),
            json!({
                format!("details/members/{user_id}"): null,
                format!("users/{user_id}"): null,
            }),
        )
        .await?;
    info!(%room_id, %user_id, "room: member removed");
    Ok(())
}

/// Visiting a public room records membership, so a later switch to private
/// keeps everyone who was already there.
///
/// Returns whether a membership was added.
///
/// # Errors
///
/// `NotFound` for an unknown room or a transport error.
pub async fn enroll_public_member(ctx: &SyncContext, room_id: &str, user: &Identity) -> Result<bool, SyncError> {
    let room = load_room(ctx, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;
    if room.details.visibility != Visibility::Public || room.details.is_member(&user.uid) {
        return Ok(false);
    }
    ctx.store.write(&paths::details(room_id), json!({ format!("members/{}", user.uid): true })).await?;
    Ok(true)
}

// =============================================================================
// READS
// =============================================================================

/// Room details for anyone the gate admits.
///
/// # Errors
///
/// `NotFound` or `AccessDenied`.
pub async fn get(ctx: &SyncContext, room_id: &str, user: Option<&str>) -> Result<RoomDetails, SyncError> {
    Ok(require_access(ctx, room_id, user).await?.details)
}

/// Pending requests, oldest first. Admin only.
///
/// # Errors
///
/// `AccessDenied(NotAdmin)` for anyone but the admin.
pub async fn list_pending(ctx: &SyncContext, room_id: &str, admin: &Identity) -> Result<Vec<PendingEntry>, SyncError> {
    let room = require_admin(ctx, room_id, Some(admin)).await?;
    let mut entries: Vec<PendingEntry> = room
        .pending
        .into_iter()
        .map(|(user_id, request)| PendingEntry { user_id, request })
        .collect();
    entries.sort_by(|a, b| {
        a.request
            .requested_at
            .cmp(&b.request.requested_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    Ok(entries)
}

/// Member ids, sorted.
///
/// # Errors
///
/// `NotFound` or `AccessDenied`.
pub async fn list_members(ctx: &SyncContext, room_id: &str, user: Option<&str>) -> Result<Vec<String>, SyncError> {
    let room = require_access(ctx, room_id, user).await?;
    Ok(room
        .details
        .members
        .into_iter()
        .filter_map(|(uid, member)| member.then_some(uid))
        .collect())
}

/// The caller's own status in a room.
///
/// # Errors
///
/// `NotFound` for an unknown room.
pub async fn access_status(ctx: &SyncContext, room_id: &str, user_id: &str) -> Result<AccessStatus, SyncError> {
    let room = load_room(ctx, room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?;
    Ok(access::access_status(&room, user_id))
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
