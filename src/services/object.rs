//! Object service — markers, lines, areas, and freehand strokes.
//!
//! DESIGN
//! ======
//! Each drawing gesture owns one object for its whole lifetime, so every
//! object has a single writer: its owner. A gesture creates the object
//! incomplete, streams vertices into an append-only `coords` log so other
//! viewers see the stroke grow, then finalizes it with a path and metrics
//! computed here. Metrics a client sends are never trusted.
//!
//! Admins moderate by deletion only; they cannot edit another user's
//! content. Any operation on a vanished object fails with `NotFound`,
//! which callers treat as a benign race with a concurrent delete.

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::access::{DenyReason, require_writer};
use super::geo::{self, LatLng};
use super::{SyncContext, decode, decode_children, validate_id};
use crate::error::SyncError;
use crate::model::{Identity, MapObject, ObjectKind, Room};
use crate::store::paths;

// =============================================================================
// TYPES
// =============================================================================

/// Initial fields of a new object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectDraft {
    pub kind: ObjectKind,
    pub color: String,
    pub name: String,
    pub desc: String,
    /// First vertex of a line, area, or stroke.
    pub init: Option<LatLng>,
    /// Marker position.
    pub position: Option<LatLng>,
    pub marker_type: Option<String>,
}

/// Fields a finishing gesture may set. A missing path means "use the
/// streamed coordinates".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizePatch {
    pub name: Option<String>,
    pub desc: Option<String>,
    pub path: Option<Vec<LatLng>>,
}

/// Owner edits after completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    pub name: Option<String>,
    pub desc: Option<String>,
    pub color: Option<String>,
    pub position: Option<LatLng>,
}

impl ObjectPatch {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.desc.is_none() && self.color.is_none() && self.position.is_none()
    }
}

// =============================================================================
// CREATE / STREAM / FINALIZE
// =============================================================================

/// Start a new object. Returns its id.
///
/// # Errors
///
/// `AccessDenied` from the gate, `Validation` for bad coordinates or a
/// marker without a position.
pub async fn create_object(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    session: u64,
    draft: ObjectDraft,
) -> Result<String, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    if let Some(p) = draft.init {
        geo::validate(p)?;
    }
    if let Some(p) = draft.position {
        geo::validate(p)?;
    }
    if draft.kind == ObjectKind::Marker && draft.position.is_none() {
        return Err(SyncError::validation("marker needs a position"));
    }

    let object = MapObject {
        user: user.uid.clone(),
        session,
        kind: draft.kind,
        color: draft.color,
        name: draft.name,
        desc: draft.desc,
        completed: false,
        init: draft.init.map(LatLng::to_pair),
        lat: draft.position.map(|p| p.lat),
        lng: draft.position.map(|p| p.lng),
        marker_type: draft.marker_type,
        ..MapObject::default()
    };
    let mut value = serde_json::to_value(&object).map_err(|source| SyncError::Malformed {
        path: paths::objects(room_id),
        source,
    })?;
    if let Value::Object(map) = &mut value {
        map.remove("id");
    }
    let object_id = ctx.store.append(&paths::objects(room_id), value).await?;
    info!(%room_id, %object_id, user_id = %user.uid, kind = ?object.kind, "object: created");
    Ok(object_id)
}

/// Append one vertex to an in-progress gesture.
///
/// # Errors
///
/// `NotFound` for a vanished object, `AccessDenied(NotOwner)` for anyone
/// but the owner, `Validation` for bad coordinates.
pub async fn append_coordinate(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    object_id: &str,
    point: LatLng,
) -> Result<String, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    geo::validate(point)?;
    let object = load_owned(ctx, room_id, user, object_id).await?;
    let key = ctx
        .store
        .append(&paths::coords(room_id, &object.id), json!({ "set": point.to_pair() }))
        .await?;
    debug!(%room_id, %object_id, %key, "object: coordinate appended");
    Ok(key)
}

/// Complete a gesture: freeze the path, compute metrics, set `completed`.
/// Calling it again with the same patch yields the same object.
///
/// # Errors
///
/// `NotFound` for a vanished object, `AccessDenied(NotOwner)` for anyone
/// but the owner, `Validation` for bad coordinates.
pub async fn finalize_object(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    object_id: &str,
    patch: FinalizePatch,
) -> Result<MapObject, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    let object = load_owned(ctx, room_id, user, object_id).await?;

    let path: Vec<[f64; 2]> = match patch.path {
        Some(points) => {
            for p in &points {
                geo::validate(*p)?;
            }
            points.into_iter().map(LatLng::to_pair).collect()
        }
        None => object.ordered_coords(),
    };
    let (distance, area) = geo::metrics_for(object.kind, &path);

    let mut update = Map::new();
    update.insert("completed".into(), json!(true));
    update.insert("path".into(), json!(path));
    update.insert("distance".into(), json!(distance));
    update.insert("area".into(), json!(area));
    if let Some(name) = patch.name {
        update.insert("name".into(), json!(name));
    }
    if let Some(desc) = patch.desc {
        update.insert("desc".into(), json!(desc));
    }
    ctx.store
        .write(&paths::object(room_id, object_id), Value::Object(update))
        .await?;
    info!(%room_id, %object_id, distance, area, "object: finalized");

    load(ctx, room_id, object_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("object {object_id}")))
}

// =============================================================================
// UPDATE / DELETE
// =============================================================================

/// Owner-only partial edit: name, description, color, marker position.
///
/// # Errors
///
/// `NotFound`, `AccessDenied(NotOwner)`, or `Validation`.
pub async fn update_object(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    object_id: &str,
    patch: ObjectPatch,
) -> Result<MapObject, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    if patch.is_empty() {
        return Err(SyncError::validation("empty object patch"));
    }
    let object = load_owned(ctx, room_id, user, object_id).await?;

    let mut update = Map::new();
    if let Some(name) = patch.name {
        update.insert("name".into(), json!(name));
    }
    if let Some(desc) = patch.desc {
        update.insert("desc".into(), json!(desc));
    }
    if let Some(color) = patch.color {
        update.insert("color".into(), json!(color));
    }
    if let Some(p) = patch.position {
        if object.kind != ObjectKind::Marker {
            return Err(SyncError::validation("only markers can be repositioned"));
        }
        geo::validate(p)?;
        update.insert("lat".into(), json!(p.lat));
        update.insert("lng".into(), json!(p.lng));
    }
    ctx.store
        .write(&paths::object(room_id, object_id), Value::Object(update))
        .await?;

    load(ctx, room_id, object_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("object {object_id}")))
}

/// Delete an object. The owner or the room admin may do this.
///
/// # Errors
///
/// `NotFound` or `AccessDenied(NotOwner)`.
pub async fn delete_object(ctx: &SyncContext, room_id: &str, user: &Identity, object_id: &str) -> Result<(), SyncError> {
    let (room, user) = require_writer(ctx, room_id, Some(user)).await?;
    let object = load(ctx, room_id, object_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("object {object_id}")))?;
    if !can_delete(&room, &object, &user.uid) {
        return Err(SyncError::AccessDenied(DenyReason::NotOwner));
    }
    ctx.store.delete(&paths::object(room_id, object_id)).await?;
    info!(%room_id, %object_id, user_id = %user.uid, "object: deleted");
    Ok(())
}

/// Bulk delete of the caller's own completed objects. In-progress gestures
/// are left alone. Returns the deleted ids.
///
/// # Errors
///
/// `AccessDenied` from the gate or a transport error.
pub async fn delete_all_completed_by(ctx: &SyncContext, room_id: &str, user: &Identity) -> Result<Vec<String>, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    let mut deleted = Vec::new();
    for object in list(ctx, room_id).await? {
        if object.completed && object.user == user.uid {
            ctx.store.delete(&paths::object(room_id, &object.id)).await?;
            deleted.push(object.id);
        }
    }
    info!(%room_id, user_id = %user.uid, count = deleted.len(), "object: bulk delete");
    Ok(deleted)
}

#[must_use]
pub fn can_delete(room: &Room, object: &MapObject, user_id: &str) -> bool {
    object.user == user_id || room.details.admin == user_id
}

// =============================================================================
// READS
// =============================================================================

/// Load one object.
///
/// # Errors
///
/// `Validation` for a bad id, transport or decode errors.
pub async fn load(ctx: &SyncContext, room_id: &str, object_id: &str) -> Result<Option<MapObject>, SyncError> {
    validate_id("object", object_id)?;
    let path = paths::object(room_id, object_id);
    let Some(raw) = ctx.store.read(&path).await? else {
        return Ok(None);
    };
    let mut object: MapObject = decode(&path, raw)?;
    object_id.clone_into(&mut object.id);
    Ok(Some(object))
}

async fn load_owned(ctx: &SyncContext, room_id: &str, user: &Identity, object_id: &str) -> Result<MapObject, SyncError> {
    let object = load(ctx, room_id, object_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("object {object_id}")))?;
    if object.user != user.uid {
        return Err(SyncError::AccessDenied(DenyReason::NotOwner));
    }
    Ok(object)
}

/// Decode an objects collection snapshot in creation order.
#[must_use]
pub fn from_snapshot(room_id: &str, snapshot: Option<Value>) -> Vec<MapObject> {
    decode_children::<MapObject>(&paths::objects(room_id), snapshot)
        .into_iter()
        .map(|(key, mut object)| {
            object.id = key;
            object
        })
        .collect()
}

/// Every object in the room, in creation order.
///
/// # Errors
///
/// Returns a transport error.
pub async fn list(ctx: &SyncContext, room_id: &str) -> Result<Vec<MapObject>, SyncError> {
    let snapshot = ctx.store.read(&paths::objects(room_id)).await?;
    Ok(from_snapshot(room_id, snapshot))
}

#[cfg(test)]
#[path = "object_test.rs"]
mod tests;
