//! GeoJSON export of a room's finished objects.
//!
//! Stored coordinates are `[lat, lng]`; GeoJSON positions are `[lng, lat]`.
//! Objects still being drawn are left out.

use serde_json::{Value, json};

use super::access::require_access;
use super::{SyncContext, object};
use crate::error::SyncError;
use crate::model::{MapObject, ObjectKind};

/// `FeatureCollection` of every completed object, in creation order.
#[must_use]
pub fn feature_collection(objects: &[MapObject]) -> Value {
    let features: Vec<Value> = objects.iter().filter(|o| o.completed).filter_map(feature).collect();
    json!({ "type": "FeatureCollection", "features": features })
}

/// One feature, or `None` when the object has no usable geometry.
#[must_use]
pub fn feature(object: &MapObject) -> Option<Value> {
    let geometry = geometry(object)?;
    Some(json!({
        "type": "Feature",
        "id": object.id,
        "geometry": geometry,
        "properties": {
            "name": object.name,
            "desc": object.desc,
            "type": object.kind,
            "color": object.color,
            "user": object.user,
            "marker_type": object.marker_type,
            "distance_km": object.distance,
            "area_km2": object.area,
        },
    }))
}

fn position(p: [f64; 2]) -> Value {
    json!([p[1], p[0]])
}

fn geometry(object: &MapObject) -> Option<Value> {
    match object.kind {
        ObjectKind::Marker => {
            let (lat, lng) = (object.lat?, object.lng?);
            Some(json!({ "type": "Point", "coordinates": [lng, lat] }))
        }
        ObjectKind::Line | ObjectKind::Draw => {
            if object.path.len() < 2 {
                return None;
            }
            let coords: Vec<Value> = object.path.iter().copied().map(position).collect();
            Some(json!({ "type": "LineString", "coordinates": coords }))
        }
        ObjectKind::Area => {
            if object.path.len() < 3 {
                return None;
            }
            let mut ring: Vec<Value> = object.path.iter().copied().map(position).collect();
            if object.path.first() != object.path.last() {
                ring.push(position(object.path[0]));
            }
            Some(json!({ "type": "Polygon", "coordinates": [ring] }))
        }
    }
}

/// Export a room for anyone the gate admits.
///
/// # Errors
///
/// `NotFound` or `AccessDenied`.
pub async fn export_room(ctx: &SyncContext, room_id: &str, user: Option<&str>) -> Result<Value, SyncError> {
    require_access(ctx, room_id, user).await?;
    let objects = object::list(ctx, room_id).await?;
    Ok(feature_collection(&objects))
}
