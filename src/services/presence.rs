//! Presence service — per-user cursor, viewport, and session state.
//!
//! DESIGN
//! ======
//! One record per user per room at `rooms/{room}/users/{user}`. Only the
//! owning user writes it, so every write is a plain overwrite of its own
//! fields; no merging across users is ever needed.
//!
//! Color and cursor glyph come from a seeded choice over fixed palettes,
//! keyed by (seed, room, user). They are written once on first join and
//! reused afterwards; a re-join that races a previous cleanup picks the
//! same values again instead of reshuffling.
//!
//! The disconnect hook (`active = false`) is registered with the store at
//! join time so an abrupt network loss converges without the client.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::access::require_writer;
use super::geo::{self, LatLng};
use super::{SyncContext, decode, decode_children, now_ms};
use crate::error::SyncError;
use crate::model::{Identity, PresenceRecord, RealLocation};
use crate::store::{ConnectionId, paths};

pub const COLORS: [&str; 8] = [
    "#EC1D43", "#EC811D", "#ECBE1D", "#B6EC1D", "#1DA2EC", "#781DEC", "#CF1DEC", "#222222",
];
pub const GLYPH_COUNT: u8 = 10;

pub const DEFAULT_LAT: f64 = 51.52;
pub const DEFAULT_LNG: f64 = -0.09;
pub const DEFAULT_ZOOM: f64 = 13.0;

// =============================================================================
// PALETTE
// =============================================================================

/// Deterministic color/glyph assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    seed: u64,
}

impl Palette {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Color and glyph index for `user` in `room`.
    #[must_use]
    pub fn assign(&self, room_id: &str, user_id: &str) -> (&'static str, u8) {
        let digest = Sha256::new()
            .chain_update(self.seed.to_le_bytes())
            .chain_update(room_id.as_bytes())
            .chain_update([0u8])
            .chain_update(user_id.as_bytes())
            .finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
        let color = COLORS[rng.random_range(0..COLORS.len())];
        let glyph = rng.random_range(0..GLYPH_COUNT);
        (color, glyph)
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Outcome of a write that may legitimately be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum WriteStatus {
    Applied,
    Suppressed(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The user has hidden their cursor from others.
    BroadcastDisabled,
}

/// Cursor position plus the camera the user is looking through.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorUpdate {
    pub position: LatLng,
    pub view: LatLng,
    pub zoom: f64,
}

/// Another active user's distance from the viewer's real location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Nearby {
    pub user_id: String,
    pub name: String,
    pub distance_km: f64,
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Join a room: bump the session counter and mark the user active. Color,
/// glyph, and broadcast preference survive from earlier sessions.
///
/// # Errors
///
/// Fails if the gate refuses or the store write fails.
pub async fn join(ctx: &SyncContext, room_id: &str, user: &Identity) -> Result<PresenceRecord, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    let path = paths::user(room_id, &user.uid);
    let existing = load(ctx, room_id, &user.uid).await?;

    let (color, glyph) = ctx.palette.assign(room_id, &user.uid);
    let mut patch = json!({
        "id": user.uid,
        "active": true,
        "name": user.name_or_anonymous(),
        "avatar": user.photo_url,
    });

    let session = match &existing {
        Some(rec) => {
            patch["session"] = json!(rec.session + 1);
            patch["broadcasting"] = json!(rec.broadcasting);
            patch["glyph"] = json!(rec.glyph.unwrap_or(glyph));
            if rec.color.is_empty() {
                patch["color"] = json!(color);
            }
            if rec.lat == 0.0 && rec.lng == 0.0 {
                insert_default_position(&mut patch);
            }
            rec.session + 1
        }
        None => {
            patch["session"] = json!(1);
            patch["broadcasting"] = json!(true);
            patch["glyph"] = json!(glyph);
            patch["color"] = json!(color);
            insert_default_position(&mut patch);
            1
        }
    };

    ctx.store.write(&path, patch).await?;
    info!(%room_id, user_id = %user.uid, session, "presence: joined");

    load(ctx, room_id, &user.uid)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("presence {}", user.uid)))
}

fn insert_default_position(patch: &mut serde_json::Value) {
    patch["lat"] = json!(DEFAULT_LAT);
    patch["lng"] = json!(DEFAULT_LNG);
    patch["view"] = json!([DEFAULT_LAT, DEFAULT_LNG]);
    patch["zoom"] = json!(DEFAULT_ZOOM);
}

/// Register the store-side hook that flips `active` off when `conn` drops.
///
/// # Errors
///
/// Returns a transport error if the store rejects the hook.
pub async fn register_disconnect(
    ctx: &SyncContext,
    room_id: &str,
    user_id: &str,
    conn: ConnectionId,
) -> Result<(), SyncError> {
    ctx.store
        .on_disconnect(conn, &paths::user_active(room_id, user_id), json!(false))
        .await?;
    Ok(())
}

/// Cancel the hook registered by [`register_disconnect`].
///
/// # Errors
///
/// Returns a transport error if the store rejects the cancel.
pub async fn cancel_disconnect(
    ctx: &SyncContext,
    room_id: &str,
    user_id: &str,
    conn: ConnectionId,
) -> Result<(), SyncError> {
    ctx.store
        .cancel_on_disconnect(conn, &paths::user_active(room_id, user_id))
        .await?;
    Ok(())
}

/// Mark the user inactive. Only touches an existing record.
///
/// # Errors
///
/// Returns a transport error on store failure.
pub async fn mark_inactive(ctx: &SyncContext, room_id: &str, user_id: &str) -> Result<(), SyncError> {
    if load(ctx, room_id, user_id).await?.is_none() {
        return Ok(());
    }
    ctx.store
        .write(&paths::user(room_id, user_id), json!({ "active": false }))
        .await?;
    debug!(%room_id, %user_id, "presence: marked inactive");
    Ok(())
}

/// Mark the user active again. Used by a surviving connection after a
/// sibling connection of the same user dropped.
///
/// # Errors
///
/// Returns a transport error on store failure.
pub async fn mark_active(ctx: &SyncContext, room_id: &str, user_id: &str) -> Result<(), SyncError> {
    ctx.store
        .write(&paths::user(room_id, user_id), json!({ "active": true }))
        .await?;
    debug!(%room_id, %user_id, "presence: marked active");
    Ok(())
}

// =============================================================================
// UPDATES
// =============================================================================

/// Publish the user's cursor and viewport. Skipped, with an explicit status,
/// while the user has broadcasting turned off.
///
/// # Errors
///
/// `AccessDenied` from the gate, `NotFound` if the user never joined,
/// `Validation` for out-of-range coordinates.
pub async fn update_position(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    update: CursorUpdate,
) -> Result<WriteStatus, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    geo::validate(update.position)?;
    geo::validate(update.view)?;
    if !update.zoom.is_finite() || update.zoom < 0.0 {
        return Err(SyncError::validation(format!("invalid zoom: {}", update.zoom)));
    }

    let record = load(ctx, room_id, &user.uid)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("presence {}", user.uid)))?;
    if !record.broadcasting {
        return Ok(WriteStatus::Suppressed(SuppressReason::BroadcastDisabled));
    }

    ctx.store
        .write(
            &paths::user(room_id, &user.uid),
            json!({
                "lat": update.position.lat,
                "lng": update.position.lng,
                "view": [update.view.lat, update.view.lng],
                "zoom": update.zoom,
            }),
        )
        .await?;
    Ok(WriteStatus::Applied)
}

/// Record the user's real-world location with the server's clock. Not
/// affected by the broadcast flag; location sharing has its own switch on
/// the client.
///
/// # Errors
///
/// `AccessDenied` from the gate, `NotFound` if the user never joined,
/// `Validation` for out-of-range coordinates.
pub async fn update_real_location(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    position: LatLng,
) -> Result<RealLocation, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    geo::validate(position)?;
    if load(ctx, room_id, &user.uid).await?.is_none() {
        return Err(SyncError::NotFound(format!("presence {}", user.uid)));
    }
    let location = RealLocation { lat: position.lat, lng: position.lng, timestamp: now_ms() };
    ctx.store
        .write(&paths::user(room_id, &user.uid), json!({ "real_location": location }))
        .await?;
    Ok(location)
}

/// Drop the real-world location when the user stops sharing it.
///
/// # Errors
///
/// `AccessDenied` from the gate or a transport error.
pub async fn clear_real_location(ctx: &SyncContext, room_id: &str, user: &Identity) -> Result<(), SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    ctx.store
        .delete(&format!("{}/real_location", paths::user(room_id, &user.uid)))
        .await?;
    Ok(())
}

/// Show or hide the user's cursor to others. Receiving other cursors is
/// unaffected.
///
/// # Errors
///
/// `AccessDenied` from the gate, `NotFound` if the user never joined.
pub async fn set_broadcast(ctx: &SyncContext, room_id: &str, user: &Identity, enabled: bool) -> Result<(), SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    if load(ctx, room_id, &user.uid).await?.is_none() {
        return Err(SyncError::NotFound(format!("presence {}", user.uid)));
    }
    ctx.store
        .write(&paths::user(room_id, &user.uid), json!({ "broadcasting": enabled }))
        .await?;
    info!(%room_id, user_id = %user.uid, enabled, "presence: broadcast toggled");
    Ok(())
}

// =============================================================================
// READS
// =============================================================================

/// Load one presence record.
///
/// # Errors
///
/// Returns a transport or decode error.
pub async fn load(ctx: &SyncContext, room_id: &str, user_id: &str) -> Result<Option<PresenceRecord>, SyncError> {
    let path = paths::user(room_id, user_id);
    let Some(raw) = ctx.store.read(&path).await? else {
        return Ok(None);
    };
    let mut record: PresenceRecord = decode(&path, raw)?;
    user_id.clone_into(&mut record.id);
    Ok(Some(record))
}

/// Decode a presence collection snapshot, sorted by user id.
#[must_use]
pub fn from_snapshot(room_id: &str, snapshot: Option<serde_json::Value>) -> Vec<PresenceRecord> {
    decode_children::<PresenceRecord>(&paths::users(room_id), snapshot)
        .into_iter()
        .map(|(key, mut record)| {
            record.id = key;
            record
        })
        .collect()
}

/// All presence records in a room.
///
/// # Errors
///
/// Returns a transport error.
pub async fn list(ctx: &SyncContext, room_id: &str) -> Result<Vec<PresenceRecord>, SyncError> {
    let snapshot = ctx.store.read(&paths::users(room_id)).await?;
    Ok(from_snapshot(room_id, snapshot))
}

/// Active users sharing a real location, nearest first, measured from the
/// viewer's own real location.
#[must_use]
pub fn nearby(records: &[PresenceRecord], viewer_id: &str) -> Vec<Nearby> {
    let Some(origin) = records
        .iter()
        .find(|r| r.id == viewer_id)
        .and_then(|r| r.real_location)
    else {
        return Vec::new();
    };
    let origin = LatLng::new(origin.lat, origin.lng);
    let mut out: Vec<Nearby> = records
        .iter()
        .filter(|r| r.id != viewer_id && r.active)
        .filter_map(|r| {
            let loc = r.real_location?;
            Some(Nearby {
                user_id: r.id.clone(),
                name: r.name.clone(),
                distance_km: geo::round2(geo::haversine_km(origin, LatLng::new(loc.lat, loc.lng))),
            })
        })
        .collect();
    out.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    out
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
