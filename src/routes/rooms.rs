//! Room REST routes: create, read, and GeoJSON export.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::model::{RoomDetails, Visibility};
use crate::routes::auth::{AuthUser, Viewer};
use crate::services::access::DenyReason;
use crate::services::{export, room};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateRoomBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visibility: Option<String>,
}

#[derive(Serialize)]
pub struct CreateRoomResponse {
    pub id: String,
}

/// `POST /api/rooms` — create a room owned by the caller.
pub async fn create_room(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), StatusCode> {
    let visibility = match body.visibility.as_deref() {
        None => Visibility::Public,
        Some(raw) => Visibility::parse(raw).ok_or(StatusCode::BAD_REQUEST)?,
    };
    let new = room::NewRoom { name: body.name, description: body.description, visibility };
    let id = room::create_room(&state.sync, &user, new)
        .await
        .map_err(sync_error_to_status)?;
    Ok((StatusCode::CREATED, Json(CreateRoomResponse { id })))
}

/// `GET /api/rooms/{id}` — room details, gated.
pub async fn get_room(
    State(state): State<AppState>,
    viewer: Viewer,
    Path(room_id): Path<String>,
) -> Result<Json<RoomDetails>, StatusCode> {
    let details = room::get(&state.sync, &room_id, viewer.uid())
        .await
        .map_err(sync_error_to_status)?;
    Ok(Json(details))
}

/// `GET /api/rooms/{id}/export.geojson` — completed objects as a
/// `FeatureCollection`.
pub async fn export_geojson(
    State(state): State<AppState>,
    viewer: Viewer,
    Path(room_id): Path<String>,
) -> Result<Response, StatusCode> {
    let collection = export::export_room(&state.sync, &room_id, viewer.uid())
        .await
        .map_err(sync_error_to_status)?;
    let body = serde_json::to_string(&collection).map_err(|e| {
        warn!(%room_id, error = %e, "export: serialize failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let filename = format!("room-{room_id}.geojson");

    Ok((
        [
            (CONTENT_TYPE, "application/geo+json"),
            (CONTENT_DISPOSITION, &format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
        .into_response())
}

pub(crate) fn sync_error_to_status(err: SyncError) -> StatusCode {
    match err {
        SyncError::AccessDenied(DenyReason::Unauthenticated) => StatusCode::UNAUTHORIZED,
        SyncError::AccessDenied(DenyReason::NotFound) | SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::AccessDenied(_) => StatusCode::FORBIDDEN,
        SyncError::Validation(_) => StatusCode::BAD_REQUEST,
        SyncError::Transport(e) => {
            warn!(error = %e, "room route: store failure");
            StatusCode::SERVICE_UNAVAILABLE
        }
        SyncError::Malformed { path, source } => {
            warn!(%path, error = %source, "room route: malformed record");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
