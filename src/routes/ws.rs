//! WebSocket handler — frame dispatch plus live room sync.
//!
//! DESIGN
//! ======
//! On upgrade the socket is split. A writer task drains a bounded per-
//! connection channel into the sink; the reader loop `select!`s over
//! inbound client frames and the open room session's updates, and queues
//! everything outbound on that channel.
//!
//! Handler functions validate frame data, call into the services, and
//! return an `Outcome`. The dispatch layer turns that into reply frames.
//! Store changes are pushed as `sync:*` request frames.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with the connection id
//! 2. `room:open` → gate → session opened (or pending/required status)
//! 3. Session updates → `sync:room|presence|objects|chat|revoked`
//! 4. `room:leave` or a clean Close → `SyncSession::close`
//! 5. Always on exit → `Store::disconnect(conn)` fires any hook left, so an
//!    abrupt loss still marks the viewer inactive

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::frame::{Data, Frame, Status};
use crate::model::{ChatScope, Identity, ObjectKind, Visibility};
use crate::routes::auth::Viewer;
use crate::services::access::DenyReason;
use crate::services::chat::SendMessage;
use crate::services::geo::LatLng;
use crate::services::object::{FinalizePatch, ObjectDraft, ObjectPatch};
use crate::services::presence::{self, CursorUpdate};
use crate::services::session::{self, CommandResult, OpenOutcome, SessionCommand, SessionUpdate, SyncSession};
use crate::services::room;
use crate::state::AppState;
use crate::store::ConnectionId;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer decides which
/// frames go back to the sender.
enum Outcome {
    /// One item frame carrying data, then done.
    Reply(Data),
    /// Empty done.
    Done,
}

/// Per-connection state owned by the reader loop.
pub(crate) struct Connection {
    conn: ConnectionId,
    viewer: Option<Identity>,
    session: Option<Box<SyncSession>>,
}

impl Connection {
    pub(crate) fn new(conn: ConnectionId, viewer: Option<Identity>) -> Self {
        Self { conn, viewer, session: None }
    }

    fn viewer_id(&self) -> Option<&str> {
        self.viewer.as_ref().map(|v| v.uid.as_str())
    }

    /// Close the open session, if any.
    async fn leave(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(conn = %self.conn, room_id = %session.room_id(), error = %e, "ws: session close failed");
            }
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, viewer: Viewer, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state, viewer.0))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState, viewer: Option<Identity>) {
    let conn = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);

    let mut welcome = Frame::request("session:connected", Data::new()).with_data("conn_id", conn.to_string());
    if let Some(user) = &viewer {
        welcome = welcome.with_data("user_id", user.uid.clone());
    }
    if send_frame(&mut sink, &welcome).await.is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = Connection::new(conn, viewer);
    info!(%conn, viewer_id = ?connection.viewer_id(), "ws: client connected");

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut connection, &text).await;
                        if !enqueue(&client_tx, replies).await {
                            break;
                        }
                    }
                    Message::Close(_) => {
                        connection.leave().await;
                        break;
                    }
                    _ => {}
                }
            }
            update = next_session_update(&mut connection.session) => {
                match update {
                    Some(update) => {
                        let Some(room_id) = connection.session.as_ref().map(|s| s.room_id().to_owned()) else {
                            continue;
                        };
                        if !enqueue(&client_tx, vec![sync_frame(&room_id, update)]).await {
                            break;
                        }
                    }
                    None => connection.leave().await,
                }
            }
        }
    }

    match state.sync.store.disconnect(conn).await {
        Ok(fired) => info!(%conn, fired, "ws: client disconnected"),
        Err(e) => warn!(%conn, error = %e, "ws: disconnect hooks failed"),
    }
    drop(connection);
    drop(client_tx);
    let _ = writer.await;
}

/// The open session's next update; pends forever when no room is open.
async fn next_session_update(session: &mut Option<Box<SyncSession>>) -> Option<SessionUpdate> {
    match session {
        Some(session) => session.next_update().await,
        None => std::future::pending().await,
    }
}

async fn enqueue(client_tx: &mpsc::Sender<Frame>, frames: Vec<Frame>) -> bool {
    for frame in frames {
        if client_tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

/// Server push for one session update.
pub(crate) fn sync_frame(room_id: &str, update: SessionUpdate) -> Frame {
    let (syscall, key, value) = match update {
        SessionUpdate::Room(details) => ("sync:room", "details", to_value(&details)),
        SessionUpdate::Presence(users) => ("sync:presence", "users", to_value(&users)),
        SessionUpdate::Objects(objects) => ("sync:objects", "objects", to_value(&objects)),
        SessionUpdate::Chat(messages) => ("sync:chat", "messages", to_value(&messages)),
        SessionUpdate::AccessRevoked(reason) => ("sync:revoked", "reason", to_value(&reason)),
    };
    Frame::request(syscall, Data::new()).with_room_id(room_id).with_data(key, value)
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
pub(crate) async fn process_inbound_text(state: &AppState, connection: &mut Connection, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(conn = %connection.conn, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Identity comes from the upgrade, never from the client.
    req.from = connection.viewer_id().map(str::to_owned);

    if req.syscall == "presence:position" {
        debug!(conn = %connection.conn, id = %req.id, "ws: recv position");
    } else {
        info!(conn = %connection.conn, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");
    }

    let result = match req.prefix() {
        "room" => handle_room(state, connection, &req).await,
        "presence" => handle_presence(state, connection, &req).await,
        "object" => handle_object(connection, &req).await,
        "chat" => handle_chat(connection, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.item(data), req.done()],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(state: &AppState, connection: &mut Connection, req: &Frame) -> Result<Outcome, Frame> {
    let ctx = &state.sync;
    match req.op() {
        "open" => {
            let room_id = target_room(connection, req)?;
            connection.leave().await;
            let outcome = session::open(ctx, &room_id, connection.viewer.clone(), connection.conn)
                .await
                .map_err(|e| req.error_from(&e))?;
            let mut data = Data::new();
            data.insert("room_id".into(), Value::String(room_id.clone()));
            match outcome {
                OpenOutcome::Joined(session) => {
                    data.insert("status".into(), "joined".into());
                    data.insert("session".into(), session.session().into());
                    connection.session = Some(session);
                }
                OpenOutcome::AccessPending { room_name } => {
                    data.insert("status".into(), "pending".into());
                    data.insert("room_name".into(), room_name.into());
                }
                OpenOutcome::AccessRequired { room_name } => {
                    data.insert("status".into(), "required".into());
                    data.insert("room_name".into(), room_name.into());
                }
                OpenOutcome::NotFound => return Err(req.error_from(&SyncError::NotFound(format!("room {room_id}")))),
            }
            Ok(Outcome::Reply(data))
        }
        "leave" => {
            connection.leave().await;
            Ok(Outcome::Done)
        }
        "create" => {
            let user = require_viewer(connection, req)?;
            let new = room::NewRoom {
                name: required(req, "name")?,
                description: optional(req, "description")?.unwrap_or_default(),
                visibility: optional::<Visibility>(req, "visibility")?.unwrap_or_default(),
            };
            let id = room::create_room(ctx, user, new).await.map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("id", id)))
        }
        "update" => {
            let room_id = target_room(connection, req)?;
            let user = require_viewer(connection, req)?;
            let settings = room::RoomSettings {
                name: optional(req, "name")?,
                description: optional(req, "description")?,
                visibility: optional(req, "visibility")?,
            };
            let details = room::update_room_settings(ctx, &room_id, user, settings)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("details", to_value(&details))))
        }
        "request_access" => {
            let room_id = target_room(connection, req)?;
            let user = require_viewer(connection, req)?;
            let status = room::request_access(ctx, &room_id, user)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("status", to_value(&status))))
        }
        "approve" | "reject" | "remove_member" => {
            let room_id = target_room(connection, req)?;
            let admin = require_viewer(connection, req)?;
            let user_id: String = required(req, "user_id")?;
            let result = match req.op() {
                "approve" => room::approve_access(ctx, &room_id, admin, &user_id).await,
                "reject" => room::reject_access(ctx, &room_id, admin, &user_id).await,
                _ => room::remove_member(ctx, &room_id, admin, &user_id).await,
            };
            result.map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Done)
        }
        "pending" => {
            let room_id = target_room(connection, req)?;
            let admin = require_viewer(connection, req)?;
            let pending = room::list_pending(ctx, &room_id, admin)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("pending", to_value(&pending))))
        }
        "members" => {
            let room_id = target_room(connection, req)?;
            let members = room::list_members(ctx, &room_id, connection.viewer_id())
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("members", to_value(&members))))
        }
        "status" => {
            let room_id = target_room(connection, req)?;
            let user = require_viewer(connection, req)?;
            let status = room::access_status(ctx, &room_id, &user.uid)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("status", to_value(&status))))
        }
        op => Err(req.error(format!("unknown room op: {op}"))),
    }
}

// =============================================================================
// PRESENCE HANDLERS
// =============================================================================

async fn handle_presence(state: &AppState, connection: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "position" => {
            let position = point(req, "lat", "lng")?;
            let view = optional::<[f64; 2]>(req, "view")?.map_or(position, LatLng::from_pair);
            let zoom = optional(req, "zoom")?.unwrap_or(presence::DEFAULT_ZOOM);
            apply(connection, req, SessionCommand::Position(CursorUpdate { position, view, zoom })).await
        }
        "location" => {
            let location = point(req, "lat", "lng")?;
            apply(connection, req, SessionCommand::Location(location)).await
        }
        "clear_location" => apply(connection, req, SessionCommand::ClearLocation).await,
        "broadcast" => {
            let enabled = required(req, "enabled")?;
            apply(connection, req, SessionCommand::Broadcast(enabled)).await
        }
        "nearby" => {
            let session = open_session(connection, req)?;
            let viewer_id = connection.viewer_id().ok_or_else(|| unauthenticated(req))?;
            let records = presence::list(&state.sync, session.room_id())
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(single("users", to_value(&presence::nearby(&records, viewer_id)))))
        }
        op => Err(req.error(format!("unknown presence op: {op}"))),
    }
}

// =============================================================================
// OBJECT HANDLERS
// =============================================================================

async fn handle_object(connection: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let command = match req.op() {
        "create" => {
            let position = match (optional::<f64>(req, "lat")?, optional::<f64>(req, "lng")?) {
                (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
                _ => None,
            };
            SessionCommand::CreateObject(ObjectDraft {
                kind: optional::<ObjectKind>(req, "type")?.unwrap_or_default(),
                color: optional(req, "color")?.unwrap_or_default(),
                name: optional(req, "name")?.unwrap_or_default(),
                desc: optional(req, "desc")?.unwrap_or_default(),
                init: optional::<[f64; 2]>(req, "init")?.map(LatLng::from_pair),
                position,
                marker_type: optional(req, "marker_type")?,
            })
        }
        "append" => SessionCommand::AppendCoordinate { object_id: required(req, "id")?, point: point(req, "lat", "lng")? },
        "finalize" => SessionCommand::FinalizeObject {
            object_id: required(req, "id")?,
            patch: FinalizePatch {
                name: optional(req, "name")?,
                desc: optional(req, "desc")?,
                path: optional::<Vec<[f64; 2]>>(req, "path")?.map(|p| p.into_iter().map(LatLng::from_pair).collect()),
            },
        },
        "update" => {
            let position = match (optional::<f64>(req, "lat")?, optional::<f64>(req, "lng")?) {
                (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
                _ => None,
            };
            SessionCommand::UpdateObject {
                object_id: required(req, "id")?,
                patch: ObjectPatch {
                    name: optional(req, "name")?,
                    desc: optional(req, "desc")?,
                    color: optional(req, "color")?,
                    position,
                },
            }
        }
        "delete" => SessionCommand::DeleteObject { object_id: required(req, "id")? },
        "clear" => SessionCommand::ClearCompleted,
        op => return Err(req.error(format!("unknown object op: {op}"))),
    };
    apply(connection, req, command).await
}

// =============================================================================
// CHAT HANDLERS
// =============================================================================

async fn handle_chat(connection: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    let command = match req.op() {
        "send" => SessionCommand::SendChat(SendMessage {
            body: optional(req, "body")?.unwrap_or_default(),
            sticker: optional(req, "sticker")?,
            scope: optional::<ChatScope>(req, "scope")?.unwrap_or_default(),
            target_user_id: optional(req, "target_user_id")?,
            reply_to: optional(req, "reply_to")?,
        }),
        "edit" => SessionCommand::EditChat { message_id: required(req, "id")?, body: required(req, "body")? },
        "delete" => SessionCommand::DeleteChat { message_id: required(req, "id")? },
        op => return Err(req.error(format!("unknown chat op: {op}"))),
    };
    apply(connection, req, command).await
}

// =============================================================================
// HELPERS
// =============================================================================

/// Forward a command to the open session.
async fn apply(connection: &Connection, req: &Frame, command: SessionCommand) -> Result<Outcome, Frame> {
    let session = open_session(connection, req)?;
    match session.apply(command).await {
        Ok(CommandResult::Done {}) => Ok(Outcome::Done),
        Ok(result) => Ok(Outcome::Reply(to_data(&result))),
        Err(e) => Err(req.error_from(&e)),
    }
}

fn open_session<'a>(connection: &'a Connection, req: &Frame) -> Result<&'a SyncSession, Frame> {
    connection.session.as_deref().ok_or_else(|| req.error("must open a room first"))
}

fn unauthenticated(req: &Frame) -> Frame {
    req.error_from(&SyncError::AccessDenied(DenyReason::Unauthenticated))
}

fn require_viewer<'a>(connection: &'a Connection, req: &Frame) -> Result<&'a Identity, Frame> {
    connection.viewer.as_ref().ok_or_else(|| unauthenticated(req))
}

/// Room named by the frame, its data, or the open session.
fn target_room(connection: &Connection, req: &Frame) -> Result<String, Frame> {
    if let Some(room_id) = &req.room_id {
        return Ok(room_id.clone());
    }
    if let Some(room_id) = optional::<String>(req, "room_id")? {
        return Ok(room_id);
    }
    connection
        .session
        .as_ref()
        .map(|s| s.room_id().to_owned())
        .ok_or_else(|| req.error_from(&SyncError::validation("room_id required")))
}

/// Typed field from frame data. Missing or null is `None`; a value of the
/// wrong shape is a validation error.
fn optional<T: DeserializeOwned>(req: &Frame, key: &str) -> Result<Option<T>, Frame> {
    match req.data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| req.error_from(&SyncError::validation(format!("invalid {key}: {e}")))),
    }
}

fn required<T: DeserializeOwned>(req: &Frame, key: &str) -> Result<T, Frame> {
    optional(req, key)?.ok_or_else(|| req.error_from(&SyncError::validation(format!("{key} required"))))
}

fn point(req: &Frame, lat_key: &str, lng_key: &str) -> Result<LatLng, Frame> {
    Ok(LatLng::new(required(req, lat_key)?, required(req, lng_key)?))
}

fn to_value(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(error = %e, "ws: failed to serialize payload");
        Value::Null
    })
}

fn to_data(value: &impl Serialize) -> Data {
    match to_value(value) {
        Value::Object(map) => map.into_iter().collect(),
        other => single("value", other),
    }
}

fn single(key: &str, value: impl Into<Value>) -> Data {
    let mut data = Data::new();
    data.insert(key.to_owned(), value.into());
    data
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if frame.syscall.starts_with("sync:") || frame.syscall == "presence:position" {
        debug!(id = %frame.id, syscall = %frame.syscall, "ws: send frame");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
