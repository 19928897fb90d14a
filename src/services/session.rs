//! Sync session — one viewer's live connection to one room.
//!
//! DESIGN
//! ======
//! `open` runs the access gate before anything is subscribed; a denied
//! viewer gets an outcome, not a session. An admitted viewer is enrolled
//! (public rooms), joined to presence, and gets a disconnect hook scoped to
//! the transport connection. The session then holds four store
//! subscriptions: room details, presence, objects, and chat.
//!
//! `next_update` turns snapshots into [`SessionUpdate`]s. A stream only
//! yields when the value it would propagate differs from the last one it
//! propagated; chat is filtered to what the viewer may see before that
//! comparison, so other users' private traffic never wakes the viewer.
//!
//! LIFECYCLE
//! =========
//! 1. `open` → initial snapshot of every stream queued
//! 2. transport pumps `next_update` and forwards `apply` commands
//! 3. `close` cancels the hook and marks the viewer inactive
//! 4. abrupt loss → transport calls `Store::disconnect(conn)` instead;
//!    the hook converges `active = false` without this session
//!
//! A details snapshot that no longer admits the viewer (removed member,
//! room made private, room deleted) yields `AccessRevoked` once and ends
//! the stream.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::access::{AccessDecision, DenyReason, can_access, can_access_details, load_room};
use super::chat::{self, SendMessage};
use super::geo::LatLng;
use super::object::{self, FinalizePatch, ObjectDraft, ObjectPatch};
use super::presence::{self, CursorUpdate, WriteStatus};
use super::{SyncContext, decode, room};
use crate::error::SyncError;
use crate::model::{ChatMessage, Identity, MapObject, PresenceRecord, RealLocation, RoomDetails};
use crate::store::{ConnectionId, Subscription, paths};

// =============================================================================
// TYPES
// =============================================================================

/// Result of trying to open a room.
pub enum OpenOutcome {
    Joined(Box<SyncSession>),
    /// Private room; the viewer's request is waiting for the admin.
    AccessPending { room_name: String },
    /// Private room; the viewer has no access and no pending request.
    AccessRequired { room_name: String },
    NotFound,
}

/// A change the viewer should render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SessionUpdate {
    Room(RoomDetails),
    Presence(Vec<PresenceRecord>),
    Objects(Vec<MapObject>),
    Chat(Vec<ChatMessage>),
    AccessRevoked(DenyReason),
}

/// Mutations the transport forwards on behalf of the viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Position(CursorUpdate),
    Location(LatLng),
    ClearLocation,
    Broadcast(bool),
    CreateObject(ObjectDraft),
    AppendCoordinate { object_id: String, point: LatLng },
    FinalizeObject { object_id: String, patch: FinalizePatch },
    UpdateObject { object_id: String, patch: ObjectPatch },
    DeleteObject { object_id: String },
    ClearCompleted,
    SendChat(SendMessage),
    EditChat { message_id: String, body: String },
    DeleteChat { message_id: String },
}

/// What a command produced, for the reply to the viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandResult {
    Write(WriteStatus),
    Location(RealLocation),
    ObjectId { id: String },
    Object(MapObject),
    Deleted { ids: Vec<String> },
    Message(ChatMessage),
    Done {},
}

#[derive(Clone, Copy)]
enum Stream {
    Room,
    Presence,
    Objects,
    Chat,
}

/// Last value propagated per stream, serialized.
#[derive(Default)]
struct Propagated {
    room: Option<String>,
    presence: Option<String>,
    objects: Option<String>,
    chat: Option<String>,
}

impl Propagated {
    fn slot(&mut self, stream: Stream) -> &mut Option<String> {
        match stream {
            Stream::Room => &mut self.room,
            Stream::Presence => &mut self.presence,
            Stream::Objects => &mut self.objects,
            Stream::Chat => &mut self.chat,
        }
    }
}

pub struct SyncSession {
    ctx: SyncContext,
    room_id: String,
    viewer: Option<Identity>,
    conn: ConnectionId,
    session: u64,
    room_sub: Subscription,
    users_sub: Subscription,
    objects_sub: Subscription,
    chat_sub: Subscription,
    last: Propagated,
    pending: VecDeque<SessionUpdate>,
    revoked: bool,
    closed: bool,
}

// =============================================================================
// OPEN
// =============================================================================

/// Open `room_id` for `viewer` on transport connection `conn`.
///
/// # Errors
///
/// Transport or decode failures. Gate denials are outcomes, not errors.
pub async fn open(
    ctx: &SyncContext,
    room_id: &str,
    viewer: Option<Identity>,
    conn: ConnectionId,
) -> Result<OpenOutcome, SyncError> {
    let room = load_room(ctx, room_id).await?;
    let viewer_id = viewer.as_ref().map(|v| v.uid.as_str());
    match can_access(room.as_ref(), viewer_id) {
        AccessDecision::Granted(_) => {}
        AccessDecision::Denied(reason) => {
            let room_name = room.map(|r| r.details.name).unwrap_or_default();
            info!(%room_id, ?viewer_id, %reason, "session: open denied");
            return Ok(match reason {
                DenyReason::NotFound => OpenOutcome::NotFound,
                DenyReason::Pending => OpenOutcome::AccessPending { room_name },
                _ => OpenOutcome::AccessRequired { room_name },
            });
        }
    }

    let mut session = 0;
    if let Some(user) = &viewer {
        room::enroll_public_member(ctx, room_id, user).await?;
        session = presence::join(ctx, room_id, user).await?.session;
        presence::register_disconnect(ctx, room_id, &user.uid, conn).await?;
    }

    let mut sync = SyncSession {
        ctx: ctx.clone(),
        room_id: room_id.to_owned(),
        viewer,
        conn,
        session,
        room_sub: ctx.store.subscribe(&paths::details(room_id)).await?,
        users_sub: ctx.store.subscribe(&paths::users(room_id)).await?,
        objects_sub: ctx.store.subscribe(&paths::objects(room_id)).await?,
        chat_sub: ctx.store.subscribe(&paths::chat(room_id)).await?,
        last: Propagated::default(),
        pending: VecDeque::new(),
        revoked: false,
        closed: false,
    };

    let initial = [
        (Stream::Room, sync.room_sub.current()),
        (Stream::Presence, sync.users_sub.current()),
        (Stream::Objects, sync.objects_sub.current()),
        (Stream::Chat, sync.chat_sub.current()),
    ];
    for (stream, snapshot) in initial {
        sync.ingest(stream, snapshot);
    }
    info!(%room_id, viewer_id = ?sync.viewer_id(), %conn, session, "session: opened");
    Ok(OpenOutcome::Joined(Box::new(sync)))
}

impl SyncSession {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn viewer_id(&self) -> Option<&str> {
        self.viewer.as_ref().map(|v| v.uid.as_str())
    }

    /// Session counter from this viewer's join; 0 for anonymous viewers.
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked
    }

    // =========================================================================
    // UPDATES
    // =========================================================================

    /// Next change for the viewer. `None` once access is revoked, the
    /// session is closed, or the store is gone.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            if self.revoked || self.closed {
                return None;
            }
            let (stream, snapshot) = tokio::select! {
                s = self.room_sub.changed() => (Stream::Room, s?),
                s = self.users_sub.changed() => (Stream::Presence, s?),
                s = self.objects_sub.changed() => (Stream::Objects, s?),
                s = self.chat_sub.changed() => (Stream::Chat, s?),
            };
            if matches!(stream, Stream::Presence) && self.reassert_active(snapshot.as_ref()).await {
                // The corrected snapshot arrives on the next change.
                continue;
            }
            self.ingest(stream, snapshot);
        }
    }

    /// A user can hold several connections to one room, and each carries its
    /// own disconnect hook. When a sibling drops and flips the shared record
    /// to inactive, this live session flips it back. Returns whether a
    /// correction was written.
    async fn reassert_active(&self, users: Option<&Value>) -> bool {
        let Some(user) = &self.viewer else {
            return false;
        };
        let own_active = users
            .and_then(|u| u.get(&user.uid))
            .and_then(|r| r.get("active"))
            .and_then(Value::as_bool);
        if own_active != Some(false) {
            return false;
        }
        match presence::mark_active(&self.ctx, &self.room_id, &user.uid).await {
            Ok(()) => {
                debug!(room_id = %self.room_id, user_id = %user.uid, conn = %self.conn, "session: presence re-asserted");
                true
            }
            Err(e) => {
                warn!(room_id = %self.room_id, user_id = %user.uid, error = %e, "session: presence re-assert failed");
                false
            }
        }
    }

    /// Turn one snapshot into at most one queued update.
    fn ingest(&mut self, stream: Stream, snapshot: Option<Value>) {
        if self.revoked {
            return;
        }
        let update = match stream {
            Stream::Room => match self.check_details(snapshot) {
                Ok(details) => SessionUpdate::Room(details),
                Err(reason) => {
                    self.revoked = true;
                    self.pending.push_back(SessionUpdate::AccessRevoked(reason));
                    info!(room_id = %self.room_id, viewer_id = ?self.viewer_id(), %reason, "session: access revoked");
                    return;
                }
            },
            Stream::Presence => SessionUpdate::Presence(presence::from_snapshot(&self.room_id, snapshot)),
            Stream::Objects => SessionUpdate::Objects(object::from_snapshot(&self.room_id, snapshot)),
            Stream::Chat => {
                let messages = chat::from_snapshot(&self.room_id, snapshot);
                SessionUpdate::Chat(chat::visible_to(messages, self.viewer_id()))
            }
        };

        let serialized = match serde_json::to_string(&update) {
            Ok(s) => s,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "session: update not serializable");
                return;
            }
        };
        let slot = self.last.slot(stream);
        if slot.as_deref() == Some(serialized.as_str()) {
            return;
        }
        *slot = Some(serialized);
        self.pending.push_back(update);
    }

    fn check_details(&self, snapshot: Option<Value>) -> Result<RoomDetails, DenyReason> {
        let Some(raw) = snapshot else {
            return Err(DenyReason::NotFound);
        };
        let details: RoomDetails = decode(&paths::details(&self.room_id), raw).map_err(|e| {
            warn!(room_id = %self.room_id, error = %e, "session: undecodable room details");
            DenyReason::NotFound
        })?;
        match can_access_details(&details, self.viewer_id()) {
            AccessDecision::Granted(_) => Ok(details),
            AccessDecision::Denied(reason) => Err(reason),
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Run one viewer command against the room.
    ///
    /// # Errors
    ///
    /// `AccessDenied(Unauthenticated)` for anonymous viewers, otherwise
    /// whatever the underlying service returns.
    pub async fn apply(&self, command: SessionCommand) -> Result<CommandResult, SyncError> {
        let Some(user) = self.viewer.as_ref() else {
            return Err(SyncError::AccessDenied(DenyReason::Unauthenticated));
        };
        let ctx = &self.ctx;
        let room_id = self.room_id.as_str();
        debug!(%room_id, user_id = %user.uid, ?command, "session: apply");

        let result = match command {
            SessionCommand::Position(update) => {
                CommandResult::Write(presence::update_position(ctx, room_id, user, update).await?)
            }
            SessionCommand::Location(point) => {
                CommandResult::Location(presence::update_real_location(ctx, room_id, user, point).await?)
            }
            SessionCommand::ClearLocation => {
                presence::clear_real_location(ctx, room_id, user).await?;
                CommandResult::Done {}
            }
            SessionCommand::Broadcast(enabled) => {
                presence::set_broadcast(ctx, room_id, user, enabled).await?;
                CommandResult::Done {}
            }
            SessionCommand::CreateObject(draft) => CommandResult::ObjectId {
                id: object::create_object(ctx, room_id, user, self.session, draft).await?,
            },
            SessionCommand::AppendCoordinate { object_id, point } => {
                object::append_coordinate(ctx, room_id, user, &object_id, point).await?;
                CommandResult::Done {}
            }
            SessionCommand::FinalizeObject { object_id, patch } => {
                CommandResult::Object(object::finalize_object(ctx, room_id, user, &object_id, patch).await?)
            }
            SessionCommand::UpdateObject { object_id, patch } => {
                CommandResult::Object(object::update_object(ctx, room_id, user, &object_id, patch).await?)
            }
            SessionCommand::DeleteObject { object_id } => {
                object::delete_object(ctx, room_id, user, &object_id).await?;
                CommandResult::Deleted { ids: vec![object_id] }
            }
            SessionCommand::ClearCompleted => CommandResult::Deleted {
                ids: object::delete_all_completed_by(ctx, room_id, user).await?,
            },
            SessionCommand::SendChat(msg) => CommandResult::Message(chat::send(ctx, room_id, user, msg).await?),
            SessionCommand::EditChat { message_id, body } => {
                CommandResult::Message(chat::edit(ctx, room_id, user, &message_id, &body).await?)
            }
            SessionCommand::DeleteChat { message_id } => {
                chat::delete(ctx, room_id, user, &message_id).await?;
                CommandResult::Done {}
            }
        };
        Ok(result)
    }

    // =========================================================================
    // CLOSE
    // =========================================================================

    /// Orderly leave: cancel the disconnect hook and mark the viewer
    /// inactive. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the store rejects either write.
    pub async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(user) = &self.viewer {
            presence::cancel_disconnect(&self.ctx, &self.room_id, &user.uid, self.conn).await?;
            presence::mark_inactive(&self.ctx, &self.room_id, &user.uid).await?;
        }
        info!(room_id = %self.room_id, viewer_id = ?self.viewer_id(), conn = %self.conn, "session: closed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
