//! Chat service — group and private messages inside a room.
//!
//! Messages are appended under `rooms/{id}/chat`, so keys sort in send
//! order. A reply stores a snapshot of the target's body at send time;
//! later edits or deletion of the target do not change the reply. Private
//! messages are stored alongside group ones and filtered per viewer by
//! [`visible_to`] before they leave the server.

use serde_json::{Value, json};
use tracing::info;

use super::access::{DenyReason, require_writer};
use super::{SyncContext, decode, decode_children, now_ms, presence, validate_id};
use crate::error::SyncError;
use crate::model::{ChatMessage, ChatScope, Identity, ReplyRef};
use crate::store::paths;

pub const FALLBACK_COLOR: &str = "#222222";
const UNKNOWN_TARGET: &str = "Unknown";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendMessage {
    pub body: String,
    pub sticker: Option<String>,
    pub scope: ChatScope,
    pub target_user_id: Option<String>,
    pub reply_to: Option<String>,
}

/// Send a message. Returns the stored message with its id.
///
/// # Errors
///
/// `Validation` for an empty message or a private message without a
/// target, `NotFound` when replying to a vanished message.
pub async fn send(ctx: &SyncContext, room_id: &str, user: &Identity, msg: SendMessage) -> Result<ChatMessage, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    let body = msg.body.trim().to_owned();
    if body.is_empty() && msg.sticker.is_none() {
        return Err(SyncError::validation("message needs a body or a sticker"));
    }

    let (target_user_id, target_user_name) = match (msg.scope, msg.target_user_id) {
        (ChatScope::Private, Some(target)) => {
            validate_id("user", &target)?;
            let name = presence::load(ctx, room_id, &target)
                .await?
                .map(|p| p.name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| UNKNOWN_TARGET.to_owned());
            (Some(target), Some(name))
        }
        (ChatScope::Private, None) => return Err(SyncError::validation("private message needs a target")),
        (ChatScope::Group, _) => (None, None),
    };

    let reply_to = match msg.reply_to {
        Some(target_id) => {
            // A private message the sender cannot see is reported as missing.
            let target = load(ctx, room_id, &target_id)
                .await?
                .and_then(|m| visible_to(vec![m], Some(&user.uid)).pop())
                .ok_or_else(|| SyncError::NotFound(format!("message {target_id}")))?;
            Some(ReplyRef { message_id: target_id, content: target.body })
        }
        None => None,
    };

    let user_color = presence::load(ctx, room_id, &user.uid)
        .await?
        .map(|p| p.color)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| FALLBACK_COLOR.to_owned());

    let mut message = ChatMessage {
        id: String::new(),
        user_id: user.uid.clone(),
        user_name: user.name_or_anonymous(),
        user_color,
        body,
        sticker: msg.sticker,
        timestamp: now_ms(),
        scope: msg.scope,
        target_user_id,
        target_user_name,
        reply_to,
        edited: false,
    };
    let mut value = serde_json::to_value(&message).map_err(|source| SyncError::Malformed {
        path: paths::chat(room_id),
        source,
    })?;
    if let Value::Object(map) = &mut value {
        map.remove("id");
    }
    message.id = ctx.store.append(&paths::chat(room_id), value).await?;
    info!(%room_id, message_id = %message.id, user_id = %user.uid, scope = ?message.scope, "chat: sent");
    Ok(message)
}

/// Replace a message body. Sender only; id and timestamp never change.
///
/// # Errors
///
/// `NotFound`, `AccessDenied(NotOwner)`, or `Validation` for an empty body.
pub async fn edit(
    ctx: &SyncContext,
    room_id: &str,
    user: &Identity,
    message_id: &str,
    body: &str,
) -> Result<ChatMessage, SyncError> {
    require_writer(ctx, room_id, Some(user)).await?;
    let body = body.trim();
    if body.is_empty() {
        return Err(SyncError::validation("edited message must not be empty"));
    }
    let message = load(ctx, room_id, message_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
    if message.user_id != user.uid {
        return Err(SyncError::AccessDenied(DenyReason::NotOwner));
    }
    ctx.store
        .write(&paths::message(room_id, message_id), json!({ "body": body, "edited": true }))
        .await?;
    load(ctx, room_id, message_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))
}

/// Delete a message. The sender or the room admin may do this.
///
/// # Errors
///
/// `NotFound` or `AccessDenied(NotOwner)`.
pub async fn delete(ctx: &SyncContext, room_id: &str, user: &Identity, message_id: &str) -> Result<(), SyncError> {
    let (room, user) = require_writer(ctx, room_id, Some(user)).await?;
    let message = load(ctx, room_id, message_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
    if message.user_id != user.uid && room.details.admin != user.uid {
        return Err(SyncError::AccessDenied(DenyReason::NotOwner));
    }
    ctx.store.delete(&paths::message(room_id, message_id)).await?;
    info!(%room_id, %message_id, user_id = %user.uid, "chat: deleted");
    Ok(())
}

/// Load one message.
///
/// # Errors
///
/// `Validation` for a bad id, transport or decode errors.
pub async fn load(ctx: &SyncContext, room_id: &str, message_id: &str) -> Result<Option<ChatMessage>, SyncError> {
    validate_id("message", message_id)?;
    let path = paths::message(room_id, message_id);
    let Some(raw) = ctx.store.read(&path).await? else {
        return Ok(None);
    };
    let mut message: ChatMessage = decode(&path, raw)?;
    message_id.clone_into(&mut message.id);
    Ok(Some(message))
}

/// Decode a chat snapshot, ordered by timestamp then key.
#[must_use]
pub fn from_snapshot(room_id: &str, snapshot: Option<Value>) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = decode_children::<ChatMessage>(&paths::chat(room_id), snapshot)
        .into_iter()
        .map(|(key, mut message)| {
            message.id = key;
            message
        })
        .collect();
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    messages
}

/// Every message in the room, oldest first. Unfiltered.
///
/// # Errors
///
/// Returns a transport error.
pub async fn list(ctx: &SyncContext, room_id: &str) -> Result<Vec<ChatMessage>, SyncError> {
    let snapshot = ctx.store.read(&paths::chat(room_id)).await?;
    Ok(from_snapshot(room_id, snapshot))
}

/// Group messages plus private messages the viewer sent or received.
/// Anonymous viewers see group messages only.
#[must_use]
pub fn visible_to(messages: Vec<ChatMessage>, viewer: Option<&str>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|m| match m.scope {
            ChatScope::Group => true,
            ChatScope::Private => {
                viewer.is_some_and(|v| m.user_id == v || m.target_user_id.as_deref() == Some(v))
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
