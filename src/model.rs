//! Records stored under `rooms/{id}` and the identity handed to us by auth.
//!
//! DESIGN
//! ======
//! Every record type is `#[serde(default)]`: the store prunes nulls and a
//! disconnect hook may land on a record that was just removed, so readers
//! must tolerate partial documents instead of failing a whole snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTITY
// =============================================================================

/// Authenticated user as supplied by the upstream auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub email: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into(), display_name: None, photo_url: None, email: None }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Display name with the `Anonymous` fallback used across presence and chat.
    #[must_use]
    pub fn name_or_anonymous(&self) -> String {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("Anonymous")
            .to_owned()
    }
}

// =============================================================================
// ROOM
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

/// Stored at `rooms/{id}/details`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomDetails {
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
    pub admin: String,
    pub members: BTreeMap<String, bool>,
    pub created_at: i64,
}

impl RoomDetails {
    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.get(user_id).copied().unwrap_or(false)
    }
}

/// Stored at `rooms/{id}/pending/{user}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingRequest {
    pub name: String,
    pub avatar: Option<String>,
    pub requested_at: i64,
}

/// A room as the access gate sees it: details plus outstanding requests.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Room {
    pub id: String,
    pub details: RoomDetails,
    pub pending: BTreeMap<String, PendingRequest>,
}

// =============================================================================
// PRESENCE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RealLocation {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: i64,
}

/// Stored at `rooms/{id}/users/{user}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceRecord {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub active: bool,
    pub color: String,
    pub session: u64,
    pub name: String,
    pub avatar: Option<String>,
    pub view: [f64; 2],
    pub zoom: f64,
    pub real_location: Option<RealLocation>,
    pub broadcasting: bool,
    pub glyph: Option<u8>,
}

impl Default for PresenceRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            lat: 0.0,
            lng: 0.0,
            active: false,
            color: String::new(),
            session: 0,
            name: String::new(),
            avatar: None,
            view: [0.0, 0.0],
            zoom: 0.0,
            real_location: None,
            broadcasting: true,
            glyph: None,
        }
    }
}

// =============================================================================
// MAP OBJECTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    #[default]
    Marker,
    Line,
    Area,
    Draw,
}

impl ObjectKind {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "marker" => Some(Self::Marker),
            "line" => Some(Self::Line),
            "area" => Some(Self::Area),
            "draw" => Some(Self::Draw),
            _ => None,
        }
    }
}

/// One streamed vertex, stored at `objects/{id}/coords/{key}`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoordFragment {
    pub set: [f64; 2],
}

/// Stored at `rooms/{id}/objects/{object}`. Coordinates are `[lat, lng]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapObject {
    pub id: String,
    pub user: String,
    pub session: u64,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub color: String,
    pub name: String,
    pub desc: String,
    pub completed: bool,
    /// First vertex of a drawing gesture.
    pub init: Option<[f64; 2]>,
    /// Marker position.
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub marker_type: Option<String>,
    pub distance: f64,
    pub area: f64,
    pub path: Vec<[f64; 2]>,
    pub coords: BTreeMap<String, CoordFragment>,
}

impl MapObject {
    /// Streamed vertices in insertion order (append keys sort by time).
    #[must_use]
    pub fn ordered_coords(&self) -> Vec<[f64; 2]> {
        self.coords.values().map(|c| c.set).collect()
    }
}

// =============================================================================
// CHAT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatScope {
    #[default]
    Group,
    Private,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyRef {
    pub message_id: String,
    /// Body of the target message when the reply was written.
    pub content: String,
}

/// Stored at `rooms/{id}/chat/{message}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub body: String,
    pub sticker: Option<String>,
    pub timestamp: i64,
    pub scope: ChatScope,
    pub target_user_id: Option<String>,
    pub target_user_name: Option<String>,
    pub reply_to: Option<ReplyRef>,
    pub edited: bool,
}
