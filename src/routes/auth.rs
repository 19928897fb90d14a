//! Identity extraction from the upstream auth proxy.
//!
//! The proxy in front of this service authenticates the user and forwards
//! who they are as `x-user-*` headers. A request without `x-user-id` is an
//! anonymous viewer; public rooms stay readable for them.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;

use crate::model::Identity;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_AVATAR: &str = "x-user-avatar";
pub const HEADER_USER_EMAIL: &str = "x-user-email";

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Read the identity headers. `None` when no user id is present.
pub(crate) fn identity_from_parts(parts: &Parts) -> Option<Identity> {
    let uid = header(parts, HEADER_USER_ID)?;
    Some(Identity {
        uid,
        display_name: header(parts, HEADER_USER_NAME),
        photo_url: header(parts, HEADER_USER_AVATAR),
        email: header(parts, HEADER_USER_EMAIL),
    })
}

// =============================================================================
// EXTRACTORS
// =============================================================================

/// Whoever is asking, possibly anonymous.
pub struct Viewer(pub Option<Identity>);

impl Viewer {
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.0.as_ref().map(|u| u.uid.as_str())
    }
}

impl<S> FromRequestParts<S> for Viewer
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(identity_from_parts(parts)))
    }
}

/// Authenticated user. Rejects anonymous requests with 401.
pub struct AuthUser(pub Identity);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_parts(parts).map(Self).ok_or(StatusCode::UNAUTHORIZED)
    }
}
