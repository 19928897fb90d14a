//! Store layout for rooms and everything that lives inside them.

pub const ROOMS: &str = "rooms";

#[must_use]
pub fn room(room_id: &str) -> String {
    format!("{ROOMS}/{room_id}")
}

#[must_use]
pub fn details(room_id: &str) -> String {
    format!("{ROOMS}/{room_id}/details")
}

#[must_use]
pub fn pending(room_id: &str) -> String {
    format!("{ROOMS}/{room_id}/pending")
}

#[must_use]
pub fn pending_request(room_id: &str, user_id: &str) -> String {
    format!("{ROOMS}/{room_id}/pending/{user_id}")
}

#[must_use]
pub fn users(room_id: &str) -> String {
    format!("{ROOMS}/{room_id}/users")
}

#[must_use]
pub fn user(room_id: &str, user_id: &str) -> String {
    format!("{ROOMS}/{room_id}/users/{user_id}")
}

#[must_use]
pub fn user_active(room_id: &str, user_id: &str) -> String {
    format!("{ROOMS}/{room_id}/users/{user_id}/active")
}

#[must_use]
pub fn objects(room_id: &str) -> String {
    format!("{ROOMS}/{room_id}/objects")
}

#[must_use]
pub fn object(room_id: &str, object_id: &str) -> String {
    format!("{ROOMS}/{room_id}/objects/{object_id}")
}

#[must_use]
pub fn coords(room_id: &str, object_id: &str) -> String {
    format!("{ROOMS}/{room_id}/objects/{object_id}/coords")
}

#[must_use]
pub fn chat(room_id: &str) -> String {
    format!("{ROOMS}/{room_id}/chat")
}

#[must_use]
pub fn message(room_id: &str, message_id: &str) -> String {
    format!("{ROOMS}/{room_id}/chat/{message_id}")
}
