use super::*;
use crate::state::test_helpers::{self, seed_member, seed_room, test_context};
use crate::store::Store;

fn room(visibility: Visibility, admin: &str, members: &[&str], pending: &[&str]) -> Room {
    let mut details = RoomDetails { visibility, admin: admin.into(), ..RoomDetails::default() };
    for m in members {
        details.members.insert((*m).into(), true);
    }
    let pending = pending
        .iter()
        .map(|p| ((*p).to_owned(), PendingRequest::default()))
        .collect();
    Room { id: "r1".into(), details, pending }
}

// =============================================================================
// can_access
// =============================================================================

#[test]
fn missing_room_is_not_found() {
    assert_eq!(can_access(None, Some("u1")), AccessDecision::Denied(DenyReason::NotFound));
}

#[test]
fn public_room_grants_everyone() {
    let r = room(Visibility::Public, "admin", &[], &[]);
    assert_eq!(can_access(Some(&r), Some("stranger")), AccessDecision::Granted(GrantReason::Public));
    assert_eq!(can_access(Some(&r), None), AccessDecision::Granted(GrantReason::Public));
}

#[test]
fn private_room_grants_admin_and_members_only() {
    let r = room(Visibility::Private, "admin", &["m1"], &["p1"]);
    assert_eq!(can_access(Some(&r), Some("admin")), AccessDecision::Granted(GrantReason::Admin));
    assert_eq!(can_access(Some(&r), Some("m1")), AccessDecision::Granted(GrantReason::Member));
    assert_eq!(can_access(Some(&r), Some("p1")), AccessDecision::Denied(DenyReason::Pending));
    assert_eq!(can_access(Some(&r), Some("x")), AccessDecision::Denied(DenyReason::None));
    assert_eq!(can_access(Some(&r), None), AccessDecision::Denied(DenyReason::None));
}

#[test]
fn false_membership_flag_is_not_membership() {
    let mut r = room(Visibility::Private, "admin", &[], &[]);
    r.details.members.insert("m1".into(), false);
    assert_eq!(can_access(Some(&r), Some("m1")), AccessDecision::Denied(DenyReason::None));
}

#[test]
fn private_decision_matches_membership_for_all_users() {
    let r = room(Visibility::Private, "admin", &["a", "b"], &["c"]);
    for uid in ["admin", "a", "b", "c", "d", "e"] {
        let granted = uid == "admin" || r.details.is_member(uid);
        let decision = can_access(Some(&r), Some(uid));
        assert_eq!(decision.is_granted(), granted, "user {uid}");
        if !granted {
            let expected = if r.pending.contains_key(uid) { DenyReason::Pending } else { DenyReason::None };
            assert_eq!(decision, AccessDecision::Denied(expected), "user {uid}");
        }
    }
}

#[test]
fn details_only_check_never_reports_pending() {
    let r = room(Visibility::Private, "admin", &[], &["p1"]);
    assert_eq!(can_access_details(&r.details, Some("p1")), AccessDecision::Denied(DenyReason::None));
}

// =============================================================================
// access_status
// =============================================================================

#[test]
fn access_status_prefers_pending() {
    let r = room(Visibility::Private, "admin", &["m1"], &["m1", "p1"]);
    assert_eq!(access_status(&r, "m1"), AccessStatus::Pending);
    assert_eq!(access_status(&r, "p1"), AccessStatus::Pending);
    assert_eq!(access_status(&r, "admin"), AccessStatus::Approved);
    assert_eq!(access_status(&r, "x"), AccessStatus::None);
}

// =============================================================================
// enforcement
// =============================================================================

#[tokio::test]
async fn load_room_reads_details_and_pending() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Private, "admin").await;
    ctx.store
        .write(
            &crate::store::paths::pending_request("r1", "p1"),
            serde_json::json!({"name": "P", "requested_at": 5}),
        )
        .await
        .unwrap();

    let room = load_room(&ctx, "r1").await.unwrap().unwrap();
    assert_eq!(room.id, "r1");
    assert_eq!(room.details.admin, "admin");
    assert_eq!(room.pending["p1"].requested_at, 5);
}

#[tokio::test]
async fn load_room_unknown_is_none() {
    let ctx = test_context();
    assert!(load_room(&ctx, "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn require_access_maps_denials_to_errors() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Private, "admin").await;

    let err = require_access(&ctx, "r1", Some("x")).await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(DenyReason::None)));

    let err = require_access(&ctx, "missing", Some("x")).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    seed_member(&ctx, "r1", "x").await;
    assert!(require_access(&ctx, "r1", Some("x")).await.is_ok());
}

#[tokio::test]
async fn require_writer_rejects_anonymous_on_public_room() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    assert!(require_access(&ctx, "r1", None).await.is_ok());
    let err = require_writer(&ctx, "r1", None).await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(DenyReason::Unauthenticated)));
}

#[tokio::test]
async fn require_admin_rejects_members() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Private, "admin").await;
    seed_member(&ctx, "r1", "m1").await;

    let member = test_helpers::user("m1");
    let err = require_admin(&ctx, "r1", Some(&member)).await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(DenyReason::NotAdmin)));

    let admin = test_helpers::user("admin");
    assert!(require_admin(&ctx, "r1", Some(&admin)).await.is_ok());
}
