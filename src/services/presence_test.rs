use super::*;
use crate::model::Visibility;
use crate::state::test_helpers::{seed_room, test_context, user};
use crate::store::Store;
use uuid::Uuid;

fn cursor(lat: f64, lng: f64) -> CursorUpdate {
    CursorUpdate { position: LatLng::new(lat, lng), view: LatLng::new(lat, lng), zoom: 12.0 }
}

// =============================================================================
// Palette
// =============================================================================

#[test]
fn palette_is_deterministic_per_seed_room_and_user() {
    let palette = Palette::new(42);
    assert_eq!(palette.assign("r1", "u1"), palette.assign("r1", "u1"));
    let (color, glyph) = palette.assign("r1", "u1");
    assert!(COLORS.contains(&color));
    assert!(glyph < GLYPH_COUNT);
}

#[test]
fn palette_spreads_across_users() {
    let palette = Palette::new(1);
    let colors: std::collections::HashSet<&str> =
        (0..64).map(|i| palette.assign("r1", &format!("user-{i}")).0).collect();
    assert!(colors.len() > 1);
}

// =============================================================================
// join
// =============================================================================

#[tokio::test]
async fn first_join_starts_session_one_at_default_origin() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;

    let rec = join(&ctx, "r1", &user("u1")).await.unwrap();
    assert_eq!(rec.id, "u1");
    assert_eq!(rec.session, 1);
    assert!(rec.active);
    assert!(rec.broadcasting);
    assert_eq!(rec.name, "U1");
    assert_eq!((rec.lat, rec.lng), (DEFAULT_LAT, DEFAULT_LNG));
    assert_eq!(rec.zoom, DEFAULT_ZOOM);
    assert_eq!((rec.color.as_str(), rec.glyph), {
        let (c, g) = ctx.palette.assign("r1", "u1");
        (c, Some(g))
    });
}

#[tokio::test]
async fn rejoin_increments_session_and_keeps_preferences() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let u = user("u1");

    join(&ctx, "r1", &u).await.unwrap();
    update_position(&ctx, "r1", &u, cursor(10.0, 20.0)).await.unwrap();
    set_broadcast(&ctx, "r1", &u, false).await.unwrap();
    ctx.store
        .write(&paths::user("r1", "u1"), json!({"color": "#781DEC"}))
        .await
        .unwrap();
    mark_inactive(&ctx, "r1", "u1").await.unwrap();

    let rec = join(&ctx, "r1", &u).await.unwrap();
    assert_eq!(rec.session, 2);
    assert!(rec.active);
    assert!(!rec.broadcasting);
    assert_eq!(rec.color, "#781DEC");
    assert_eq!((rec.lat, rec.lng), (10.0, 20.0));
}

#[tokio::test]
async fn rejoin_at_null_island_resets_to_default_origin() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    ctx.store
        .write(&paths::user("r1", "u1"), json!({"session": 4, "lat": 0.0, "lng": 0.0, "color": "#222222"}))
        .await
        .unwrap();

    let rec = join(&ctx, "r1", &user("u1")).await.unwrap();
    assert_eq!(rec.session, 5);
    assert_eq!((rec.lat, rec.lng), (DEFAULT_LAT, DEFAULT_LNG));
}

#[tokio::test]
async fn join_private_room_requires_access() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Private, "admin").await;
    let err = join(&ctx, "r1", &user("stranger")).await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(_)));
    assert!(load(&ctx, "r1", "stranger").await.unwrap().is_none());
}

#[tokio::test]
async fn anonymous_display_name_falls_back() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let rec = join(&ctx, "r1", &Identity::new("u9")).await.unwrap();
    assert_eq!(rec.name, "Anonymous");
}

// =============================================================================
// updates
// =============================================================================

#[tokio::test]
async fn position_update_is_suppressed_while_not_broadcasting() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let u = user("u1");
    join(&ctx, "r1", &u).await.unwrap();

    assert_eq!(update_position(&ctx, "r1", &u, cursor(1.0, 2.0)).await.unwrap(), WriteStatus::Applied);
    set_broadcast(&ctx, "r1", &u, false).await.unwrap();
    assert_eq!(
        update_position(&ctx, "r1", &u, cursor(3.0, 4.0)).await.unwrap(),
        WriteStatus::Suppressed(SuppressReason::BroadcastDisabled)
    );

    let rec = load(&ctx, "r1", "u1").await.unwrap().unwrap();
    assert_eq!((rec.lat, rec.lng), (1.0, 2.0));
}

#[tokio::test]
async fn position_update_rejects_out_of_range() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let u = user("u1");
    join(&ctx, "r1", &u).await.unwrap();
    let err = update_position(&ctx, "r1", &u, cursor(91.0, 0.0)).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test]
async fn position_update_before_join_is_not_found() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let err = update_position(&ctx, "r1", &user("u1"), cursor(1.0, 1.0)).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn real_location_ignores_broadcast_flag() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let u = user("u1");
    join(&ctx, "r1", &u).await.unwrap();
    set_broadcast(&ctx, "r1", &u, false).await.unwrap();

    let loc = update_real_location(&ctx, "r1", &u, LatLng::new(51.5, -0.1)).await.unwrap();
    assert!(loc.timestamp > 0);
    let rec = load(&ctx, "r1", "u1").await.unwrap().unwrap();
    assert_eq!(rec.real_location, Some(loc));

    clear_real_location(&ctx, "r1", &u).await.unwrap();
    let rec = load(&ctx, "r1", "u1").await.unwrap().unwrap();
    assert_eq!(rec.real_location, None);
}

// =============================================================================
// disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_hook_marks_user_inactive() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let conn = Uuid::new_v4();
    join(&ctx, "r1", &user("u1")).await.unwrap();
    register_disconnect(&ctx, "r1", "u1", conn).await.unwrap();

    assert_eq!(ctx.store.disconnect(conn).await.unwrap(), 1);
    let rec = load(&ctx, "r1", "u1").await.unwrap().unwrap();
    assert!(!rec.active);
    assert_eq!(rec.session, 1);
}

#[tokio::test]
async fn cancelled_hook_does_not_fire() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    let conn = Uuid::new_v4();
    join(&ctx, "r1", &user("u1")).await.unwrap();
    register_disconnect(&ctx, "r1", "u1", conn).await.unwrap();
    cancel_disconnect(&ctx, "r1", "u1", conn).await.unwrap();

    assert_eq!(ctx.store.disconnect(conn).await.unwrap(), 0);
    assert!(load(&ctx, "r1", "u1").await.unwrap().unwrap().active);
}

#[tokio::test]
async fn mark_inactive_without_record_writes_nothing() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    mark_inactive(&ctx, "r1", "ghost").await.unwrap();
    assert!(load(&ctx, "r1", "ghost").await.unwrap().is_none());
}

// =============================================================================
// reads
// =============================================================================

#[tokio::test]
async fn list_returns_every_member_sorted() {
    let ctx = test_context();
    seed_room(&ctx, "r1", Visibility::Public, "admin").await;
    join(&ctx, "r1", &user("b")).await.unwrap();
    join(&ctx, "r1", &user("a")).await.unwrap();
    let ids: Vec<String> = list(&ctx, "r1").await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[test]
fn nearby_sorts_active_users_by_distance() {
    let at = |id: &str, lat: f64, active: bool| PresenceRecord {
        id: id.into(),
        name: id.to_uppercase(),
        active,
        real_location: Some(RealLocation { lat, lng: 0.0, timestamp: 1 }),
        ..PresenceRecord::default()
    };
    let records = vec![at("me", 0.0, true), at("far", 2.0, true), at("near", 1.0, true), at("gone", 0.5, false)];
    let out = nearby(&records, "me");
    let ids: Vec<&str> = out.iter().map(|n| n.user_id.as_str()).collect();
    assert_eq!(ids, vec!["near", "far"]);
    assert!((out[0].distance_km - 111.2).abs() < 0.02);
}

#[test]
fn nearby_without_own_location_is_empty() {
    let records = vec![PresenceRecord { id: "me".into(), ..PresenceRecord::default() }];
    assert!(nearby(&records, "me").is_empty());
}
