use super::*;
use crate::frame::{FRAME_CODE, FRAME_MESSAGE};
use crate::state::test_helpers::{test_app_state, user};
use serde_json::json;
use tokio::time::{Duration, timeout};

fn request_text(syscall: &str, room_id: Option<&str>, data: Value) -> String {
    let data: Data = match data {
        Value::Object(map) => map.into_iter().collect(),
        _ => Data::new(),
    };
    let mut req = Frame::request(syscall, data);
    if let Some(room_id) = room_id {
        req = req.with_room_id(room_id);
    }
    serde_json::to_string(&req).expect("serialize request")
}

async fn send(state: &AppState, connection: &mut Connection, syscall: &str, room_id: Option<&str>, data: Value) -> Vec<Frame> {
    process_inbound_text(state, connection, &request_text(syscall, room_id, data)).await
}

fn error_code(frame: &Frame) -> Option<&str> {
    frame.data.get(FRAME_CODE).and_then(|v| v.as_str())
}

fn connect(uid: Option<&str>) -> Connection {
    Connection::new(Uuid::new_v4(), uid.map(user))
}

async fn create_room(state: &AppState, connection: &mut Connection, visibility: &str) -> String {
    let replies = send(state, connection, "room:create", None, json!({"name": "Survey", "visibility": visibility})).await;
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].status, Status::Item);
    assert_eq!(replies[1].status, Status::Done);
    replies[0].data["id"].as_str().expect("room id").to_owned()
}

async fn open_status(state: &AppState, connection: &mut Connection, room_id: &str) -> String {
    let replies = send(state, connection, "room:open", Some(room_id), json!({})).await;
    assert_eq!(replies[0].status, Status::Item, "open failed: {:?}", replies[0].data);
    replies[0].data["status"].as_str().expect("status").to_owned()
}

/// Drain session updates until one satisfies `pred`.
async fn wait_for_update(connection: &mut Connection, pred: impl Fn(&SessionUpdate) -> bool) -> SessionUpdate {
    timeout(Duration::from_millis(500), async {
        loop {
            let update = next_session_update(&mut connection.session).await.expect("stream ended");
            if pred(&update) {
                return update;
            }
        }
    })
    .await
    .expect("update timed out")
}

#[tokio::test]
async fn invalid_json_returns_gateway_error() {
    let state = test_app_state();
    let mut connection = connect(Some("ann"));
    let replies = process_inbound_text(&state, &mut connection, "{not json").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].syscall, "gateway:error");
}

#[tokio::test]
async fn unknown_prefix_and_op_return_errors() {
    let state = test_app_state();
    let mut connection = connect(Some("ann"));

    let replies = send(&state, &mut connection, "board:join", None, json!({})).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].data.get(FRAME_MESSAGE).and_then(|v| v.as_str()), Some("unknown prefix: board"));

    let replies = send(&state, &mut connection, "room:explode", None, json!({})).await;
    assert_eq!(replies[0].status, Status::Error);
}

#[tokio::test]
async fn object_ops_require_open_room() {
    let state = test_app_state();
    let mut connection = connect(Some("ann"));
    let replies = send(&state, &mut connection, "object:create", None, json!({"type": "line"})).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].data.get(FRAME_MESSAGE).and_then(|v| v.as_str()), Some("must open a room first"));
}

#[tokio::test]
async fn open_unknown_room_is_not_found() {
    let state = test_app_state();
    let mut connection = connect(Some("ann"));
    let replies = send(&state, &mut connection, "room:open", Some("missing"), json!({})).await;
    assert_eq!(error_code(&replies[0]), Some("E_NOT_FOUND"));
}

#[tokio::test]
async fn anonymous_cannot_create_rooms() {
    let state = test_app_state();
    let mut connection = connect(None);
    let replies = send(&state, &mut connection, "room:create", None, json!({"name": "x"})).await;
    assert_eq!(error_code(&replies[0]), Some("E_ACCESS_DENIED"));
}

#[tokio::test]
async fn malformed_field_is_validation_error() {
    let state = test_app_state();
    let mut ann = connect(Some("ann"));
    let room_id = create_room(&state, &mut ann, "public").await;
    assert_eq!(open_status(&state, &mut ann, &room_id).await, "joined");

    let replies = send(&state, &mut ann, "presence:position", None, json!({"lat": "north", "lng": 0.0})).await;
    assert_eq!(error_code(&replies[0]), Some("E_VALIDATION"));
}

#[tokio::test]
async fn created_marker_reaches_object_stream() {
    let state = test_app_state();
    let mut ann = connect(Some("ann"));
    let room_id = create_room(&state, &mut ann, "public").await;
    assert_eq!(open_status(&state, &mut ann, &room_id).await, "joined");

    let replies = send(&state, &mut ann, "object:create", None, json!({"type": "marker", "lat": 51.5, "lng": -0.1, "name": "Pub"})).await;
    assert_eq!(replies[0].status, Status::Item);
    let object_id = replies[0].data["id"].as_str().expect("object id").to_owned();

    let update = wait_for_update(&mut ann, |u| matches!(u, SessionUpdate::Objects(objs) if !objs.is_empty())).await;
    let frame = sync_frame(&room_id, update);
    assert_eq!(frame.syscall, "sync:objects");
    assert_eq!(frame.room_id.as_deref(), Some(room_id.as_str()));
    assert_eq!(frame.data["objects"][0]["id"], json!(object_id));
    assert_eq!(frame.data["objects"][0]["name"], json!("Pub"));
}

#[tokio::test]
async fn private_room_request_and_approve_flow() {
    let state = test_app_state();
    let mut ann = connect(Some("ann"));
    let mut bob = connect(Some("bob"));
    let room_id = create_room(&state, &mut ann, "private").await;

    assert_eq!(open_status(&state, &mut bob, &room_id).await, "required");
    let replies = send(&state, &mut bob, "room:request_access", Some(&room_id), json!({})).await;
    assert_eq!(replies[0].data["status"], json!("pending"));
    assert_eq!(open_status(&state, &mut bob, &room_id).await, "pending");

    let replies = send(&state, &mut bob, "room:approve", Some(&room_id), json!({"user_id": "bob"})).await;
    assert_eq!(error_code(&replies[0]), Some("E_ACCESS_DENIED"));

    let replies = send(&state, &mut ann, "room:pending", Some(&room_id), json!({})).await;
    assert_eq!(replies[0].data["pending"][0]["user_id"], json!("bob"));
    let replies = send(&state, &mut ann, "room:approve", Some(&room_id), json!({"user_id": "bob"})).await;
    assert_eq!(replies[0].status, Status::Done);

    assert_eq!(open_status(&state, &mut bob, &room_id).await, "joined");
}

#[tokio::test]
async fn removed_member_receives_revocation() {
    let state = test_app_state();
    let mut ann = connect(Some("ann"));
    let mut bob = connect(Some("bob"));
    let room_id = create_room(&state, &mut ann, "private").await;
    send(&state, &mut bob, "room:request_access", Some(&room_id), json!({})).await;
    send(&state, &mut ann, "room:approve", Some(&room_id), json!({"user_id": "bob"})).await;
    assert_eq!(open_status(&state, &mut bob, &room_id).await, "joined");

    let replies = send(&state, &mut ann, "room:remove_member", Some(&room_id), json!({"user_id": "bob"})).await;
    assert_eq!(replies[0].status, Status::Done);

    let update = wait_for_update(&mut bob, |u| matches!(u, SessionUpdate::AccessRevoked(_))).await;
    let frame = sync_frame(&room_id, update);
    assert_eq!(frame.syscall, "sync:revoked");
    assert_eq!(frame.data["reason"], json!("none"));
}

#[tokio::test]
async fn private_chat_hidden_from_third_party() {
    let state = test_app_state();
    let mut ann = connect(Some("ann"));
    let mut cat = connect(Some("cat"));
    let room_id = create_room(&state, &mut ann, "public").await;
    open_status(&state, &mut ann, &room_id).await;
    open_status(&state, &mut cat, &room_id).await;

    send(&state, &mut ann, "chat:send", None, json!({"body": "psst", "scope": "private", "target_user_id": "bob"})).await;
    let replies = send(&state, &mut ann, "chat:send", None, json!({"body": "hello all"})).await;
    assert_eq!(replies[0].data["body"], json!("hello all"));

    let update = wait_for_update(&mut cat, |u| matches!(u, SessionUpdate::Chat(m) if !m.is_empty())).await;
    let SessionUpdate::Chat(messages) = update else { panic!("expected chat") };
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "hello all");
}

#[tokio::test]
async fn leave_marks_viewer_inactive() {
    let state = test_app_state();
    let mut ann = connect(Some("ann"));
    let room_id = create_room(&state, &mut ann, "public").await;
    open_status(&state, &mut ann, &room_id).await;

    let replies = send(&state, &mut ann, "room:leave", None, json!({})).await;
    assert_eq!(replies[0].status, Status::Done);
    assert!(ann.session.is_none());

    let record = presence::load(&state.sync, &room_id, "ann").await.expect("load").expect("record");
    assert!(!record.active);
}

// =============================================================================
// END TO END
// =============================================================================

mod e2e {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_server(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = crate::routes::app(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    async fn connect_as(addr: std::net::SocketAddr, uid: &str) -> Client {
        let mut request = format!("ws://{addr}/api/ws").into_client_request().expect("request");
        request
            .headers_mut()
            .insert("x-user-id", HeaderValue::from_str(uid).expect("header"));
        let (client, _) = tokio_tungstenite::connect_async(request).await.expect("connect");
        client
    }

    async fn recv(client: &mut Client) -> Frame {
        loop {
            let msg = timeout(Duration::from_secs(2), client.next())
                .await
                .expect("recv timed out")
                .expect("stream ended")
                .expect("ws error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).expect("frame");
            }
        }
    }

    async fn recv_until(client: &mut Client, pred: impl Fn(&Frame) -> bool) -> Frame {
        loop {
            let frame = recv(client).await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn websocket_open_sync_and_abrupt_disconnect() {
        let state = test_app_state();
        let addr = spawn_server(state.clone()).await;
        let mut client = connect_as(addr, "ann").await;

        let welcome = recv(&mut client).await;
        assert_eq!(welcome.syscall, "session:connected");
        assert_eq!(welcome.data["user_id"], json!("ann"));

        client
            .send(WsMessage::Text(request_text("room:create", None, json!({"name": "Trip"})).into()))
            .await
            .expect("send create");
        let created = recv_until(&mut client, |f| f.syscall == "room:create" && f.status == Status::Item).await;
        let room_id = created.data["id"].as_str().expect("room id").to_owned();

        client
            .send(WsMessage::Text(request_text("room:open", Some(&room_id), json!({})).into()))
            .await
            .expect("send open");
        let presence = recv_until(&mut client, |f| f.syscall == "sync:presence").await;
        assert_eq!(presence.data["users"][0]["id"], json!("ann"));
        assert_eq!(presence.data["users"][0]["active"], json!(true));

        drop(client);

        timeout(Duration::from_secs(2), async {
            loop {
                let record = presence::load(&state.sync, &room_id, "ann").await.expect("load");
                if record.is_some_and(|r| !r.active) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("disconnect hook should mark ann inactive");
    }
}
