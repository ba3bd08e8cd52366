//! Integration tests for the WebSocket gateway.
//!
//! These tests start a real server on a free port and drive it with real
//! WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use artifact_collab::{
    CollabEngine, CollabServer, Collaborators, EngineConfig, Role, StaticIdentity,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn identity() -> Arc<StaticIdentity> {
    Arc::new(
        StaticIdentity::new()
            .with_user("t-alice", "u-alice", "alice", Role::Member)
            .with_user("t-bob", "u-bob", "bob", Role::Member)
            .with_user("t-carol", "u-carol", "carol", Role::Member),
    )
}

/// Start a server on a free port, return the port and the server.
async fn start_test_server(config: EngineConfig) -> (u16, Arc<CollabServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = CollabEngine::new(config, Collaborators::in_memory(identity()));
    let server = Arc::new(CollabServer::new(engine));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (port, server)
}

async fn connect(port: u16, room: &str, token: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/rooms/{room}?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, kind: &str, data: Value) {
    let text = json!({ "type": kind, "data": data }).to_string();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next JSON envelope, skipping control frames.
async fn next_envelope(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Skip envelopes until one of type `kind` arrives.
async fn expect_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let envelope = next_envelope(ws).await;
        if envelope["type"] == kind {
            return envelope;
        }
    }
}

/// Envelopes received until the connection stays quiet for `quiet`.
async fn drain_quiet(ws: &mut Ws, quiet: Duration) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Some(Ok(msg))) = timeout(quiet, ws.next()).await {
        if let Message::Text(text) = msg {
            frames.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    frames
}

/// Read until the server closes; returns the close frame.
async fn expect_close(ws: &mut Ws) -> Option<CloseFrame> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Round-trip an application ping so earlier frames are known processed.
async fn barrier(ws: &mut Ws) {
    send(ws, "ping", json!({})).await;
    expect_type(ws, "pong").await;
}

// ─── Handshake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejects_invalid_token_before_upgrade() {
    let (port, server) = start_test_server(EngineConfig::for_testing()).await;

    for url in [
        format!("ws://127.0.0.1:{port}/rooms/art-1?token=forged"),
        format!("ws://127.0.0.1:{port}/rooms/art-1"),
    ] {
        match tokio_tungstenite::connect_async(&url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected 401, got {:?}", other.map(|_| ())),
        }
    }

    let url = format!("ws://127.0.0.1:{port}/elsewhere?token=t-alice");
    match tokio_tungstenite::connect_async(&url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }

    assert_eq!(server.stats().rejected_handshakes, 3);
    assert_eq!(server.engine().registry().room_count(), 0);
}

#[tokio::test]
async fn test_bearer_header_is_accepted() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let (port, _server) = start_test_server(EngineConfig::for_testing()).await;
    let mut request = format!("ws://127.0.0.1:{port}/rooms/art-1")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer t-alice".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let state = next_envelope(&mut ws).await;
    assert_eq!(state["type"], "room_state");
    assert_eq!(state["data"]["presence"][0]["user_id"], "u-alice");
}

// ─── Presence, typing and edits ──────────────────────────────────────────────

#[tokio::test]
async fn test_join_cursor_typing_and_concurrent_edit() {
    let (port, _server) = start_test_server(EngineConfig::for_testing()).await;

    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;
    send(&mut alice, "cursor_move", json!({ "line": 3, "col": 1 })).await;
    barrier(&mut alice).await;

    // Bob sees Alice's cursor in his first frame.
    let mut bob = connect(port, "art-1", "t-bob").await;
    let state = next_envelope(&mut bob).await;
    assert_eq!(state["type"], "room_state");
    assert_eq!(state["data"]["version"], 1);
    let presence = state["data"]["presence"].as_array().unwrap();
    let alice_presence = presence.iter().find(|p| p["user_id"] == "u-alice").unwrap();
    assert_eq!(alice_presence["cursor"], json!({ "line": 3, "col": 1 }));

    // Typing without a stop expires into one server-generated typing_stop.
    send(&mut alice, "typing_start", json!({})).await;
    let start = expect_type(&mut bob, "typing_start").await;
    assert_eq!(start["user_id"], "u-alice");
    let stop = expect_type(&mut bob, "typing_stop").await;
    assert_eq!(stop["data"]["user_id"], "u-alice");
    assert!(stop.get("user_id").is_none());

    let later = drain_quiet(&mut bob, Duration::from_millis(500)).await;
    assert!(later.iter().all(|f| f["type"] != "typing_stop"));

    // Concurrent edits against the same base: one wins, one is told to rebase.
    let edit = |n: u32| json!({ "base_version": 1, "patch": { "n": n } });
    send(&mut alice, "artifact_edit", edit(1)).await;
    send(&mut bob, "artifact_edit", edit(2)).await;

    let a = drain_quiet(&mut alice, Duration::from_millis(400)).await;
    let b = drain_quiet(&mut bob, Duration::from_millis(400)).await;
    let count = |frames: &[Value], kind: &str| frames.iter().filter(|f| f["type"] == kind).count();

    assert_eq!(count(&a, "artifact_edit"), 1);
    assert_eq!(count(&b, "artifact_edit"), 1);
    assert_eq!(count(&a, "edit_rejected") + count(&b, "edit_rejected"), 1);

    let accepted = a.iter().chain(&b).find(|f| f["type"] == "artifact_edit").unwrap();
    assert_eq!(accepted["data"]["version"], 2);
    let rejected = a.iter().chain(&b).find(|f| f["type"] == "edit_rejected").unwrap();
    assert_eq!(rejected["data"]["current_version"], 2);
    assert_eq!(rejected["data"]["current_content"], accepted["data"]["patch"]);
}

#[tokio::test]
async fn test_disconnect_broadcasts_leave_and_clears_presence() {
    let (port, _server) = start_test_server(EngineConfig::for_testing()).await;

    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;
    let mut bob = connect(port, "art-1", "t-bob").await;
    expect_type(&mut bob, "room_state").await;
    expect_type(&mut alice, "user_join").await;

    send(&mut bob, "typing_start", json!({})).await;
    expect_type(&mut alice, "typing_start").await;
    bob.close(None).await.unwrap();

    let stop = expect_type(&mut alice, "typing_stop").await;
    assert_eq!(stop["data"]["user_id"], "u-bob");
    let leave = expect_type(&mut alice, "user_leave").await;
    assert_eq!(leave["data"]["user_id"], "u-bob");
    assert_eq!(leave["data"]["status"], "offline");

    let mut carol = connect(port, "art-1", "t-carol").await;
    let state = next_envelope(&mut carol).await;
    let users: Vec<&str> = state["data"]["presence"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["user_id"].as_str().unwrap())
        .collect();
    assert_eq!(users, vec!["u-alice", "u-carol"]);
    assert_eq!(state["data"]["typing"], json!([]));
}

#[tokio::test]
async fn test_keepalives_do_not_hold_off_away() {
    let config = EngineConfig {
        ping_interval: Duration::from_millis(300),
        idle_threshold: Duration::from_millis(800),
        heartbeat_timeout: Duration::from_secs(10),
        ..EngineConfig::for_testing()
    };
    let (port, server) = start_test_server(config).await;

    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;
    let mut bob = connect(port, "art-1", "t-bob").await;
    expect_type(&mut bob, "room_state").await;

    // Alice answers every protocol ping and sends application pings, nothing else.
    let keepalive = tokio::spawn(async move {
        for _ in 0..12 {
            send(&mut alice, "ping", json!({})).await;
            drain_quiet(&mut alice, Duration::from_millis(100)).await;
        }
        alice
    });

    let away = loop {
        let update = expect_type(&mut bob, "presence_update").await;
        if update["data"]["user_id"] == "u-alice" {
            break update;
        }
    };
    assert_eq!(away["data"]["status"], "away");

    // Still away after every keepalive has been answered.
    let _alice = keepalive.await.unwrap();
    let snapshot = server.engine().registry().snapshot("art-1").unwrap();
    let presence = snapshot.presence.iter().find(|p| p.user_id == "u-alice").unwrap();
    assert_eq!(serde_json::to_value(presence.status).unwrap(), "away");
}

#[tokio::test]
async fn test_slow_consumer_is_dropped_with_4001() {
    let config = EngineConfig {
        outbound_capacity: 4,
        ping_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(30),
        ..EngineConfig::for_testing()
    };
    let (port, server) = start_test_server(config).await;

    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;
    // Carol joins and never reads.
    let mut carol = connect(port, "art-1", "t-carol").await;
    expect_type(&mut alice, "user_join").await;

    // Comments are critical frames; once the socket backs up Carol's queue overflows.
    let content = "x".repeat(10_000);
    let mut carol_left = false;
    for _ in 0..5_000 {
        send(&mut alice, "comment_add", json!({ "content": content })).await;
        loop {
            let envelope = next_envelope(&mut alice).await;
            if envelope["type"] == "user_leave" && envelope["data"]["user_id"] == "u-carol" {
                carol_left = true;
            }
            if envelope["type"] == "comment_added" {
                break;
            }
        }
        if carol_left {
            break;
        }
    }
    assert!(carol_left, "slow consumer was never dropped");

    let snapshot = server.engine().registry().snapshot("art-1").unwrap();
    assert!(snapshot.presence.iter().all(|p| p.user_id != "u-carol"));

    // Once Carol catches up on the buffered bytes she finds the close frame.
    let frame = expect_close(&mut carol).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4001);
}

// ─── Comments ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_comment_thread_over_the_wire() {
    let (port, _server) = start_test_server(EngineConfig::for_testing()).await;

    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;
    let mut bob = connect(port, "art-1", "t-bob").await;
    expect_type(&mut bob, "room_state").await;

    send(&mut alice, "comment_add", json!({ "content": "first @bob" })).await;
    let added = expect_type(&mut bob, "comment_added").await;
    let comment_id = added["data"]["comment"]["id"].clone();
    assert_eq!(added["data"]["comment"]["mentions"], json!(["u-bob"]));
    expect_type(&mut alice, "comment_added").await;

    send(
        &mut bob,
        "comment_add",
        json!({ "content": "reply", "parent_id": comment_id }),
    )
    .await;
    let reply = expect_type(&mut alice, "comment_added").await;
    assert_eq!(reply["data"]["comment"]["parent_id"], comment_id);

    // Bob may not edit Alice's comment; only he hears about it.
    send(
        &mut bob,
        "comment_update",
        json!({ "comment_id": comment_id, "content": "hijacked" }),
    )
    .await;
    let error = expect_type(&mut bob, "error").await;
    assert_eq!(error["data"]["code"], "forbidden");

    // Alice deletes her comment; the reply keeps it as a tombstone.
    send(&mut alice, "comment_delete", json!({ "comment_id": comment_id })).await;
    let deleted = expect_type(&mut bob, "comment_deleted").await;
    assert_eq!(deleted["data"]["mode"], "tombstoned");
    assert_eq!(deleted["data"]["comment"]["deleted"], true);

    let alice_frames = drain_quiet(&mut alice, Duration::from_millis(200)).await;
    assert!(alice_frames.iter().all(|f| f["type"] != "error"));
}

// ─── Connection termination ──────────────────────────────────────────────────

#[tokio::test]
async fn test_repeated_protocol_errors_close_with_4002() {
    let (port, _server) = start_test_server(EngineConfig::for_testing()).await;
    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;

    for _ in 0..3 {
        alice.send(Message::Text("{ nope".into())).await.unwrap();
        let error = expect_type(&mut alice, "error").await;
        assert_eq!(error["data"]["code"], "protocol_error");
    }
    alice.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();

    let frame = expect_close(&mut alice).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4002);
}

#[tokio::test]
async fn test_heartbeat_timeout_closes_with_4000() {
    let config = EngineConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..EngineConfig::for_testing()
    };
    let (port, server) = start_test_server(config).await;
    let mut alice = connect(port, "art-1", "t-alice").await;
    let mut bob = connect(port, "art-1", "t-bob").await;
    expect_type(&mut bob, "room_state").await;

    // Bob keeps talking; Alice goes silent.
    let keepalive = tokio::spawn(async move {
        for _ in 0..8 {
            send(&mut bob, "ping", json!({})).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bob
    });

    let frame = expect_close(&mut alice).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4000);

    let mut bob = keepalive.await.unwrap();
    let leave = expect_type(&mut bob, "user_leave").await;
    assert_eq!(leave["data"]["user_id"], "u-alice");
    assert_eq!(server.stats().active_connections, 1);
}

#[tokio::test]
async fn test_shutdown_closes_with_1001() {
    let (port, server) = start_test_server(EngineConfig::for_testing()).await;
    let mut alice = connect(port, "art-1", "t-alice").await;
    expect_type(&mut alice, "room_state").await;

    server.shutdown();
    let frame = expect_close(&mut alice).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 1001);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let url = format!("ws://127.0.0.1:{port}/rooms/art-1?token=t-alice");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}
