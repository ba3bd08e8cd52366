//! Persistence integration tests.
//!
//! Verifies:
//! - Comments, activity and notifications written through the engine
//!   survive a full restart on the RocksDB store
//! - Read state persists and stays idempotent across restarts
//! - Version history of accepted edits is recorded
//! - A store outage fails the action for its sender only and leaves room
//!   state intact

use std::sync::Arc;

use artifact_collab::storage::MemoryStore;
use artifact_collab::{
    CollabEngine, Collaborators, ConnectionHandle, DurableStore, EngineConfig, NotificationKind,
    RocksConfig, RocksStore, Role, StaticIdentity,
};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::runtime::Runtime;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn identity() -> Arc<StaticIdentity> {
    Arc::new(
        StaticIdentity::new()
            .with_user("t-alice", "u-alice", "alice", Role::Member)
            .with_user("t-bob", "u-bob", "bob", Role::Member),
    )
}

fn engine_with(store: Arc<dyn DurableStore>) -> Arc<CollabEngine> {
    let collaborators = Collaborators {
        store,
        ..Collaborators::in_memory(identity())
    };
    CollabEngine::new(EngineConfig::for_testing(), collaborators)
}

fn drain(handle: &ConnectionHandle) -> Vec<Value> {
    std::iter::from_fn(|| handle.outbox.try_next())
        .map(|f| serde_json::from_str(&f.text).unwrap())
        .collect()
}

fn frame(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[test]
fn test_comments_and_notifications_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    // Session 1: Alice comments and mentions Bob, who is offline.
    {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async {
            let store = Arc::new(RocksStore::open(RocksConfig::for_testing(&path)).unwrap());
            let engine = engine_with(store);
            let alice = engine.connect("art-1", "t-alice").await.unwrap();

            engine
                .handle_text(&alice, &frame("comment_add", json!({ "content": "ping @bob" })))
                .await;
            let root = engine.comments_for("art-1").await.unwrap()[0].id;
            engine
                .handle_text(
                    &alice,
                    &frame("comment_add", json!({ "content": "detail", "parent_id": root })),
                )
                .await;
            engine
                .handle_text(
                    &alice,
                    &frame("comment_react", json!({ "comment_id": root, "emoji": "👍" })),
                )
                .await;
            engine.dispatcher().flush().await;
            assert_eq!(engine.dispatcher().unread_count("u-bob").await.unwrap(), 1);
        });
        // Dropping the runtime drops every task holding the store.
    }

    // Session 2: everything is still there.
    let runtime = Runtime::new().unwrap();
    runtime.block_on(async {
        let store = Arc::new(RocksStore::open(RocksConfig::for_testing(&path)).unwrap());
        let engine = engine_with(store);

        let comments = engine.comments_for("art-1").await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].content, "ping @bob");
        assert_eq!(comments[0].mentions, vec!["u-bob".to_string()]);
        assert!(comments[0].reactions["👍"].contains("u-alice"));
        assert_eq!(comments[1].parent_id, Some(comments[0].id));

        let activity = engine.recent_activity("art-1", 10, None).await.unwrap();
        assert_eq!(activity.len(), 3);

        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        let state = drain(&bob);
        assert_eq!(state[0]["data"]["unread_count"], 1);
        assert_eq!(state[0]["data"]["recent_activity"].as_array().unwrap().len(), 3);

        let stored = engine.dispatcher().list("u-bob").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::Mention);
        engine
            .handle_text(&bob, &frame("notification_read", json!({ "id": stored[0].id })))
            .await;
        let read_at = engine.dispatcher().list("u-bob").await.unwrap()[0].read_at;
        assert!(read_at.is_some());

        engine
            .handle_text(&bob, &frame("notification_read_all", json!({})))
            .await;
        assert_eq!(engine.dispatcher().list("u-bob").await.unwrap()[0].read_at, read_at);
        assert_eq!(engine.dispatcher().unread_count("u-bob").await.unwrap(), 0);
    });
}

#[tokio::test]
async fn test_accepted_edits_are_versioned() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap());
    let engine = engine_with(store);
    let alice = engine.connect("art-1", "t-alice").await.unwrap();

    for base in 1..=3 {
        let edit = json!({ "base_version": base, "patch": { "rev": base } });
        engine.handle_text(&alice, &frame("artifact_edit", edit)).await;
    }
    // Stale base: rejected, no new version.
    let stale = json!({ "base_version": 2, "patch": { "rev": 0 } });
    engine.handle_text(&alice, &frame("artifact_edit", stale)).await;

    let history = engine.conflicts().history("art-1").await.unwrap();
    let versions: Vec<u64> = history.iter().map(|m| m.version_no).collect();
    assert_eq!(versions, vec![2, 3, 4]);
    assert!(history.iter().all(|m| m.editor == "u-alice"));

    let frames = drain(&alice);
    let rejected: Vec<&Value> = frames.iter().filter(|f| f["type"] == "edit_rejected").collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["data"]["current_version"], 4);
    assert_eq!(rejected[0]["data"]["current_content"], json!({ "rev": 3 }));
}

// ─── Outage ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_store_outage_fails_only_the_sender() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone());
    let alice = engine.connect("art-1", "t-alice").await.unwrap();
    let bob = engine.connect("art-1", "t-bob").await.unwrap();
    drain(&alice);
    drain(&bob);

    store.set_available(false);
    engine
        .handle_text(&alice, &frame("comment_add", json!({ "content": "lost" })))
        .await;

    let alice_frames = drain(&alice);
    assert_eq!(alice_frames.len(), 1);
    assert_eq!(alice_frames[0]["type"], "error");
    assert_eq!(alice_frames[0]["data"]["code"], "storage_unavailable");
    assert!(drain(&bob).is_empty());

    // Presence keeps working while the store is down.
    engine.handle_text(&alice, &frame("typing_start", json!({}))).await;
    assert_eq!(drain(&bob)[0]["type"], "typing_start");

    store.set_available(true);
    assert!(engine.comments_for("art-1").await.unwrap().is_empty());
    engine
        .handle_text(&alice, &frame("comment_add", json!({ "content": "kept" })))
        .await;
    assert_eq!(engine.comments_for("art-1").await.unwrap().len(), 1);
}
