//! The collaboration engine: wires the registry, router, comment engine,
//! conflict resolver and notification dispatcher together.
//!
//! ```text
//!  text frame ─► Envelope::parse ─► router::route ─► [Effect]
//!                                                     │
//!        presence effects ─► RoomRegistry (fan-out) ◄─┤
//!        comment effects  ─► CommentEngine ─► persist ─► log ─► broadcast ─► notify
//!        edit effects     ─► ConflictResolver ─► broadcast | edit_rejected
//!        read effects     ─► Dispatcher ─► unread_count (sender only)
//! ```
//!
//! Inbound frames of one connection are handled strictly in order by the
//! caller (the gateway reader task). Failures local to one action are
//! reported to the sender only; nothing is broadcast before it has been
//! persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::activity::ActivityLog;
use crate::bus::{LocalBus, RoomBus};
use crate::collaborators::{
    Authorizer, DeliveryChannel, IdentityProvider, RoleAuthorizer, StaticIdentity, UserDirectory,
    UserIdentity,
};
use crate::comments::{CommentChange, CommentEngine};
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, EditOutcome};
use crate::connection::ConnectionHandle;
use crate::error::{CollabError, ProtocolError, Result};
use crate::model::{Activity, Comment, NotificationKind, Priority};
use crate::notify::{Dispatcher, InAppChannel, NotifyEvent};
use crate::protocol::{kinds, CloseReason, Envelope};
use crate::room::{RoomRegistry, SweepReport};
use crate::router::{route, Effect};
use crate::storage::{ArtifactStorage, DurableStore, MemoryArtifacts, MemoryStore};

/// Notification excerpts are cut to this many characters.
const EXCERPT_CHARS: usize = 140;

/// Everything the engine consumes from outside.
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub authorizer: Arc<dyn Authorizer>,
    pub directory: Arc<dyn UserDirectory>,
    pub store: Arc<dyn DurableStore>,
    pub artifacts: Arc<dyn ArtifactStorage>,
    /// Extra delivery channels; in-app delivery is always added.
    pub channels: Vec<Arc<dyn DeliveryChannel>>,
    pub bus: Arc<dyn RoomBus>,
}

impl Collaborators {
    /// Single-process setup backed by in-memory stores.
    pub fn in_memory(identity: Arc<StaticIdentity>) -> Self {
        Self {
            identity: identity.clone(),
            authorizer: Arc::new(RoleAuthorizer),
            directory: identity,
            store: Arc::new(MemoryStore::new()),
            artifacts: Arc::new(MemoryArtifacts::new()),
            channels: Vec::new(),
            bus: Arc::new(LocalBus),
        }
    }
}

pub struct CollabEngine {
    config: EngineConfig,
    identity: Arc<dyn IdentityProvider>,
    registry: Arc<RoomRegistry>,
    activity: Arc<ActivityLog>,
    comments: CommentEngine,
    conflicts: ConflictResolver,
    dispatcher: Dispatcher,
}

impl CollabEngine {
    /// Build the engine. Spawns the notification worker, so this must run
    /// inside a tokio runtime.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            identity,
            authorizer,
            directory,
            store,
            artifacts,
            mut channels,
            bus,
        } = collaborators;

        let registry = Arc::new(RoomRegistry::new(&config, bus));
        let activity = Arc::new(ActivityLog::new(store.clone()));
        channels.push(Arc::new(InAppChannel::new(registry.clone())));

        Arc::new(Self {
            comments: CommentEngine::new(store.clone(), activity.clone(), authorizer, directory),
            conflicts: ConflictResolver::new(artifacts, store.clone(), activity.clone()),
            dispatcher: Dispatcher::new(&config, store, channels),
            identity,
            registry,
            activity,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn conflicts(&self) -> &ConflictResolver {
        &self.conflicts
    }

    // ───────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ───────────────────────────────────────────────────────────────

    /// Validate a token. Fails closed.
    pub fn authenticate(&self, token: &str) -> Result<UserIdentity> {
        if token.is_empty() {
            return Err(CollabError::Auth("missing token".into()));
        }
        self.identity
            .validate(token)
            .ok_or_else(|| CollabError::Auth("invalid or expired token".into()))
    }

    /// Authenticate and join the artifact's room.
    ///
    /// The returned handle's outbox already holds `room_state`. No room
    /// state is touched when authentication fails.
    pub async fn connect(&self, artifact_id: &str, token: &str) -> Result<Arc<ConnectionHandle>> {
        let identity = self.authenticate(token)?;
        Ok(self.join(artifact_id, identity).await)
    }

    /// Join an already authenticated user.
    pub async fn join(&self, artifact_id: &str, identity: UserIdentity) -> Arc<ConnectionHandle> {
        let extras = self.room_extras(artifact_id, &identity).await;
        let handle = Arc::new(ConnectionHandle::new(
            identity,
            artifact_id,
            self.config.outbound_capacity,
        ));
        self.registry.join(&handle, extras);
        handle
    }

    /// Durable context for `room_state`. Missing pieces are logged and
    /// omitted rather than refusing the join.
    async fn room_extras(&self, artifact_id: &str, identity: &UserIdentity) -> Value {
        let mut extras = serde_json::Map::new();
        match self
            .activity
            .recent(artifact_id, self.config.recent_activity_limit, Some(identity))
            .await
        {
            Ok(recent) => {
                extras.insert("recent_activity".into(), json!(recent));
            }
            Err(e) => log::warn!("Recent activity unavailable for {artifact_id}: {e}"),
        }
        match self.conflicts.current_version(artifact_id).await {
            Ok(version) => {
                extras.insert("version".into(), json!(version));
            }
            Err(e) => log::warn!("Version unavailable for {artifact_id}: {e}"),
        }
        match self.dispatcher.unread_count(&identity.user_id).await {
            Ok(unread) => {
                extras.insert("unread_count".into(), json!(unread));
            }
            Err(e) => log::warn!("Unread count unavailable for {}: {e}", identity.user_id),
        }
        Value::Object(extras)
    }

    /// Remove the connection from its room. Remaining members receive
    /// `typing_stop` / `user_leave` before this returns.
    pub fn disconnect(&self, handle: &ConnectionHandle) {
        self.registry.leave(handle);
    }

    /// Close every connection with 1001.
    pub fn shutdown(&self) {
        self.registry.close_all(CloseReason::ServerShutdown);
    }

    // ───────────────────────────────────────────────────────────────
    // Inbound frames
    // ───────────────────────────────────────────────────────────────

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, handle: &ConnectionHandle, text: &str) {
        let effects = match Envelope::parse(text).and_then(|envelope| route(&envelope)) {
            Ok(effects) => effects,
            Err(e) => {
                self.protocol_error(handle, e);
                return;
            }
        };
        // Keepalives prove the socket is up, not that the user is present.
        if effects.iter().any(|effect| !matches!(effect, Effect::Pong)) {
            self.registry.touch(handle);
        }
        for effect in effects {
            if let Err(e) = self.apply(handle, effect).await {
                self.reject(handle, &e);
            }
        }
    }

    /// Binary frames are not part of the protocol.
    pub fn handle_binary(&self, handle: &ConnectionHandle) {
        self.protocol_error(handle, ProtocolError::UnsupportedFrame);
    }

    /// Report to the sender; repeated offenders are disconnected.
    fn protocol_error(&self, handle: &ConnectionHandle, error: ProtocolError) {
        let count = handle.record_protocol_error();
        log::warn!(
            "Protocol error from {} on {} ({count}/{}): {error}",
            handle.user_id(),
            handle.artifact_id,
            self.config.max_protocol_errors
        );
        let err = CollabError::from(error);
        self.registry.send_to(handle, Envelope::error(&err).into_frame());
        if count > self.config.max_protocol_errors {
            log::warn!("Dropping {} after repeated protocol errors", handle.id);
            handle.close(CloseReason::ProtocolViolation);
        }
    }

    fn reject(&self, handle: &ConnectionHandle, error: &CollabError) {
        match error {
            CollabError::Storage(e) => log::error!("Action by {} failed: {e}", handle.user_id()),
            other => log::debug!("Rejected action by {}: {other}", handle.user_id()),
        }
        self.registry.send_to(handle, Envelope::error(error).into_frame());
    }

    async fn apply(&self, handle: &ConnectionHandle, effect: Effect) -> Result<()> {
        let user = &handle.identity;
        let artifact_id = handle.artifact_id.as_str();
        match effect {
            Effect::UpdateCursor { cursor, timestamp } => {
                self.registry.update_cursor(handle, cursor, timestamp);
            }
            Effect::UpdateSelection {
                selection,
                timestamp,
            } => {
                self.registry.update_selection(handle, selection, timestamp);
            }
            Effect::TypingStart => {
                self.registry.typing_start(handle);
            }
            Effect::TypingStop => {
                self.registry.typing_stop(handle);
            }
            Effect::SetActivity { label } => {
                self.registry.set_activity(handle, label);
            }
            Effect::AddComment {
                content,
                parent_id,
                claimed_mentions,
            } => {
                let change = self
                    .comments
                    .add(user, artifact_id, &content, parent_id, &claimed_mentions)
                    .await?;
                self.publish_comment(kinds::COMMENT_ADDED, user, &change, json!({}));
                self.notify_comment(user, &change, true).await;
            }
            Effect::UpdateComment {
                comment_id,
                content,
            } => {
                let change = self
                    .comments
                    .update(user, artifact_id, comment_id, &content)
                    .await?;
                self.publish_comment(kinds::COMMENT_UPDATED, user, &change, json!({}));
                self.notify_comment(user, &change, false).await;
            }
            Effect::DeleteComment { comment_id } => {
                let change = self.comments.delete(user, artifact_id, comment_id).await?;
                let mode = change.delete_mode.map(|m| m.as_str());
                self.publish_comment(kinds::COMMENT_DELETED, user, &change, json!({ "mode": mode }));
            }
            Effect::ReactComment { comment_id, emoji } => {
                let change = self
                    .comments
                    .toggle_reaction(user, artifact_id, comment_id, &emoji)
                    .await?;
                self.publish_comment(kinds::COMMENT_UPDATED, user, &change, json!({}));
            }
            Effect::ResolveComment {
                comment_id,
                resolved,
            } => {
                let change = self
                    .comments
                    .set_resolved(user, artifact_id, comment_id, resolved)
                    .await?;
                self.publish_comment(kinds::COMMENT_UPDATED, user, &change, json!({}));
            }
            Effect::ProposeEdit {
                base_version,
                patch,
            } => {
                match self
                    .conflicts
                    .propose_edit(user, artifact_id, base_version, &patch)
                    .await?
                {
                    EditOutcome::Accepted(marker) => {
                        let edit = Envelope::from_user(
                            kinds::ARTIFACT_EDIT,
                            &user.user_id,
                            json!({
                                "version": marker.version_no,
                                "base_version": marker.base_version,
                                "patch": patch,
                            }),
                        );
                        self.registry.broadcast(artifact_id, edit.into_frame(), None);
                    }
                    EditOutcome::Rejected {
                        current_version,
                        current_content,
                    } => {
                        let conflict = CollabError::Conflict {
                            base: base_version,
                            current: current_version,
                        };
                        let rejected = Envelope::system(
                            kinds::EDIT_REJECTED,
                            json!({
                                "code": conflict.code(),
                                "message": conflict.to_string(),
                                "base_version": base_version,
                                "current_version": current_version,
                                "current_content": current_content,
                            }),
                        );
                        self.registry.send_to(handle, rejected.into_frame());
                    }
                }
            }
            Effect::MarkRead { notification_id } => {
                let unread = self.dispatcher.mark_read(&user.user_id, notification_id).await?;
                self.send_unread(handle, unread);
            }
            Effect::MarkAllRead => {
                self.dispatcher.mark_all_read(&user.user_id).await?;
                let unread = self.dispatcher.unread_count(&user.user_id).await?;
                self.send_unread(handle, unread);
            }
            Effect::Pong => {
                let pong = Envelope::system(kinds::PONG, json!({}));
                self.registry.send_to(handle, pong.into_frame());
            }
        }
        Ok(())
    }

    fn send_unread(&self, handle: &ConnectionHandle, unread: u64) {
        let frame = Envelope::system(kinds::UNREAD_COUNT, json!({ "unread_count": unread }));
        self.registry.send_to(handle, frame.into_frame());
    }

    /// Broadcast a persisted comment change to the whole room, sender
    /// included, so every member converges on the stored state.
    fn publish_comment(&self, kind: &str, user: &UserIdentity, change: &CommentChange, extra: Value) {
        let mut data = json!({
            "comment": change.comment,
            "activity_id": change.activity.id,
        });
        if let (Value::Object(data), Value::Object(extra)) = (&mut data, extra) {
            data.extend(extra);
        }
        let envelope = Envelope::from_user(kind, &user.user_id, data);
        self.registry
            .broadcast(&change.comment.artifact_id, envelope.into_frame(), None);
    }

    /// Mentions and replies notify users who are not watching the room.
    /// A new top-level comment also sends a low-priority `comment`
    /// notification to the artifact's followers: everyone who has commented
    /// on it before, taken from the durable store so that followers
    /// connected to other processes are reached too. Authors never notify
    /// themselves.
    ///
    /// "Watching" is judged by this process's registry only. A follower
    /// present in the room through another process still gets a stored
    /// notification.
    async fn notify_comment(&self, actor: &UserIdentity, change: &CommentChange, added: bool) {
        let comment = &change.comment;
        let watchers = self.registry.watchers(&comment.artifact_id);
        let interested = |user_id: &String| *user_id != actor.user_id && !watchers.contains(user_id);

        let mentioned: Vec<String> = change
            .new_mentions
            .iter()
            .filter(|u| interested(*u))
            .cloned()
            .collect();
        if !mentioned.is_empty() {
            self.dispatcher.notify(
                &mentioned,
                comment_event(NotificationKind::Mention, Priority::High, actor, comment, &change.activity),
            );
        }

        if let Some(parent_author) = change.parent_author.as_ref() {
            if interested(parent_author) && !change.new_mentions.contains(parent_author) {
                self.dispatcher.notify(
                    std::slice::from_ref(parent_author),
                    comment_event(NotificationKind::Reply, Priority::Normal, actor, comment, &change.activity),
                );
            }
        }

        if !added || comment.parent_id.is_some() {
            return;
        }
        let followers = match self.comments.comments_for(&comment.artifact_id).await {
            Ok(comments) => comments
                .into_iter()
                .filter(|c| c.is_live())
                .map(|c| c.author)
                .collect::<BTreeSet<String>>(),
            Err(e) => {
                log::warn!("Followers of {} unavailable: {e}", comment.artifact_id);
                return;
            }
        };
        let followers: Vec<String> = followers
            .into_iter()
            .filter(|u| interested(u) && !change.new_mentions.contains(u))
            .collect();
        if !followers.is_empty() {
            self.dispatcher.notify(
                &followers,
                comment_event(NotificationKind::Comment, Priority::Low, actor, comment, &change.activity),
            );
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────

    /// Comments in thread order, tombstones included.
    pub async fn comments_for(&self, artifact_id: &str) -> Result<Vec<Comment>> {
        self.comments.comments_for(artifact_id).await
    }

    pub async fn recent_activity(
        &self,
        artifact_id: &str,
        limit: usize,
        viewer: Option<&UserIdentity>,
    ) -> Result<Vec<Activity>> {
        Ok(self.activity.recent(artifact_id, limit, viewer).await?)
    }

    // ───────────────────────────────────────────────────────────────
    // Background work
    // ───────────────────────────────────────────────────────────────

    /// One presence sweep.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let report = self.registry.sweep(now);
        if report != SweepReport::default() {
            log::debug!("Sweep: {report:?}");
        }
        report
    }

    /// Run the debounce flush and presence sweep until `shutdown` flips.
    pub fn spawn_background(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(engine.config.sweep_interval);
            let mut flush = tokio::time::interval(engine.config.debounce_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        engine.sweep(Instant::now());
                    }
                    _ = flush.tick() => {
                        engine.registry.flush_debounced(Instant::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Background tasks stopped");
        })
    }

    /// Relay frames published by other processes into local rooms.
    pub fn spawn_relay(&self) -> Option<JoinHandle<()>> {
        self.registry.spawn_relay()
    }
}

fn comment_event(
    kind: NotificationKind,
    priority: Priority,
    actor: &UserIdentity,
    comment: &Comment,
    activity: &Activity,
) -> NotifyEvent {
    let excerpt: String = comment.content.chars().take(EXCERPT_CHARS).collect();
    NotifyEvent {
        // One mutation is one event, however often it is re-notified.
        event_id: activity.id,
        kind,
        priority,
        actor: actor.user_id.clone(),
        artifact_id: comment.artifact_id.clone(),
        payload: json!({
            "comment_id": comment.id,
            "parent_id": comment.parent_id,
            "excerpt": excerpt,
            "actor_name": actor.display_name,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Role;
    use crate::protocol::now_millis;
    use uuid::Uuid;

    fn identity() -> Arc<StaticIdentity> {
        Arc::new(
            StaticIdentity::new()
                .with_user("t-alice", "u-alice", "alice", Role::Member)
                .with_user("t-bob", "u-bob", "bob", Role::Member)
                .with_user("t-carol", "u-carol", "carol", Role::Member)
                .with_user("t-mod", "u-mod", "mod", Role::Moderator),
        )
    }

    fn engine() -> Arc<CollabEngine> {
        CollabEngine::new(EngineConfig::for_testing(), Collaborators::in_memory(identity()))
    }

    fn drain(handle: &ConnectionHandle) -> Vec<Value> {
        std::iter::from_fn(|| handle.outbox.try_next())
            .map(|f| serde_json::from_str(&f.text).unwrap())
            .collect()
    }

    fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
        frames.iter().filter(|f| f["type"] == kind).collect()
    }

    fn frame(kind: &str, data: Value) -> String {
        json!({ "type": kind, "data": data, "timestamp": now_millis() }).to_string()
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_token() {
        let engine = engine();
        let err = engine.connect("art-1", "nope").await.unwrap_err();
        assert_eq!(err.code(), "auth_error");
        assert!(engine.connect("art-1", "").await.is_err());
        assert_eq!(engine.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_room_state_carries_durable_context() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let frames = drain(&alice);
        assert_eq!(frames[0]["type"], "room_state");
        assert_eq!(frames[0]["data"]["version"], 1);
        assert_eq!(frames[0]["data"]["unread_count"], 0);
        assert!(frames[0]["data"]["recent_activity"].is_array());
        assert_eq!(frames[0]["data"]["connection_id"], json!(alice.id.0));
    }

    #[tokio::test]
    async fn test_comment_broadcast_includes_sender() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        drain(&alice);
        drain(&bob);

        engine
            .handle_text(&alice, &frame("comment_add", json!({ "content": "hello" })))
            .await;

        for handle in [&alice, &bob] {
            let frames = drain(handle);
            let added = of_type(&frames, "comment_added");
            assert_eq!(added.len(), 1);
            assert_eq!(added[0]["user_id"], "u-alice");
            assert_eq!(added[0]["data"]["comment"]["content"], "hello");
        }
        assert_eq!(engine.comments_for("art-1").await.unwrap().len(), 1);
        assert_eq!(engine.recent_activity("art-1", 10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_errors_go_to_sender_only() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        drain(&alice);
        drain(&bob);

        engine.handle_text(&alice, "not json").await;
        engine.handle_text(&alice, &frame("teleport", json!({}))).await;
        let missing = json!({ "content": "reply", "parent_id": Uuid::new_v4() });
        engine.handle_text(&alice, &frame("comment_add", missing)).await;

        let frames = drain(&alice);
        let codes: Vec<&str> = of_type(&frames, "error")
            .iter()
            .map(|f| f["data"]["code"].as_str().unwrap())
            .collect();
        assert_eq!(codes, vec!["protocol_error", "protocol_error", "not_found"]);
        assert!(drain(&bob).is_empty());
    }

    #[tokio::test]
    async fn test_repeated_protocol_errors_close_connection() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        for _ in 0..engine.config().max_protocol_errors {
            engine.handle_text(&alice, "{").await;
        }
        assert_eq!(alice.outbox.close_reason(), None);
        engine.handle_text(&alice, "{").await;
        assert_eq!(alice.outbox.close_reason(), Some(CloseReason::ProtocolViolation));
    }

    #[tokio::test]
    async fn test_edit_conflict_goes_to_loser_only() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        drain(&alice);
        drain(&bob);

        let edit = |title: &str| frame("artifact_edit", json!({ "base_version": 1, "patch": { "title": title } }));
        engine.handle_text(&alice, &edit("a")).await;
        engine.handle_text(&bob, &edit("b")).await;

        let a = drain(&alice);
        let b = drain(&bob);
        assert_eq!(of_type(&a, "artifact_edit").len(), 1);
        assert_eq!(of_type(&b, "artifact_edit").len(), 1);
        assert!(of_type(&a, "edit_rejected").is_empty());

        let rejected = of_type(&b, "edit_rejected");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0]["data"]["current_version"], 2);
        assert_eq!(rejected[0]["data"]["current_content"], json!({ "title": "a" }));
        assert_eq!(rejected[0]["data"]["code"], "conflict");
    }

    #[tokio::test]
    async fn test_mentions_notify_absent_users_only() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        // carol is in another room; she is not watching art-1
        let carol = engine.connect("art-2", "t-carol").await.unwrap();
        drain(&carol);

        engine
            .handle_text(
                &alice,
                &frame("comment_add", json!({ "content": "@bob @carol @alice look" })),
            )
            .await;
        engine.dispatcher().flush().await;

        assert_eq!(engine.dispatcher().unread_count("u-carol").await.unwrap(), 1);
        assert_eq!(engine.dispatcher().unread_count("u-bob").await.unwrap(), 0);
        assert_eq!(engine.dispatcher().unread_count("u-alice").await.unwrap(), 0);

        let pushed = drain(&carol);
        let notifications = of_type(&pushed, "notification");
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["data"]["type"], "mention");
        drain(&bob);
    }

    #[tokio::test]
    async fn test_reply_notifies_parent_author_and_read_state() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        engine
            .handle_text(&alice, &frame("comment_add", json!({ "content": "root" })))
            .await;
        let root_id = engine.comments_for("art-1").await.unwrap()[0].id;
        engine.disconnect(&alice);

        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        engine
            .handle_text(
                &bob,
                &frame("comment_add", json!({ "content": "reply", "parent_id": root_id })),
            )
            .await;
        engine.dispatcher().flush().await;

        let stored = engine.dispatcher().list("u-alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::Reply);

        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let state = drain(&alice);
        assert_eq!(state[0]["data"]["unread_count"], 1);

        let read = frame("notification_read", json!({ "id": stored[0].id }));
        engine.handle_text(&alice, &read).await;
        engine.handle_text(&alice, &read).await;
        let frames = drain(&alice);
        let counts: Vec<Value> = frames
            .iter()
            .filter(|f| f["type"] == "unread_count")
            .map(|f| f["data"]["unread_count"].clone())
            .collect();
        assert_eq!(counts, vec![json!(0), json!(0)]);
    }

    #[tokio::test]
    async fn test_new_comments_coalesce_for_absent_followers() {
        let engine = engine();
        // carol and bob follow art-1 by having commented on it
        let carol = engine.connect("art-1", "t-carol").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        engine
            .handle_text(&carol, &frame("comment_add", json!({ "content": "first" })))
            .await;
        engine
            .handle_text(&bob, &frame("comment_add", json!({ "content": "me too" })))
            .await;
        engine.disconnect(&carol);
        let carol = engine.connect("art-2", "t-carol").await.unwrap();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        engine.dispatcher().flush().await;
        drain(&carol);

        for n in 0..3 {
            let text = frame("comment_add", json!({ "content": format!("update {n}") }));
            engine.handle_text(&alice, &text).await;
            engine.dispatcher().flush().await;
        }
        // A mention is its own notification, not another folded comment.
        engine
            .handle_text(&alice, &frame("comment_add", json!({ "content": "@carol look" })))
            .await;
        engine.dispatcher().flush().await;

        let stored = engine.dispatcher().list("u-carol").await.unwrap();
        let folded: Vec<_> = stored
            .iter()
            .filter(|n| n.kind == NotificationKind::Comment)
            .collect();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].count, 3);
        assert_eq!(folded[0].priority, Priority::Low);
        assert_eq!(folded[0].payload["count"], 3);
        assert_eq!(stored.len(), 2);

        let pushed = drain(&carol);
        let types: Vec<&Value> = of_type(&pushed, "notification")
            .into_iter()
            .map(|n| &n["data"]["type"])
            .collect();
        assert_eq!(types, vec![&json!("comment"), &json!("mention")]);

        // bob is in the room and sees the broadcasts instead.
        assert_eq!(engine.dispatcher().unread_count("u-bob").await.unwrap(), 0);
        drain(&alice);
        drain(&bob);
    }

    #[tokio::test]
    async fn test_ping_pong_and_disconnect() {
        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();
        drain(&alice);
        drain(&bob);

        engine.handle_text(&alice, &frame("ping", json!({}))).await;
        assert_eq!(of_type(&drain(&alice), "pong").len(), 1);

        engine.disconnect(&alice);
        let snapshot = engine.registry().snapshot("art-1").unwrap();
        assert!(snapshot.presence.iter().all(|p| p.user_id != "u-alice"));
        assert_eq!(of_type(&drain(&bob), "user_leave").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_does_not_hold_off_idle() {
        use crate::presence::PresenceStatus;

        let engine = engine();
        let alice = engine.connect("art-1", "t-alice").await.unwrap();
        let bob = engine.connect("art-1", "t-bob").await.unwrap();

        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        engine.handle_text(&alice, &frame("ping", json!({}))).await;
        engine
            .handle_text(&bob, &frame("cursor_move", json!({ "line": 1, "col": 2 })))
            .await;
        assert_eq!(of_type(&drain(&alice), "pong").len(), 1);

        tokio::time::advance(std::time::Duration::from_millis(1000)).await;
        assert_eq!(engine.sweep(Instant::now()).demoted, 1);

        let snapshot = engine.registry().snapshot("art-1").unwrap();
        let status = |user: &str| snapshot.presence.iter().find(|p| p.user_id == user).unwrap().status;
        assert_eq!(status("u-alice"), PresenceStatus::Away);
        assert_eq!(status("u-bob"), PresenceStatus::Active);
    }

}
