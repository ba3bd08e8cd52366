//! Room registry: artifact id → live connections, presence and typing.
//!
//! ```text
//!                 RoomRegistry
//!   rooms: RwLock<HashMap<artifact_id, Arc<Room>>>
//!                      │
//!          ┌───────────┼───────────┐
//!          ▼           ▼           ▼
//!        Room        Room        Room      each: Mutex<RoomState>
//!     members ─► ConnectionHandle::outbox
//!     presence, typing (TTL), deltas (debounced)
//!                      │
//!                      └──► RoomBus::publish ──► other processes
//! ```
//!
//! Every mutation of a room happens under that room's mutex and fans out
//! before the mutex is released, so joins, leaves and broadcasts on one
//! room never interleave while different rooms proceed in parallel.
//! Lock order is always registry map → room.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{BusFrame, RoomBus};
use crate::config::EngineConfig;
use crate::connection::{ConnectionHandle, ConnectionId, PushOutcome};
use crate::ephemeral::Ephemeral;
use crate::presence::{Cursor, PresenceStatus, PresenceTable, Selection, UserPresence};
use crate::protocol::{kinds, now_millis, Envelope, Frame};

// ───────────────────────────────────────────────────────────────────
// Room
// ───────────────────────────────────────────────────────────────────

struct RoomState {
    members: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    presence: PresenceTable,
    /// user_id → typing, with TTL
    typing: Ephemeral<String, ()>,
    /// Latest cursor/selection delta per connection, debounced
    deltas: Ephemeral<(ConnectionId, &'static str), Envelope>,
    empty_since: Option<Instant>,
    /// Set when the sweep removed this room from the registry
    evicted: bool,
}

pub struct Room {
    id: String,
    state: Mutex<RoomState>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Room {
    fn new(id: &str, typing_ttl: Duration, debounce: Duration, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(RoomState {
                members: HashMap::new(),
                presence: PresenceTable::new(),
                typing: Ephemeral::with_ttl(typing_ttl),
                deltas: Ephemeral::debounced(debounce),
                empty_since: Some(now),
                evicted: false,
            }),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Push `frame` to every local member except `exclude`.
    fn fan_out(&self, state: &RoomState, frame: &Frame, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for (id, handle) in &state.members {
            if Some(*id) == exclude {
                continue;
            }
            delivered += self.deliver(handle, frame.clone());
        }
        delivered
    }

    fn deliver(&self, handle: &ConnectionHandle, frame: Frame) -> usize {
        match handle.send(frame) {
            PushOutcome::Queued => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                1
            }
            PushOutcome::QueuedEvicting => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                1
            }
            PushOutcome::Dropped | PushOutcome::Closed => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Snapshots and statistics
// ───────────────────────────────────────────────────────────────────

/// What a joiner needs to render existing collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub artifact_id: String,
    pub presence: Vec<UserPresence>,
    /// User ids currently typing
    pub typing: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub room_id: String,
    pub connections: usize,
    pub users: usize,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub typing_expired: usize,
    pub demoted: usize,
    pub evicted: usize,
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

pub struct RoomRegistry {
    node_id: Uuid,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    bus: Arc<dyn RoomBus>,
    typing_ttl: Duration,
    debounce: Duration,
    idle_threshold: Duration,
    grace_period: Duration,
}

impl RoomRegistry {
    pub fn new(config: &EngineConfig, bus: Arc<dyn RoomBus>) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            rooms: RwLock::new(HashMap::new()),
            bus,
            typing_ttl: config.typing_ttl,
            debounce: config.debounce_interval,
            idle_threshold: config.idle_threshold,
            grace_period: config.room_grace_period,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().get(room_id) {
            return room.clone();
        }

        // Slow path: write lock, double-checked
        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(
            room_id,
            self.typing_ttl,
            self.debounce,
            Instant::now(),
        ));
        rooms.insert(room_id.to_string(), room.clone());
        log::debug!("Created room {room_id}");
        room
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).cloned()
    }

    fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().values().cloned().collect()
    }

    /// Local fan-out plus publication to other processes.
    fn emit(&self, room: &Room, state: &RoomState, frame: Frame, exclude: Option<ConnectionId>) -> usize {
        let delivered = room.fan_out(state, &frame, exclude);
        self.bus.publish(BusFrame {
            origin: self.node_id,
            room_id: room.id.clone(),
            frame,
            exclude,
        });
        delivered
    }

    /// Register `handle` in its artifact's room.
    ///
    /// The joiner receives `room_state` (presence, typing and `extras`)
    /// before any other frame; every other member receives `user_join`.
    pub fn join(&self, handle: &Arc<ConnectionHandle>, extras: Value) -> RoomSnapshot {
        loop {
            let room = self.get_or_create(&handle.artifact_id);
            let mut state = room.state.lock();
            if state.evicted {
                // Lost a race with the sweep; the next lookup creates a fresh room.
                continue;
            }

            let now = Instant::now();
            let presence = UserPresence::new(handle.id, &handle.identity, now, now_millis());
            state.presence.insert(handle.id, presence.clone());
            state.members.insert(handle.id, handle.clone());
            state.empty_since = None;

            let mut typing = state.typing.live_keys(now);
            typing.sort();
            let snapshot = RoomSnapshot {
                artifact_id: room.id.clone(),
                presence: state.presence.snapshot(),
                typing,
            };

            let mut data = match serde_json::to_value(&snapshot) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            data.insert("connection_id".into(), json!(handle.id.0));
            if let Value::Object(extra) = extras {
                data.extend(extra);
            }
            room.deliver(handle, Envelope::system(kinds::ROOM_STATE, Value::Object(data)).into_frame());

            let joined = Envelope::from_user(kinds::USER_JOIN, handle.user_id(), presence.to_value());
            self.emit(&room, &state, joined.into_frame(), Some(handle.id));

            log::info!(
                "User {} joined room {} ({} connections)",
                handle.user_id(),
                room.id,
                state.members.len()
            );
            return snapshot;
        }
    }

    /// Remove `handle` from its room.
    ///
    /// Remaining members receive `typing_stop` (if this was the user's last
    /// connection and they were typing) followed by `user_leave`. Returns
    /// `false` if the handle was not a member.
    pub fn leave(&self, handle: &ConnectionHandle) -> bool {
        let Some(room) = self.room(&handle.artifact_id) else {
            return false;
        };
        let mut state = room.state.lock();
        if state.members.remove(&handle.id).is_none() {
            return false;
        }
        state.presence.remove(&handle.id);
        state.deltas.remove(&(handle.id, kinds::CURSOR_MOVE));
        state.deltas.remove(&(handle.id, kinds::SELECTION_CHANGE));

        let user_id = handle.user_id().to_string();
        if !state.presence.has_user(&user_id) && state.typing.remove(&user_id).is_some() {
            let stop = Envelope::from_user(kinds::TYPING_STOP, &user_id, json!({ "user_id": user_id }));
            self.emit(&room, &state, stop.into_frame(), None);
        }

        let left = Envelope::from_user(
            kinds::USER_LEAVE,
            &user_id,
            json!({
                "user_id": user_id,
                "connection_id": handle.id.0,
                "status": PresenceStatus::Offline,
            }),
        );
        self.emit(&room, &state, left.into_frame(), None);

        if state.members.is_empty() {
            state.empty_since = Some(Instant::now());
        }
        log::info!(
            "User {} left room {} ({} connections)",
            user_id,
            room.id,
            state.members.len()
        );
        true
    }

    /// Deliver `frame` to every member of `room_id` except `exclude`, on
    /// this process and through the bus. Returns local deliveries.
    pub fn broadcast(&self, room_id: &str, frame: Frame, exclude: Option<ConnectionId>) -> usize {
        match self.room(room_id) {
            Some(room) => {
                let state = room.state.lock();
                self.emit(&room, &state, frame, exclude)
            }
            None => {
                self.bus.publish(BusFrame {
                    origin: self.node_id,
                    room_id: room_id.to_string(),
                    frame,
                    exclude,
                });
                0
            }
        }
    }

    /// Local re-broadcast of a frame published by another process.
    pub fn deliver_remote(&self, bus_frame: &BusFrame) -> usize {
        if bus_frame.origin == self.node_id {
            return 0;
        }
        match self.room(&bus_frame.room_id) {
            Some(room) => {
                let state = room.state.lock();
                room.fan_out(&state, &bus_frame.frame, bus_frame.exclude)
            }
            None => 0,
        }
    }

    /// Relay bus frames into local rooms until the bus closes.
    pub fn spawn_relay(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.bus.subscribe()?;
        let registry = self.clone();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bus_frame) => {
                        registry.deliver_remote(&bus_frame);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Room bus relay lagged, skipped {skipped} frames");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Push `frame` to every local connection of `user_id`, in any room.
    pub fn send_to_user(&self, user_id: &str, frame: &Frame) -> usize {
        let mut delivered = 0;
        for room in self.all_rooms() {
            let state = room.state.lock();
            for handle in state.members.values() {
                if handle.user_id() == user_id {
                    delivered += room.deliver(handle, frame.clone());
                }
            }
        }
        delivered
    }

    /// Send `frame` to one member only.
    pub fn send_to(&self, handle: &ConnectionHandle, frame: Frame) -> usize {
        match self.room(&handle.artifact_id) {
            Some(room) => room.deliver(handle, frame),
            None => usize::from(handle.send(frame) != PushOutcome::Closed),
        }
    }

    // ── Presence updates ──

    /// Run `f` on the room holding `handle`, if the handle is still a member.
    fn with_member<R>(
        &self,
        handle: &ConnectionHandle,
        f: impl FnOnce(&Room, &mut RoomState, Instant) -> R,
    ) -> Option<R> {
        let room = self.room(&handle.artifact_id)?;
        let mut state = room.state.lock();
        if !state.members.contains_key(&handle.id) {
            return None;
        }
        Some(f(&room, &mut state, Instant::now()))
    }

    /// Record inbound activity; broadcasts `presence_update` when the
    /// connection comes back from `away`.
    pub fn touch(&self, handle: &ConnectionHandle) {
        self.with_member(handle, |room, state, now| {
            if let Some(presence) = state.presence.touch(&handle.id, now, now_millis()) {
                let update =
                    Envelope::from_user(kinds::PRESENCE_UPDATE, handle.user_id(), presence.to_value());
                self.emit(room, state, update.into_frame(), None);
            }
        });
    }

    /// Apply a cursor move; the broadcast is debounced per connection.
    pub fn update_cursor(&self, handle: &ConnectionHandle, cursor: Cursor, timestamp: u64) -> bool {
        self.with_member(handle, |room, state, now| {
            let applied = state
                .presence
                .get_mut(&handle.id)
                .is_some_and(|p| p.update_cursor(cursor, timestamp));
            if applied {
                let delta = Envelope::from_user(
                    kinds::CURSOR_MOVE,
                    handle.user_id(),
                    json!({ "connection_id": handle.id.0, "line": cursor.line, "col": cursor.col }),
                );
                self.offer_delta(room, state, handle.id, kinds::CURSOR_MOVE, delta, now);
            }
            applied
        })
        .unwrap_or(false)
    }

    pub fn update_selection(
        &self,
        handle: &ConnectionHandle,
        selection: Option<Selection>,
        timestamp: u64,
    ) -> bool {
        self.with_member(handle, |room, state, now| {
            let applied = state
                .presence
                .get_mut(&handle.id)
                .is_some_and(|p| p.update_selection(selection, timestamp));
            if applied {
                let delta = Envelope::from_user(
                    kinds::SELECTION_CHANGE,
                    handle.user_id(),
                    json!({ "connection_id": handle.id.0, "selection": selection }),
                );
                self.offer_delta(room, state, handle.id, kinds::SELECTION_CHANGE, delta, now);
            }
            applied
        })
        .unwrap_or(false)
    }

    fn offer_delta(
        &self,
        room: &Room,
        state: &mut RoomState,
        connection_id: ConnectionId,
        kind: &'static str,
        delta: Envelope,
        now: Instant,
    ) {
        let offer = state.deltas.offer((connection_id, kind), delta.clone(), now);
        if offer.emit {
            self.emit(room, state, delta.into_frame(), Some(connection_id));
        }
    }

    /// Start or refresh typing. Broadcasts only when newly typing.
    pub fn typing_start(&self, handle: &ConnectionHandle) -> bool {
        self.with_member(handle, |room, state, now| {
            let user_id = handle.user_id().to_string();
            let offer = state.typing.offer(user_id.clone(), (), now);
            if offer.fresh {
                let start = Envelope::from_user(kinds::TYPING_START, &user_id, json!({ "user_id": user_id }));
                self.emit(room, state, start.into_frame(), Some(handle.id));
            }
            offer.fresh
        })
        .unwrap_or(false)
    }

    /// Explicit stop. Broadcasts only if the user was typing.
    pub fn typing_stop(&self, handle: &ConnectionHandle) -> bool {
        self.with_member(handle, |room, state, _now| {
            let user_id = handle.user_id().to_string();
            let was_typing = state.typing.remove(&user_id).is_some();
            if was_typing {
                let stop = Envelope::from_user(kinds::TYPING_STOP, &user_id, json!({ "user_id": user_id }));
                self.emit(room, state, stop.into_frame(), Some(handle.id));
            }
            was_typing
        })
        .unwrap_or(false)
    }

    /// Set or clear the activity label and broadcast the new presence.
    pub fn set_activity(&self, handle: &ConnectionHandle, label: Option<String>) -> bool {
        self.with_member(handle, |room, state, _now| {
            let Some(presence) = state.presence.get_mut(&handle.id) else {
                return false;
            };
            presence.activity_label = label;
            let value = presence.to_value();
            let update = Envelope::from_user(kinds::PRESENCE_UPDATE, handle.user_id(), value);
            self.emit(room, state, update.into_frame(), Some(handle.id));
            true
        })
        .unwrap_or(false)
    }

    // ── Background maintenance ──

    /// Flush trailing cursor/selection deltas whose debounce window closed.
    pub fn flush_debounced(&self, now: Instant) -> usize {
        let mut flushed = 0;
        for room in self.all_rooms() {
            let mut state = room.state.lock();
            for ((connection_id, _), delta) in state.deltas.take_due(now) {
                self.emit(&room, &state, delta.into_frame(), Some(connection_id));
                flushed += 1;
            }
        }
        flushed
    }

    /// Expire typing entries, demote idle presence and evict empty rooms
    /// past the grace period. Every change is broadcast like a
    /// client-triggered one.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for room in self.all_rooms() {
            let mut state = room.state.lock();
            for (user_id, ()) in state.typing.expire(now) {
                let stop = Envelope::system(kinds::TYPING_STOP, json!({ "user_id": user_id }));
                self.emit(&room, &state, stop.into_frame(), None);
                report.typing_expired += 1;
                log::debug!("Typing expired for {user_id} in room {}", room.id);
            }
            for presence in state.presence.demote_idle(now, self.idle_threshold) {
                let update = Envelope::system(kinds::PRESENCE_UPDATE, presence.to_value());
                self.emit(&room, &state, update.into_frame(), None);
                report.demoted += 1;
            }
        }

        let grace = self.grace_period;
        self.rooms.write().retain(|room_id, room| {
            let mut state = room.state.lock();
            let expired = state.members.is_empty()
                && state
                    .empty_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace);
            if expired {
                state.evicted = true;
                report.evicted += 1;
                log::info!("Evicted empty room {room_id}");
            }
            !expired
        });

        report
    }

    // ── Queries ──

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room = self.room(room_id)?;
        let state = room.state.lock();
        let mut typing = state.typing.live_keys(Instant::now());
        typing.sort();
        Some(RoomSnapshot {
            artifact_id: room.id.clone(),
            presence: state.presence.snapshot(),
            typing,
        })
    }

    /// User ids with a live local connection to `room_id`.
    pub fn watchers(&self, room_id: &str) -> HashSet<String> {
        self.room(room_id)
            .map(|room| room.state.lock().presence.user_ids().into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, handle: &ConnectionHandle) -> bool {
        self.room(&handle.artifact_id)
            .is_some_and(|room| room.state.lock().members.contains_key(&handle.id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn connection_count(&self) -> usize {
        self.all_rooms()
            .iter()
            .map(|room| room.state.lock().members.len())
            .sum()
    }

    pub fn stats(&self, room_id: &str) -> Option<RoomStats> {
        let room = self.room(room_id)?;
        let state = room.state.lock();
        Some(RoomStats {
            room_id: room.id.clone(),
            connections: state.members.len(),
            users: state.presence.user_ids().len(),
            frames_sent: room.frames_sent.load(Ordering::Relaxed),
            frames_dropped: room.frames_dropped.load(Ordering::Relaxed),
        })
    }

    /// Close every local connection, e.g. on shutdown.
    pub fn close_all(&self, reason: crate::protocol::CloseReason) {
        for room in self.all_rooms() {
            for handle in room.state.lock().members.values() {
                handle.close(reason);
            }
        }
    }
}
