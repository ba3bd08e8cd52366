//! Presence store: per-room table of connected users and their transient
//! state.
//!
//! One [`UserPresence`] per live connection (a user with two tabs has two
//! entries). Entries are created on join and removed on disconnect; there
//! is no lingering `offline` entry.
//!
//! ```text
//! inbound cursor_move ──► PresenceTable::update_cursor ──► highest timestamp wins
//! presence sweep      ──► PresenceTable::demote_idle   ──► active → away
//! user message        ──► PresenceTable::touch         ──► away → active
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::collaborators::UserIdentity;
use crate::connection::ConnectionId;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Away,
    /// Terminal; reported in `user_leave` only.
    Offline,
}

/// Caret position in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: Cursor,
    pub end: Cursor,
}

/// One connection's presence.
#[derive(Debug, Clone, Serialize)]
pub struct UserPresence {
    pub connection_id: Uuid,
    pub user_id: String,
    /// `{ username, display_name }`
    pub display: Value,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    pub activity_label: Option<String>,
    pub status: PresenceStatus,
    /// Last application message, ms since epoch
    pub last_seen: u64,

    #[serde(skip)]
    cursor_ts: u64,
    #[serde(skip)]
    selection_ts: u64,
    #[serde(skip)]
    last_active: Instant,
}

impl UserPresence {
    pub fn new(connection_id: ConnectionId, identity: &UserIdentity, now: Instant, now_ms: u64) -> Self {
        Self {
            connection_id: connection_id.0,
            user_id: identity.user_id.clone(),
            display: json!({
                "username": identity.username,
                "display_name": identity.display_name,
            }),
            cursor: None,
            selection: None,
            activity_label: None,
            status: PresenceStatus::Active,
            last_seen: now_ms,
            cursor_ts: 0,
            selection_ts: 0,
            last_active: now,
        }
    }

    /// Apply a cursor update unless a newer one was already applied.
    pub fn update_cursor(&mut self, cursor: Cursor, timestamp: u64) -> bool {
        if timestamp < self.cursor_ts {
            return false;
        }
        self.cursor = Some(cursor);
        self.cursor_ts = timestamp;
        true
    }

    pub fn update_selection(&mut self, selection: Option<Selection>, timestamp: u64) -> bool {
        if timestamp < self.selection_ts {
            return false;
        }
        self.selection = selection;
        self.selection_ts = timestamp;
        true
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence table
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PresenceTable {
    entries: HashMap<ConnectionId, UserPresence>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection_id: ConnectionId, presence: UserPresence) {
        self.entries.insert(connection_id, presence);
    }

    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<UserPresence> {
        self.entries.remove(connection_id)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&UserPresence> {
        self.entries.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &ConnectionId) -> Option<&mut UserPresence> {
        self.entries.get_mut(connection_id)
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.entries.contains_key(connection_id)
    }

    /// Whether any connection of `user_id` is present.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.entries.values().any(|p| p.user_id == user_id)
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.values().map(|p| p.user_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Stable-ordered copy of every entry.
    pub fn snapshot(&self) -> Vec<UserPresence> {
        let mut all: Vec<UserPresence> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        all
    }

    /// Record user activity. Returns the entry if it came back from `away`.
    pub fn touch(
        &mut self,
        connection_id: &ConnectionId,
        now: Instant,
        now_ms: u64,
    ) -> Option<UserPresence> {
        let presence = self.entries.get_mut(connection_id)?;
        presence.last_active = now;
        presence.last_seen = now_ms;
        if presence.status == PresenceStatus::Away {
            presence.status = PresenceStatus::Active;
            return Some(presence.clone());
        }
        None
    }

    /// Demote `active` entries idle for longer than `threshold`.
    pub fn demote_idle(&mut self, now: Instant, threshold: Duration) -> Vec<UserPresence> {
        let mut demoted = Vec::new();
        for presence in self.entries.values_mut() {
            if presence.status == PresenceStatus::Active
                && now.saturating_duration_since(presence.last_active) >= threshold
            {
                presence.status = PresenceStatus::Away;
                demoted.push(presence.clone());
            }
        }
        demoted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
