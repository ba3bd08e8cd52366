//! JSON wire protocol.
//!
//! Every frame in both directions is one envelope:
//! ```text
//! { "type": "cursor_move", "data": { "line": 3, "col": 1 }, "timestamp": 1700000000000 }
//! ```
//! Server→client broadcasts additionally carry `user_id` naming the
//! originator. System-generated events (sweep-triggered `typing_stop`,
//! idle demotion) omit it.
//!
//! Outbound envelopes are encoded once into a [`Frame`] and the same
//! `Arc<str>` is handed to every recipient's queue.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{CollabError, ProtocolError};

/// Envelope type names.
pub mod kinds {
    // client → server
    pub const CURSOR_MOVE: &str = "cursor_move";
    pub const SELECTION_CHANGE: &str = "selection_change";
    pub const TYPING_START: &str = "typing_start";
    pub const TYPING_STOP: &str = "typing_stop";
    pub const ACTIVITY_UPDATE: &str = "activity_update";
    pub const COMMENT_ADD: &str = "comment_add";
    pub const COMMENT_UPDATE: &str = "comment_update";
    pub const COMMENT_DELETE: &str = "comment_delete";
    pub const COMMENT_REACT: &str = "comment_react";
    pub const COMMENT_RESOLVE: &str = "comment_resolve";
    pub const ARTIFACT_EDIT: &str = "artifact_edit";
    pub const NOTIFICATION_READ: &str = "notification_read";
    pub const NOTIFICATION_READ_ALL: &str = "notification_read_all";
    pub const PING: &str = "ping";

    // server → client
    pub const ROOM_STATE: &str = "room_state";
    pub const USER_JOIN: &str = "user_join";
    pub const USER_LEAVE: &str = "user_leave";
    pub const PRESENCE_UPDATE: &str = "presence_update";
    pub const COMMENT_ADDED: &str = "comment_added";
    pub const COMMENT_UPDATED: &str = "comment_updated";
    pub const COMMENT_DELETED: &str = "comment_deleted";
    pub const EDIT_REJECTED: &str = "edit_rejected";
    pub const NOTIFICATION: &str = "notification";
    pub const UNREAD_COUNT: &str = "unread_count";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}

/// The typed message unit exchanged over the duplex connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    /// A server-generated event with no originating user.
    pub fn system(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Some(now_millis()),
            user_id: None,
        }
    }

    /// A broadcast attributed to `user_id`.
    pub fn from_user(kind: &str, user_id: &str, data: Value) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::system(kind, data)
        }
    }

    /// An `error` frame for the sender only.
    pub fn error(err: &CollabError) -> Self {
        Self::system(
            kinds::ERROR,
            json!({ "code": err.code(), "message": err.to_string() }),
        )
    }

    /// Parse an inbound text frame.
    ///
    /// `data` must be a JSON object (or absent, which is treated as `{}`).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if envelope.kind.is_empty() {
            return Err(ProtocolError::Malformed("empty type".into()));
        }
        match envelope.data {
            Value::Object(_) => {}
            Value::Null => envelope.data = empty_object(),
            _ => return Err(ProtocolError::Malformed("data must be an object".into())),
        }
        // Originator is assigned by the server, never trusted from the wire.
        envelope.user_id = None;
        Ok(envelope)
    }

    /// Encode once for fan-out.
    pub fn into_frame(self) -> Frame {
        let class = DeliveryClass::for_kind(&self.kind);
        // A Value-backed struct always serializes.
        let text = serde_json::to_string(&self).unwrap_or_else(|_| String::from("{}"));
        Frame {
            kind: Arc::from(self.kind.as_str()),
            text: Arc::from(text),
            class,
        }
    }
}

/// Whether a frame may be shed under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Presence deltas; superseded by the next update.
    Droppable,
    /// Comment mutations, edits, joins/leaves, errors.
    Critical,
}

impl DeliveryClass {
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            kinds::CURSOR_MOVE
            | kinds::SELECTION_CHANGE
            | kinds::TYPING_START
            | kinds::PRESENCE_UPDATE
            | kinds::PONG => Self::Droppable,
            _ => Self::Critical,
        }
    }
}

/// A pre-encoded outbound envelope.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: Arc<str>,
    pub text: Arc<str>,
    pub class: DeliveryClass,
}

/// Reason codes sent in the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HeartbeatTimeout,
    SlowConsumer,
    ProtocolViolation,
    ServerShutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::HeartbeatTimeout => 4000,
            Self::SlowConsumer => 4001,
            Self::ProtocolViolation => 4002,
            Self::ServerShutdown => 1001,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SlowConsumer => "outbound queue overflow",
            Self::ProtocolViolation => "too many protocol errors",
            Self::ServerShutdown => "server shutting down",
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
