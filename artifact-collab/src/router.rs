//! Message router: a pure dispatch table from envelope type to effects.
//!
//! Routing validates and decodes the payload but touches no state; the
//! engine applies the returned [`Effect`]s in order. Anything that fails
//! here is answered with an `error` frame to the sender only.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::presence::{Cursor, Selection};
use crate::protocol::{kinds, now_millis, Envelope};

/// Upper bound on comment bodies, in characters.
pub const MAX_COMMENT_CHARS: usize = 10_000;
/// Upper bound on activity labels and emoji keys, in characters.
pub const MAX_LABEL_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    UpdateCursor { cursor: Cursor, timestamp: u64 },
    UpdateSelection { selection: Option<Selection>, timestamp: u64 },
    TypingStart,
    TypingStop,
    SetActivity { label: Option<String> },
    AddComment {
        content: String,
        parent_id: Option<Uuid>,
        /// What the client claims; ignored in favour of server extraction
        claimed_mentions: Vec<String>,
    },
    UpdateComment { comment_id: Uuid, content: String },
    DeleteComment { comment_id: Uuid },
    ReactComment { comment_id: Uuid, emoji: String },
    ResolveComment { comment_id: Uuid, resolved: bool },
    ProposeEdit { base_version: u64, patch: Value },
    MarkRead { notification_id: Uuid },
    MarkAllRead,
    Pong,
}

type Handler = fn(&Envelope) -> Result<Vec<Effect>, ProtocolError>;

const ROUTES: &[(&str, Handler)] = &[
    (kinds::CURSOR_MOVE, route_cursor_move),
    (kinds::SELECTION_CHANGE, route_selection_change),
    (kinds::TYPING_START, route_typing_start),
    (kinds::TYPING_STOP, route_typing_stop),
    (kinds::ACTIVITY_UPDATE, route_activity_update),
    (kinds::COMMENT_ADD, route_comment_add),
    (kinds::COMMENT_UPDATE, route_comment_update),
    (kinds::COMMENT_DELETE, route_comment_delete),
    (kinds::COMMENT_REACT, route_comment_react),
    (kinds::COMMENT_RESOLVE, route_comment_resolve),
    (kinds::ARTIFACT_EDIT, route_artifact_edit),
    (kinds::NOTIFICATION_READ, route_notification_read),
    (kinds::NOTIFICATION_READ_ALL, route_notification_read_all),
    (kinds::PING, route_ping),
];

/// Map one inbound envelope to the effects it requests.
pub fn route(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    ROUTES
        .iter()
        .find(|(kind, _)| *kind == envelope.kind)
        .map(|(_, handler)| handler(envelope))
        .unwrap_or_else(|| Err(ProtocolError::UnknownType(envelope.kind.clone())))
}

/// Envelope types the router accepts.
pub fn routed_kinds() -> impl Iterator<Item = &'static str> {
    ROUTES.iter().map(|(kind, _)| *kind)
}

fn payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ProtocolError> {
    T::deserialize(&envelope.data).map_err(|e| ProtocolError::invalid(&envelope.kind, e.to_string()))
}

fn timestamp(envelope: &Envelope) -> u64 {
    envelope.timestamp.unwrap_or_else(now_millis)
}

fn bounded_text(kind: &str, text: String, max: usize) -> Result<String, ProtocolError> {
    if text.trim().is_empty() {
        return Err(ProtocolError::invalid(kind, "content must not be empty"));
    }
    if text.chars().count() > max {
        return Err(ProtocolError::invalid(kind, format!("content exceeds {max} characters")));
    }
    Ok(text)
}

fn route_cursor_move(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    let cursor: Cursor = payload(envelope)?;
    Ok(vec![Effect::UpdateCursor {
        cursor,
        timestamp: timestamp(envelope),
    }])
}

fn route_selection_change(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(default)]
        start: Option<Cursor>,
        #[serde(default)]
        end: Option<Cursor>,
    }
    let p: Payload = payload(envelope)?;
    let selection = match (p.start, p.end) {
        (Some(start), Some(end)) => Some(Selection { start, end }),
        (None, None) => None,
        _ => {
            return Err(ProtocolError::invalid(
                &envelope.kind,
                "selection needs both start and end",
            ))
        }
    };
    Ok(vec![Effect::UpdateSelection {
        selection,
        timestamp: timestamp(envelope),
    }])
}

fn route_typing_start(_: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    Ok(vec![Effect::TypingStart])
}

fn route_typing_stop(_: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    Ok(vec![Effect::TypingStop])
}

fn route_activity_update(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(default)]
        label: Option<String>,
    }
    let p: Payload = payload(envelope)?;
    let label = match p.label.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) {
        Some(l) if l.chars().count() > MAX_LABEL_CHARS => {
            return Err(ProtocolError::invalid(&envelope.kind, "label too long"))
        }
        other => other,
    };
    Ok(vec![Effect::SetActivity { label }])
}

fn route_comment_add(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        content: String,
        #[serde(default)]
        parent_id: Option<Uuid>,
        #[serde(default)]
        mentions: Vec<String>,
    }
    let p: Payload = payload(envelope)?;
    Ok(vec![Effect::AddComment {
        content: bounded_text(&envelope.kind, p.content, MAX_COMMENT_CHARS)?,
        parent_id: p.parent_id,
        claimed_mentions: p.mentions,
    }])
}

fn route_comment_update(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        comment_id: Uuid,
        content: String,
    }
    let p: Payload = payload(envelope)?;
    Ok(vec![Effect::UpdateComment {
        comment_id: p.comment_id,
        content: bounded_text(&envelope.kind, p.content, MAX_COMMENT_CHARS)?,
    }])
}

#[derive(Deserialize)]
struct CommentRef {
    comment_id: Uuid,
}

fn route_comment_delete(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    let p: CommentRef = payload(envelope)?;
    Ok(vec![Effect::DeleteComment {
        comment_id: p.comment_id,
    }])
}

fn route_comment_react(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        comment_id: Uuid,
        emoji: String,
    }
    let p: Payload = payload(envelope)?;
    Ok(vec![Effect::ReactComment {
        comment_id: p.comment_id,
        emoji: bounded_text(&envelope.kind, p.emoji, MAX_LABEL_CHARS)?,
    }])
}

fn route_comment_resolve(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        comment_id: Uuid,
        #[serde(default = "default_true")]
        resolved: bool,
    }
    let p: Payload = payload(envelope)?;
    Ok(vec![Effect::ResolveComment {
        comment_id: p.comment_id,
        resolved: p.resolved,
    }])
}

fn default_true() -> bool {
    true
}

fn route_artifact_edit(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        base_version: u64,
        patch: Value,
    }
    let p: Payload = payload(envelope)?;
    Ok(vec![Effect::ProposeEdit {
        base_version: p.base_version,
        patch: p.patch,
    }])
}

fn route_notification_read(envelope: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    #[derive(Deserialize)]
    struct Payload {
        id: Uuid,
    }
    let p: Payload = payload(envelope)?;
    Ok(vec![Effect::MarkRead {
        notification_id: p.id,
    }])
}

fn route_notification_read_all(_: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    Ok(vec![Effect::MarkAllRead])
}

fn route_ping(_: &Envelope) -> Result<Vec<Effect>, ProtocolError> {
    Ok(vec![Effect::Pong])
}
