//! Durable records produced by the engine.
//!
//! Comments, activities, notifications and version markers are owned by the
//! durable store collaborator; the engine is the only writer path for
//! mutations that originate in a live room.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A threaded comment on an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub artifact_id: String,
    pub parent_id: Option<Uuid>,
    pub content: String,
    /// Author user id
    pub author: String,
    /// Mentioned user ids, extracted server-side from `content`
    pub mentions: Vec<String>,
    /// emoji → user ids
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    pub created_at: u64,
    pub updated_at: u64,
    pub edited: bool,
    pub resolved: bool,
    /// Tombstone kept so that existing replies stay attached
    pub deleted: bool,
}

/// Placeholder content of a tombstoned comment.
pub const DELETED_PLACEHOLDER: &str = "[deleted]";

impl Comment {
    /// A live (non-tombstoned) comment can be replied to and mutated.
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    pub fn tombstone(&mut self, now: u64) {
        self.content = DELETED_PLACEHOLDER.to_string();
        self.mentions.clear();
        self.reactions.clear();
        self.deleted = true;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CommentAdded,
    CommentEdited,
    CommentDeleted,
    CommentReacted,
    CommentResolved,
    ArtifactEdited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to everyone with access to the artifact
    Public,
    /// Visible to the actor and moderators only
    Private,
}

/// Append-only audit record. Never mutated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub artifact_id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub actor: String,
    pub description: String,
    pub data: Value,
    pub timestamp: u64,
    pub visibility: Visibility,
}

/// Ordering only; no priority is ever dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Mention,
    Reply,
    Comment,
    Edit,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub priority: Priority,
    pub read: bool,
    pub read_at: Option<u64>,
    pub payload: Value,
    pub actor: String,
    pub artifact_id: String,
    pub created_at: u64,
    /// Number of events folded into this notification
    pub count: u32,
}

/// Record of one accepted artifact edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub artifact_id: String,
    pub version_no: u64,
    pub editor: String,
    pub timestamp: u64,
    pub base_version: u64,
}
