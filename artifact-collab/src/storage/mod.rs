//! Storage collaborators.
//!
//! ```text
//! ┌──────────────────┐   comments / activities   ┌──────────────┐
//! │ CommentEngine    │ ────────────────────────► │ DurableStore │
//! │ Dispatcher       │   notifications           │ (Memory,     │
//! │ ConflictResolver │   version markers         │  RocksDB)    │
//! └────────┬─────────┘                           └──────────────┘
//!          │ get_version / commit_edit
//!          ▼
//! ┌──────────────────┐
//! │ ArtifactStorage  │  artifact content, owned outside the engine
//! └──────────────────┘
//! ```
//!
//! The engine only ever broadcasts after these calls succeed.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Activity, Comment, Notification, VersionMarker};

pub use memory::{MemoryArtifacts, MemoryStore};
pub use rocks::{RocksConfig, RocksStore};

/// CRUD for the records the engine produces.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ── Comments ──

    async fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError>;
    async fn update_comment(&self, comment: &Comment) -> Result<(), StoreError>;
    async fn delete_comment(&self, artifact_id: &str, comment_id: Uuid) -> Result<(), StoreError>;
    async fn get_comment(
        &self,
        artifact_id: &str,
        comment_id: Uuid,
    ) -> Result<Option<Comment>, StoreError>;
    /// All comments of an artifact, oldest first.
    async fn list_comments(&self, artifact_id: &str) -> Result<Vec<Comment>, StoreError>;

    // ── Activity log (append-only) ──

    async fn append_activity(&self, activity: &Activity) -> Result<(), StoreError>;
    /// The newest `limit` activities, returned oldest first.
    async fn recent_activities(
        &self,
        artifact_id: &str,
        limit: usize,
    ) -> Result<Vec<Activity>, StoreError>;

    // ── Notifications ──

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError>;
    async fn update_notification(&self, notification: &Notification) -> Result<(), StoreError>;
    async fn get_notification(
        &self,
        recipient: &str,
        id: Uuid,
    ) -> Result<Option<Notification>, StoreError>;
    /// All notifications of a recipient in creation order.
    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError>;

    async fn unread_count(&self, recipient: &str) -> Result<u64, StoreError> {
        let all = self.list_notifications(recipient).await?;
        Ok(all.iter().filter(|n| !n.read).count() as u64)
    }

    // ── Version markers ──

    async fn record_version(&self, marker: &VersionMarker) -> Result<(), StoreError>;
    async fn versions(&self, artifact_id: &str) -> Result<Vec<VersionMarker>, StoreError>;
}

/// Artifact content store consulted by the conflict resolver.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Current `(version_no, content)`. Unknown artifacts start at version 1
    /// with empty content.
    async fn get_version(&self, artifact_id: &str) -> Result<(u64, Value), StoreError>;

    /// Apply `patch` on top of `version_no`; returns the new version number.
    /// Fails with [`StoreError::StaleVersion`] when `version_no` is no
    /// longer current, e.g. after a commit from another process.
    async fn commit_edit(
        &self,
        artifact_id: &str,
        version_no: u64,
        patch: &Value,
    ) -> Result<u64, StoreError>;
}

/// RFC 7386 JSON merge patch: objects merge recursively, `null` removes a
/// key, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}
