//! In-memory collaborators for single-process deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::{merge_patch, ArtifactStorage, DurableStore};
use crate::error::StoreError;
use crate::model::{Activity, Comment, Notification, VersionMarker};

#[derive(Default)]
struct Tables {
    /// Insertion-ordered per artifact
    comments: HashMap<String, Vec<Comment>>,
    activities: HashMap<String, Vec<Activity>>,
    notifications: HashMap<String, Vec<Notification>>,
    versions: HashMap<String, Vec<VersionMarker>>,
}

/// Durable store kept in process memory.
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], which is how tests exercise the
/// "persist before broadcast" rule.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    /// Every activity of an artifact, oldest first.
    pub fn all_activities(&self, artifact_id: &str) -> Vec<Activity> {
        self.tables
            .read()
            .activities
            .get(artifact_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.check()?;
        self.tables
            .write()
            .comments
            .entry(comment.artifact_id.clone())
            .or_default()
            .push(comment.clone());
        Ok(())
    }

    async fn update_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let slot = tables
            .comments
            .get_mut(&comment.artifact_id)
            .and_then(|all| all.iter_mut().find(|c| c.id == comment.id));
        match slot {
            Some(existing) => {
                *existing = comment.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!("comment {} missing", comment.id))),
        }
    }

    async fn delete_comment(&self, artifact_id: &str, comment_id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        if let Some(all) = self.tables.write().comments.get_mut(artifact_id) {
            all.retain(|c| c.id != comment_id);
        }
        Ok(())
    }

    async fn get_comment(
        &self,
        artifact_id: &str,
        comment_id: Uuid,
    ) -> Result<Option<Comment>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .comments
            .get(artifact_id)
            .and_then(|all| all.iter().find(|c| c.id == comment_id).cloned()))
    }

    async fn list_comments(&self, artifact_id: &str) -> Result<Vec<Comment>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .comments
            .get(artifact_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        self.check()?;
        self.tables
            .write()
            .activities
            .entry(activity.artifact_id.clone())
            .or_default()
            .push(activity.clone());
        Ok(())
    }

    async fn recent_activities(
        &self,
        artifact_id: &str,
        limit: usize,
    ) -> Result<Vec<Activity>, StoreError> {
        self.check()?;
        let tables = self.tables.read();
        let all = tables.activities.get(artifact_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(all[all.len().saturating_sub(limit)..].to_vec())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.check()?;
        self.tables
            .write()
            .notifications
            .entry(notification.recipient.clone())
            .or_default()
            .push(notification.clone());
        Ok(())
    }

    async fn update_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let slot = tables
            .notifications
            .get_mut(&notification.recipient)
            .and_then(|all| all.iter_mut().find(|n| n.id == notification.id));
        match slot {
            Some(existing) => {
                *existing = notification.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!(
                "notification {} missing",
                notification.id
            ))),
        }
    }

    async fn get_notification(
        &self,
        recipient: &str,
        id: Uuid,
    ) -> Result<Option<Notification>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .notifications
            .get(recipient)
            .and_then(|all| all.iter().find(|n| n.id == id).cloned()))
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .notifications
            .get(recipient)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_version(&self, marker: &VersionMarker) -> Result<(), StoreError> {
        self.check()?;
        self.tables
            .write()
            .versions
            .entry(marker.artifact_id.clone())
            .or_default()
            .push(marker.clone());
        Ok(())
    }

    async fn versions(&self, artifact_id: &str) -> Result<Vec<VersionMarker>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .versions
            .get(artifact_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Artifact content held in memory; patches are JSON merge patches.
pub struct MemoryArtifacts {
    artifacts: RwLock<HashMap<String, (u64, Value)>>,
    available: AtomicBool,
}

impl Default for MemoryArtifacts {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self {
            artifacts: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Seed an artifact at a given version.
    pub fn insert(&self, artifact_id: &str, version_no: u64, content: Value) {
        self.artifacts
            .write()
            .insert(artifact_id.to_string(), (version_no, content));
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("artifact storage offline".into()))
        }
    }
}

#[async_trait]
impl ArtifactStorage for MemoryArtifacts {
    async fn get_version(&self, artifact_id: &str) -> Result<(u64, Value), StoreError> {
        self.check()?;
        Ok(self
            .artifacts
            .read()
            .get(artifact_id)
            .cloned()
            .unwrap_or((1, Value::Object(serde_json::Map::new()))))
    }

    async fn commit_edit(
        &self,
        artifact_id: &str,
        version_no: u64,
        patch: &Value,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let mut artifacts = self.artifacts.write();
        let entry = artifacts
            .entry(artifact_id.to_string())
            .or_insert_with(|| (1, Value::Object(serde_json::Map::new())));
        if entry.0 != version_no {
            return Err(StoreError::StaleVersion {
                artifact_id: artifact_id.to_string(),
                base: version_no,
                stored: entry.0,
            });
        }
        merge_patch(&mut entry.1, patch);
        entry.0 += 1;
        Ok(entry.0)
    }
}
