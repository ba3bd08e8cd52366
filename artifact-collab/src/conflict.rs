//! Optimistic concurrency for artifact edits.
//!
//! An edit names the version it was made against. Proposals for the same
//! artifact are serialized; the first one whose base matches the current
//! version wins and bumps it, every other one is rejected with the current
//! state so the client can rebase. Edits are never merged here.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::activity::ActivityLog;
use crate::collaborators::UserIdentity;
use crate::error::{Result, StoreError};
use crate::keyed::KeyedLocks;
use crate::model::{ActivityKind, VersionMarker, Visibility};
use crate::protocol::now_millis;
use crate::storage::{ArtifactStorage, DurableStore};

#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Accepted(VersionMarker),
    /// Stale base; nothing was written.
    Rejected {
        current_version: u64,
        current_content: Value,
    },
}

pub struct ConflictResolver {
    artifacts: Arc<dyn ArtifactStorage>,
    store: Arc<dyn DurableStore>,
    activity: Arc<ActivityLog>,
    locks: KeyedLocks,
}

impl ConflictResolver {
    pub fn new(
        artifacts: Arc<dyn ArtifactStorage>,
        store: Arc<dyn DurableStore>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            artifacts,
            store,
            activity,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn propose_edit(
        &self,
        user: &UserIdentity,
        artifact_id: &str,
        base_version: u64,
        patch: &Value,
    ) -> Result<EditOutcome> {
        let _guard = self.locks.acquire(artifact_id).await;

        let (current_version, current_content) = self.artifacts.get_version(artifact_id).await?;
        if base_version != current_version {
            log::debug!(
                "Rejected edit on {artifact_id} by {}: base {base_version}, current {current_version}",
                user.user_id
            );
            return Ok(EditOutcome::Rejected {
                current_version,
                current_content,
            });
        }

        let version_no = match self.artifacts.commit_edit(artifact_id, base_version, patch).await {
            Ok(version_no) => version_no,
            // Another writer committed between the check and the commit.
            Err(StoreError::StaleVersion { stored, .. }) => {
                log::debug!(
                    "Commit race on {artifact_id} by {}: base {base_version}, stored {stored}",
                    user.user_id
                );
                let (current_version, current_content) =
                    self.artifacts.get_version(artifact_id).await?;
                return Ok(EditOutcome::Rejected {
                    current_version,
                    current_content,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let marker = VersionMarker {
            artifact_id: artifact_id.to_string(),
            version_no,
            editor: user.user_id.clone(),
            timestamp: now_millis(),
            base_version,
        };

        // The edit is committed at this point; history and audit are best effort.
        if let Err(e) = self.store.record_version(&marker).await {
            log::warn!("Failed to record version {version_no} of {artifact_id}: {e}");
        }
        let activity = ActivityLog::entry(
            artifact_id,
            ActivityKind::ArtifactEdited,
            &user.user_id,
            format!("edited the artifact (v{version_no})"),
            json!({ "version": version_no, "base_version": base_version }),
            Visibility::Public,
        );
        if let Err(e) = self.activity.append(&activity).await {
            log::warn!("Failed to log edit of {artifact_id}: {e}");
        }

        log::info!("Artifact {artifact_id} at v{version_no} by {}", user.user_id);
        Ok(EditOutcome::Accepted(marker))
    }

    /// Accepted versions of `artifact_id`, oldest first.
    pub async fn history(&self, artifact_id: &str) -> Result<Vec<VersionMarker>> {
        Ok(self.store.versions(artifact_id).await?)
    }

    pub async fn current_version(&self, artifact_id: &str) -> Result<u64> {
        Ok(self.artifacts.get_version(artifact_id).await?.0)
    }
}
