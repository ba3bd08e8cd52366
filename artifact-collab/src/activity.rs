//! Append-only activity log.
//!
//! Records are written through the durable store and never mutated or
//! deleted afterwards. Private records (moderation actions) are visible
//! only to their actor and to elevated roles.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::collaborators::UserIdentity;
use crate::error::StoreError;
use crate::model::{Activity, ActivityKind, Visibility};
use crate::protocol::now_millis;
use crate::storage::DurableStore;

pub struct ActivityLog {
    store: Arc<dyn DurableStore>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Build an unsaved record stamped with the current time.
    pub fn entry(
        artifact_id: &str,
        kind: ActivityKind,
        actor: &str,
        description: impl Into<String>,
        data: Value,
        visibility: Visibility,
    ) -> Activity {
        Activity {
            id: Uuid::new_v4(),
            artifact_id: artifact_id.to_string(),
            kind,
            actor: actor.to_string(),
            description: description.into(),
            data,
            timestamp: now_millis(),
            visibility,
        }
    }

    pub async fn append(&self, activity: &Activity) -> Result<(), StoreError> {
        self.store.append_activity(activity).await?;
        log::debug!(
            "Activity {:?} by {} on {}",
            activity.kind,
            activity.actor,
            activity.artifact_id
        );
        Ok(())
    }

    /// Newest `limit` records visible to `viewer`, oldest first.
    pub async fn recent(
        &self,
        artifact_id: &str,
        limit: usize,
        viewer: Option<&UserIdentity>,
    ) -> Result<Vec<Activity>, StoreError> {
        // Over-fetch so that hidden private records do not shrink the page.
        let fetched = self.store.recent_activities(artifact_id, limit.saturating_mul(2)).await?;
        let mut visible: Vec<Activity> = fetched
            .into_iter()
            .filter(|a| visible_to(a, viewer))
            .collect();
        let excess = visible.len().saturating_sub(limit);
        visible.drain(..excess);
        Ok(visible)
    }
}

fn visible_to(activity: &Activity, viewer: Option<&UserIdentity>) -> bool {
    match activity.visibility {
        Visibility::Public => true,
        Visibility::Private => {
            viewer.is_some_and(|v| v.user_id == activity.actor || v.role.is_elevated())
        }
    }
}
