//! Threaded comments.
//!
//! Every successful mutation is persisted, then logged as exactly one
//! activity, and only then returned to the caller for broadcast. If the
//! activity append fails the comment write is rolled back so the log never
//! lags behind what was broadcast.
//!
//! Deletion policy: a comment that still has replies becomes a tombstone
//! (content replaced by [`DELETED_PLACEHOLDER`], mentions and reactions
//! cleared) so the thread stays intact; a comment without replies is
//! removed. Tombstones cannot be replied to, edited, reacted to or resolved.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::collaborators::{Authorizer, UserDirectory, UserIdentity};
use crate::error::{CollabError, Result, StoreError};
use crate::keyed::KeyedLocks;
use crate::mentions::extract_mentions;
use crate::model::{Activity, ActivityKind, Comment, Visibility, DELETED_PLACEHOLDER};
use crate::protocol::now_millis;
use crate::storage::DurableStore;

/// How a deletion was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Replaced by a placeholder; replies remain attached.
    Tombstoned,
    Removed,
}

impl DeleteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteMode::Tombstoned => "tombstoned",
            DeleteMode::Removed => "removed",
        }
    }
}

/// A persisted and logged comment mutation.
#[derive(Debug, Clone)]
pub struct CommentChange {
    /// State after the mutation (the last state for a removal)
    pub comment: Comment,
    pub activity: Activity,
    /// Users mentioned by this mutation who were not mentioned before
    pub new_mentions: Vec<String>,
    /// Author of the parent, for replies
    pub parent_author: Option<String>,
    pub delete_mode: Option<DeleteMode>,
}

pub struct CommentEngine {
    store: Arc<dyn DurableStore>,
    activity: Arc<ActivityLog>,
    authorizer: Arc<dyn Authorizer>,
    directory: Arc<dyn UserDirectory>,
    locks: KeyedLocks,
}

impl CommentEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        activity: Arc<ActivityLog>,
        authorizer: Arc<dyn Authorizer>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            store,
            activity,
            authorizer,
            directory,
            locks: KeyedLocks::new(),
        }
    }

    async fn mentions_in(&self, content: &str) -> Vec<String> {
        let known = self.directory.known_users().await;
        extract_mentions(content, &known)
    }

    async fn load_live(&self, artifact_id: &str, comment_id: Uuid) -> Result<Comment> {
        match self.store.get_comment(artifact_id, comment_id).await? {
            Some(comment) if comment.is_live() => Ok(comment),
            _ => Err(CollabError::not_found("comment", comment_id)),
        }
    }

    async fn authorize(&self, user: &UserIdentity, comment: &Comment) -> Result<()> {
        if self.authorizer.can_mutate(user, comment).await {
            Ok(())
        } else {
            Err(CollabError::Forbidden(format!(
                "{} may not modify comment {}",
                user.user_id, comment.id
            )))
        }
    }

    /// Append the activity for a write that already happened, undoing the
    /// write with `rollback` if the append fails. `rollback` is only polled
    /// on failure.
    async fn log_or_rollback(
        &self,
        activity: Activity,
        rollback: impl Future<Output = std::result::Result<(), StoreError>>,
    ) -> Result<Activity> {
        if let Err(e) = self.activity.append(&activity).await {
            log::error!("Activity append failed for {}: {e}", activity.artifact_id);
            if let Err(rb) = rollback.await {
                log::error!("Rollback failed for {}: {rb}", activity.artifact_id);
            }
            return Err(e.into());
        }
        Ok(activity)
    }

    /// Create a comment or reply.
    ///
    /// `_claimed_mentions` is accepted for interface parity and ignored:
    /// mentions are always extracted from `content`.
    pub async fn add(
        &self,
        user: &UserIdentity,
        artifact_id: &str,
        content: &str,
        parent_id: Option<Uuid>,
        _claimed_mentions: &[String],
    ) -> Result<CommentChange> {
        let _guard = self.locks.acquire(artifact_id).await;

        let parent = match parent_id {
            Some(id) => Some(self.load_live(artifact_id, id).await?),
            None => None,
        };

        let now = now_millis();
        let comment = Comment {
            id: Uuid::new_v4(),
            artifact_id: artifact_id.to_string(),
            parent_id,
            content: content.to_string(),
            author: user.user_id.clone(),
            mentions: self.mentions_in(content).await,
            reactions: Default::default(),
            created_at: now,
            updated_at: now,
            edited: false,
            resolved: false,
            deleted: false,
        };
        self.store.insert_comment(&comment).await?;

        let description = if parent.is_some() {
            "replied to a comment"
        } else {
            "added a comment"
        };
        let activity = ActivityLog::entry(
            artifact_id,
            ActivityKind::CommentAdded,
            &user.user_id,
            description,
            json!({ "comment_id": comment.id, "parent_id": parent_id }),
            Visibility::Public,
        );
        let activity = self
            .log_or_rollback(activity, self.store.delete_comment(artifact_id, comment.id))
            .await?;

        log::info!("Comment {} added to {} by {}", comment.id, artifact_id, user.user_id);
        Ok(CommentChange {
            new_mentions: comment.mentions.clone(),
            parent_author: parent.map(|p| p.author),
            comment,
            activity,
            delete_mode: None,
        })
    }

    pub async fn update(
        &self,
        user: &UserIdentity,
        artifact_id: &str,
        comment_id: Uuid,
        content: &str,
    ) -> Result<CommentChange> {
        let _guard = self.locks.acquire(artifact_id).await;
        let before = self.load_live(artifact_id, comment_id).await?;
        self.authorize(user, &before).await?;

        let mut comment = before.clone();
        comment.content = content.to_string();
        comment.mentions = self.mentions_in(content).await;
        comment.edited = true;
        comment.updated_at = now_millis();
        self.store.update_comment(&comment).await?;

        let activity = ActivityLog::entry(
            artifact_id,
            ActivityKind::CommentEdited,
            &user.user_id,
            "edited a comment",
            json!({ "comment_id": comment_id }),
            visibility_for(user, &before),
        );
        let activity = self
            .log_or_rollback(activity, self.store.update_comment(&before))
            .await?;

        let new_mentions = comment
            .mentions
            .iter()
            .filter(|m| !before.mentions.contains(m))
            .cloned()
            .collect();
        Ok(CommentChange {
            comment,
            activity,
            new_mentions,
            parent_author: None,
            delete_mode: None,
        })
    }

    pub async fn delete(
        &self,
        user: &UserIdentity,
        artifact_id: &str,
        comment_id: Uuid,
    ) -> Result<CommentChange> {
        let _guard = self.locks.acquire(artifact_id).await;
        let before = self.load_live(artifact_id, comment_id).await?;
        self.authorize(user, &before).await?;

        let has_replies = self
            .store
            .list_comments(artifact_id)
            .await?
            .iter()
            .any(|c| c.parent_id == Some(comment_id));

        let (comment, mode) = if has_replies {
            let mut tombstone = before.clone();
            tombstone.tombstone(now_millis());
            self.store.update_comment(&tombstone).await?;
            (tombstone, DeleteMode::Tombstoned)
        } else {
            self.store.delete_comment(artifact_id, comment_id).await?;
            (before.clone(), DeleteMode::Removed)
        };

        let activity = ActivityLog::entry(
            artifact_id,
            ActivityKind::CommentDeleted,
            &user.user_id,
            "deleted a comment",
            json!({ "comment_id": comment_id, "mode": mode.as_str() }),
            visibility_for(user, &before),
        );
        let activity = self
            .log_or_rollback(activity, async {
                match mode {
                    DeleteMode::Tombstoned => self.store.update_comment(&before).await,
                    DeleteMode::Removed => self.store.insert_comment(&before).await,
                }
            })
            .await?;

        log::info!(
            "Comment {comment_id} on {artifact_id} {} by {}",
            mode.as_str(),
            user.user_id
        );
        Ok(CommentChange {
            comment,
            activity,
            new_mentions: Vec::new(),
            parent_author: None,
            delete_mode: Some(mode),
        })
    }

    /// Toggle `user` in the reaction set for `emoji`. Any room member may react.
    pub async fn toggle_reaction(
        &self,
        user: &UserIdentity,
        artifact_id: &str,
        comment_id: Uuid,
        emoji: &str,
    ) -> Result<CommentChange> {
        let _guard = self.locks.acquire(artifact_id).await;
        let before = self.load_live(artifact_id, comment_id).await?;

        let mut comment = before.clone();
        let users = comment.reactions.entry(emoji.to_string()).or_default();
        let added = users.insert(user.user_id.clone());
        if !added {
            users.remove(&user.user_id);
            if users.is_empty() {
                comment.reactions.remove(emoji);
            }
        }
        comment.updated_at = now_millis();
        self.store.update_comment(&comment).await?;

        let activity = ActivityLog::entry(
            artifact_id,
            ActivityKind::CommentReacted,
            &user.user_id,
            if added { "reacted to a comment" } else { "removed a reaction" },
            json!({ "comment_id": comment_id, "emoji": emoji, "added": added }),
            Visibility::Public,
        );
        let activity = self
            .log_or_rollback(activity, self.store.update_comment(&before))
            .await?;

        Ok(CommentChange {
            comment,
            activity,
            new_mentions: Vec::new(),
            parent_author: None,
            delete_mode: None,
        })
    }

    pub async fn set_resolved(
        &self,
        user: &UserIdentity,
        artifact_id: &str,
        comment_id: Uuid,
        resolved: bool,
    ) -> Result<CommentChange> {
        let _guard = self.locks.acquire(artifact_id).await;
        let before = self.load_live(artifact_id, comment_id).await?;
        self.authorize(user, &before).await?;

        let mut comment = before.clone();
        comment.resolved = resolved;
        comment.updated_at = now_millis();
        self.store.update_comment(&comment).await?;

        let activity = ActivityLog::entry(
            artifact_id,
            ActivityKind::CommentResolved,
            &user.user_id,
            if resolved { "resolved a comment" } else { "reopened a comment" },
            json!({ "comment_id": comment_id, "resolved": resolved }),
            Visibility::Public,
        );
        let activity = self
            .log_or_rollback(activity, self.store.update_comment(&before))
            .await?;

        Ok(CommentChange {
            comment,
            activity,
            new_mentions: Vec::new(),
            parent_author: None,
            delete_mode: None,
        })
    }

    /// All comments of an artifact in thread order: each root followed by
    /// its replies depth-first, siblings oldest first.
    pub async fn comments_for(&self, artifact_id: &str) -> Result<Vec<Comment>> {
        let all = self.store.list_comments(artifact_id).await?;
        Ok(thread_order(all))
    }
}

/// Moderation of someone else's comment is logged privately.
fn visibility_for(user: &UserIdentity, comment: &Comment) -> Visibility {
    if user.user_id != comment.author && user.role.is_elevated() {
        Visibility::Private
    } else {
        Visibility::Public
    }
}

fn thread_order(mut all: Vec<Comment>) -> Vec<Comment> {
    // Stable: equal timestamps keep storage order.
    all.sort_by_key(|c| c.created_at);
    let ids: std::collections::HashSet<Uuid> = all.iter().map(|c| c.id).collect();

    let mut ordered = Vec::with_capacity(all.len());
    // Replies whose parent is missing are treated as roots.
    let mut stack: Vec<&Comment> = all
        .iter()
        .filter(|c| c.parent_id.map_or(true, |p| !ids.contains(&p)))
        .rev()
        .collect();
    while let Some(comment) = stack.pop() {
        ordered.push(comment.clone());
        stack.extend(
            all.iter()
                .filter(|c| c.parent_id == Some(comment.id))
                .rev(),
        );
    }
    ordered
}

/// Placeholder check exposed for clients of [`CommentEngine::comments_for`].
pub fn is_placeholder(comment: &Comment) -> bool {
    comment.deleted && comment.content == DELETED_PLACEHOLDER
}
