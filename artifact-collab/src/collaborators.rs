//! External collaborators consumed by the engine.
//!
//! Identity issuance, authorization policy, the user directory and the
//! notification delivery channels all live outside this crate. The engine
//! only talks to them through the traits below; in-process
//! implementations are provided for single-node deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelDeliveryError;
use crate::model::Comment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Moderator,
    Admin,
}

impl Role {
    /// May mutate comments written by others.
    pub fn is_elevated(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "member" => Ok(Role::Member),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A validated user, as returned by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    /// Handle used in `@mentions`
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

/// Consulted inside the WebSocket upgrade, before any room state exists.
/// Implementations answer from memory; token refresh happens elsewhere.
pub trait IdentityProvider: Send + Sync {
    /// `None` for an invalid or expired token.
    fn validate(&self, token: &str) -> Option<UserIdentity>;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_mutate(&self, user: &UserIdentity, comment: &Comment) -> bool;
}

/// A user known to the mention extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub user_id: String,
    pub username: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn known_users(&self) -> Vec<DirectoryEntry>;
}

/// One notification delivery channel (push, email, in-app, ...).
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, recipient: &str, payload: &Value) -> Result<(), ChannelDeliveryError>;
}

/// Token table doubling as the user directory.
#[derive(Default)]
pub struct StaticIdentity {
    tokens: RwLock<HashMap<String, UserIdentity>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, identity: UserIdentity) {
        self.tokens.write().insert(token.into(), identity);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_user(self, token: &str, user_id: &str, username: &str, role: Role) -> Self {
        self.insert(
            token,
            UserIdentity {
                user_id: user_id.to_string(),
                username: username.to_string(),
                display_name: username.to_string(),
                role,
            },
        );
        self
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }

    /// Parse `token:user_id:username[:role],...`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let identity = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').collect();
            let (token, user_id, username, role) = match parts.as_slice() {
                [token, user_id, username] => (*token, *user_id, *username, Role::Member),
                [token, user_id, username, role] => (*token, *user_id, *username, role.parse()?),
                _ => return Err(format!("invalid identity entry '{entry}'")),
            };
            identity.insert(
                token,
                UserIdentity {
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                    display_name: username.to_string(),
                    role,
                },
            );
        }
        Ok(identity)
    }
}

impl IdentityProvider for StaticIdentity {
    fn validate(&self, token: &str) -> Option<UserIdentity> {
        self.tokens.read().get(token).cloned()
    }
}

#[async_trait]
impl UserDirectory for StaticIdentity {
    async fn known_users(&self) -> Vec<DirectoryEntry> {
        let mut users: Vec<DirectoryEntry> = self
            .tokens
            .read()
            .values()
            .map(|identity| DirectoryEntry {
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users.dedup_by(|a, b| a.user_id == b.user_id);
        users
    }
}

/// Authors may mutate their own comments; moderators and admins any.
pub struct RoleAuthorizer;

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn can_mutate(&self, user: &UserIdentity, comment: &Comment) -> bool {
        user.user_id == comment.author || user.role.is_elevated()
    }
}
