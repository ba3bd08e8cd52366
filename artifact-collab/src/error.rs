//! Error taxonomy for the collaboration engine.
//!
//! Errors local to one user's action are reported to that connection only
//! as an `error` frame carrying [`CollabError::code`]. Nothing here is ever
//! broadcast to other room members.

use thiserror::Error;

/// A malformed or unrecognised inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("binary frames are not supported")]
    UnsupportedFrame,
}

impl ProtocolError {
    pub fn invalid(kind: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by a durable or artifact storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// A commit named a base that is no longer the stored version.
    #[error("stale commit for {artifact_id}: base {base}, stored {stored}")]
    StaleVersion {
        artifact_id: String,
        base: u64,
        stored: u64,
    },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// One delivery channel failed to hand a notification to its recipient.
///
/// Logged and retried with backoff; never fatal to the triggering event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery via {channel} failed: {reason}")]
pub struct ChannelDeliveryError {
    pub channel: String,
    pub reason: String,
}

impl ChannelDeliveryError {
    pub fn new(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollabError {
    /// Connection refused; the connection never joins a room.
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    /// Edit rejected; recoverable by rebasing onto `current`.
    #[error("edit conflict: base version {base} does not match current version {current}")]
    Conflict { base: u64, current: u64 },
    #[error(transparent)]
    ChannelDelivery(#[from] ChannelDeliveryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("not permitted: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CollabError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code sent in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::ChannelDelivery(_) => "channel_delivery_error",
            Self::Protocol(_) => "protocol_error",
            Self::Forbidden(_) => "forbidden",
            Self::Storage(StoreError::StaleVersion { .. }) => "conflict",
            Self::Storage(_) => "storage_unavailable",
        }
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
