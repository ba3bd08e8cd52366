//! # artifact-collab: Real-time collaboration engine for shared artifacts
//!
//! Presence, typing indicators, threaded comments, notifications and
//! optimistic-concurrency artifact edits over a JSON WebSocket protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)  ┌──────────────┐
//! │  Client     │ ◄─────────────────► │ CollabServer │  reader + writer task
//! │ (per tab)   │   /rooms/{id}       │  (gateway)   │  per connection
//! └─────────────┘                     └──────┬───────┘
//!                                            │ text frames
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │ CollabEngine │── router (pure)
//!                                     └──┬───┬───┬───┘
//!                  ┌─────────────────────┘   │   └──────────────────┐
//!                  ▼                         ▼                      ▼
//!          ┌──────────────┐         ┌────────────────┐     ┌────────────────┐
//!          │ RoomRegistry │         │ CommentEngine  │     │ConflictResolver│
//!          │ presence,    │         │ + ActivityLog  │     │ version check  │
//!          │ typing, fan- │         └───────┬────────┘     └───────┬────────┘
//!          │ out, RoomBus │                 ▼                      ▼
//!          └──────────────┘           DurableStore           ArtifactStorage
//!                                     (memory / RocksDB)
//!                                           ▲
//!                                     ┌─────┴──────┐
//!                                     │ Dispatcher │── delivery channels
//!                                     └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope, frame classes and close codes
//! - [`router`]: envelope type → effects dispatch table
//! - [`room`]: room registry, presence fan-out and the presence sweep
//! - [`comments`] / [`activity`]: threaded comments and the audit log
//! - [`notify`]: prioritised, coalescing notification dispatch
//! - [`conflict`]: optimistic concurrency for artifact edits
//! - [`server`]: WebSocket gateway
//! - [`storage`]: durable store and artifact storage implementations

pub mod activity;
pub mod bus;
pub mod collaborators;
pub mod comments;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod engine;
pub mod ephemeral;
pub mod error;
pub mod keyed;
pub mod mentions;
pub mod model;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod router;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use bus::{BroadcastBus, LocalBus, RoomBus};
pub use collaborators::{
    Authorizer, DeliveryChannel, DirectoryEntry, IdentityProvider, Role, RoleAuthorizer,
    StaticIdentity, UserDirectory, UserIdentity,
};
pub use config::EngineConfig;
pub use conflict::EditOutcome;
pub use connection::{ConnectionHandle, ConnectionId};
pub use engine::{CollabEngine, Collaborators};
pub use error::{ChannelDeliveryError, CollabError, ProtocolError, StoreError};
pub use model::{Activity, Comment, Notification, NotificationKind, Priority, VersionMarker};
pub use protocol::{CloseReason, Envelope};
pub use server::{CollabServer, ServerStats};
pub use storage::{
    ArtifactStorage, DurableStore, MemoryArtifacts, MemoryStore, RocksConfig, RocksStore,
};
