//! # visus-collab — Real-time collaboration layer for Visus
//!
//! Synchronizes annotation scenes between participants viewing the same
//! image, with conflict avoidance by exclusive locking rather than
//! merge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────┐
//! │ Connection   │ ◄──────────────────► │ CollabServer │
//! │ Manager      │    Binary frames     │ (rooms/locks)│
//! └──────┬───────┘                      └──────┬───────┘
//!        │ inbound fan-out                     │
//!   ┌────┴────────┐                            ▼
//!   ▼             ▼                   ┌────────────────┐
//! SyncChannel  LockService            │ AnnotationStore│
//! (topics,     (request/reply)        │ (rocks/memory) │
//!  presence)                          └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded frames)
//! - [`connection`] — preflight, auth, reconnect-with-backoff socket owner
//! - [`channel`] — per-image typed pub/sub and presence announcements
//! - [`lock`] — per-annotation exclusive locks
//! - [`presence`] — participant roster and cursor throttling
//! - [`server`] — reference collaboration server
//! - [`storage`] — annotation save/load contract and stores

pub mod channel;
pub mod connection;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

pub use channel::{AnnotationEvent, SyncChannel};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    Endpoint, ReconnectPolicy, StaticTokenProvider, TokenError, TokenProvider,
};
pub use lock::{LockError, LockService, LockStatus};
pub use presence::{CursorThrottle, Participant, PresenceEvent, PresenceRoster};
pub use protocol::{
    CursorUpdate, LockReply, LockRequest, MessageKind, ParticipantInfo, ProtocolError, WireMessage,
};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{AnnotationStore, MemoryStore, RocksStore, StoreConfig, StoreError};
