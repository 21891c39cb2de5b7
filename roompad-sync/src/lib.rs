//! # roompad-sync: Shared-room text synchronization
//!
//! Keeps one shared text blob in sync between every client that opened the
//! same room code, with a live count of who is present. Reconciliation is
//! last-write-wins at the granularity of one debounced write.
//!
//! ## Architecture
//!
//! ```text
//!  keystroke
//!      │
//!      ▼
//! ┌────────────────┐ optimistic ┌───────────┐
//! │ SyncController │ ─────────► │ RoomState │ ──► RoomView (watch)
//! └──────┬─────────┘            └───────────┘         ▲
//!        │ schedule                                   │ apply_remote_update
//!        ▼                                            │ apply_presence_snapshot
//! ┌──────────────────┐  fire  ┌──────────────┐   ┌────┴───────────────┐
//! │ DebounceScheduler│ ─────► │ RemoteWriter │   │ ChangeSubscription │
//! └──────────────────┘        └──────┬───────┘   └────▲───────────────┘
//!                                    │ update          │ feed
//!                                    ▼                 │
//!                         ┌──────────────────────────────────┐
//!                         │ RoomBackend (Memory / Remote)     │
//!                         └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`controller`]: `Unattached → Loading → Active → Closed` state machine
//! - [`state`]: client-side room state and the view snapshot
//! - [`debounce`]: trailing-edge write coalescing
//! - [`writer`]: single content updates
//! - [`subscription`]: content + presence listeners under one lifecycle
//! - [`backend`]: the backend trait and feed events
//! - [`memory`]: in-process backend with per-room broadcast feeds
//! - [`storage`]: RocksDB persistence for the in-process backend
//! - [`protocol`]: bincode wire frames
//! - [`server`] / [`client`]: WebSocket transport for the backend

pub mod backend;
pub mod client;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod room;
pub mod server;
pub mod state;
pub mod storage;
pub mod subscription;
pub mod writer;

// Re-exports for convenience
pub use backend::{FeedEvent, FeedStream, RoomBackend};
pub use client::RemoteBackend;
pub use config::{ClientConfig, ServerConfig, SyncConfig};
pub use controller::{SyncController, SyncNotice};
pub use debounce::{DebounceScheduler, DEFAULT_DEBOUNCE};
pub use error::{BackendError, ProtocolError, StoreError, SyncError, WireError};
pub use memory::{BackendStats, MemoryBackend, RoomFeed};
pub use protocol::{ClientFrame, Request, Response, ServerFrame};
pub use room::{MemberId, Room, RoomCode, RoomId};
pub use server::{ServerStats, SyncServer};
pub use state::{Phase, RoomState, RoomView, SyncStatus};
pub use storage::{RoomStore, StoreConfig};
pub use subscription::{ChangeSubscription, ContentListener, PresenceListener};
pub use writer::{RemoteWriter, WriterStats};
