//! Durable storage for the in-process backend.
//!
//! ```text
//! ┌───────────────┐   create / update   ┌───────────────────────────┐
//! │ MemoryBackend │ ──────────────────► │ RoomStore (RocksDB)       │
//! │ (tables)      │                     │  CF "rooms" - rows (LZ4)  │
//! └──────┬────────┘                     │  CF "codes" - code → id   │
//!        │ on startup: load_rooms()     └───────────────────────────┘
//!        ▼
//!   tables restored
//! ```
//!
//! Writes go through to the store before the in-memory table changes, so a
//! failed store write leaves both sides untouched.

pub mod rocks;

pub use rocks::{RoomStore, StoreConfig};
