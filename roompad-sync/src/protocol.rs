//! Binary protocol between [`RemoteBackend`](crate::client::RemoteBackend)
//! and [`SyncServer`](crate::server::SyncServer).
//!
//! Every WebSocket binary message carries exactly one bincode-encoded frame
//! (serde, standard config).
//!
//! ```text
//! client                                server
//!   │ Request { id: 7, Lookup(code) }    │
//!   │ ──────────────────────────────────►│
//!   │ Response { id: 7, Room(room) }     │
//!   │ ◄──────────────────────────────────│
//!   │ Request { id: 8, Subscribe(room) } │
//!   │ ──────────────────────────────────►│
//!   │ Response { id: 8, Ok }             │
//!   │ Feed { room, PresenceSync }        │
//!   │ Feed { room, ContentChanged }  ... │
//!   │ ◄──────────────────────────────────│
//! ```
//!
//! Requests are correlated by `id`; feed frames are pushed unsolicited and
//! routed by `room_id`.

use serde::{Deserialize, Serialize};

use crate::backend::FeedEvent;
use crate::error::{ProtocolError, WireError};
use crate::room::{MemberId, Room, RoomCode, RoomId};

/// One backend operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Lookup(RoomCode),
    Create(RoomCode),
    Update { room_id: RoomId, content: String },
    Subscribe(RoomId),
    Unsubscribe(RoomId),
    Track { room_id: RoomId, member: MemberId },
    Untrack { room_id: RoomId, member: MemberId },
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Lookup(_) => "lookup",
            Request::Create(_) => "create",
            Request::Update { .. } => "update",
            Request::Subscribe(_) => "subscribe",
            Request::Unsubscribe(_) => "unsubscribe",
            Request::Track { .. } => "track",
            Request::Untrack { .. } => "untrack",
        }
    }
}

/// Outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Room(Room),
    Ok,
    Failed(WireError),
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Request { id: u64, request: Request },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Response { id: u64, response: Response },
    Feed { room_id: RoomId, event: FeedEvent },
    Pong,
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(frame)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
