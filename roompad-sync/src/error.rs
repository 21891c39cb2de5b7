//! Error types for the sync engine and its backends.
//!
//! Each layer has its own enum:
//! - [`BackendError`]: what a [`RoomBackend`](crate::backend::RoomBackend) reports
//! - [`SyncError`]: what the controller hands back to the UI
//! - [`ProtocolError`]: wire encode/decode and connection failures
//! - [`StoreError`]: RocksDB persistence failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::RoomCode;

/// Failures reported by a room backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Room not found")]
    NotFound,

    #[error("Room code already taken: {0}")]
    Conflict(RoomCode),

    #[error("Backend rejected the request: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend request timed out")]
    Timeout,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl BackendError {
    /// Whether the backend positively answered "no such room".
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound)
    }
}

impl From<ProtocolError> for BackendError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Timeout => BackendError::Timeout,
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// Errors surfaced by [`SyncController`](crate::controller::SyncController).
///
/// None of these are fatal: the controller stays usable and the user can retry
/// the triggering action.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Please enter a room code")]
    EmptyRoomCode,

    #[error("Room {code} could not be opened: {source}")]
    LookupFailed {
        code: RoomCode,
        #[source]
        source: BackendError,
    },

    #[error("Failed to create room: {0}")]
    CreateFailed(#[source] BackendError),

    #[error("Failed to update content: {0}")]
    WriteFailed(#[source] BackendError),

    #[error("Live updates unavailable: {0}")]
    SubscriptionFailed(#[source] BackendError),

    #[error("No room is open")]
    NotActive,
}

/// Wire protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Outgoing queue full")]
    QueueFull,

    #[error("Unexpected response for request {0}")]
    UnexpectedResponse(u64),
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Backend failure as carried over the wire.
///
/// Mirrors [`BackendError`] without the non-serializable parts so the
/// remote client can rebuild an equivalent error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    NotFound,
    Conflict(String),
    Rejected(String),
    Internal(String),
}

impl From<&BackendError> for WireError {
    fn from(e: &BackendError) -> Self {
        match e {
            BackendError::NotFound => WireError::NotFound,
            BackendError::Conflict(code) => WireError::Conflict(code.to_string()),
            BackendError::Rejected(reason) => WireError::Rejected(reason.clone()),
            other => WireError::Internal(other.to_string()),
        }
    }
}

impl From<WireError> for BackendError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::NotFound => BackendError::NotFound,
            WireError::Conflict(code) => match RoomCode::parse(&code) {
                Some(code) => BackendError::Conflict(code),
                None => BackendError::Rejected(format!("conflict on code {code:?}")),
            },
            WireError::Rejected(reason) => BackendError::Rejected(reason),
            WireError::Internal(reason) => BackendError::Transport(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_preserves_not_found() {
        let wire = WireError::from(&BackendError::NotFound);
        assert_eq!(wire, WireError::NotFound);
        assert!(BackendError::from(wire).is_not_found());
    }

    #[test]
    fn test_wire_error_conflict_keeps_code() {
        let code = RoomCode::parse("ab12cd").unwrap();
        let wire = WireError::from(&BackendError::Conflict(code.clone()));
        match BackendError::from(wire) {
            BackendError::Conflict(back) => assert_eq!(back, code),
            other => panic!("Expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_protocol_timeout_maps_to_backend_timeout() {
        let err: BackendError = ProtocolError::Timeout.into();
        assert!(matches!(err, BackendError::Timeout));

        let err: BackendError = ProtocolError::ConnectionClosed.into();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[test]
    fn test_sync_error_messages() {
        assert_eq!(SyncError::EmptyRoomCode.to_string(), "Please enter a room code");
        let err = SyncError::WriteFailed(BackendError::Rejected("read only".into()));
        assert_eq!(
            err.to_string(),
            "Failed to update content: Backend rejected the request: read only"
        );
    }
}
