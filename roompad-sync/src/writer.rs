//! Persists room content through the backend, one update per call.
//!
//! There is no retry and no queueing. If a second write is issued while the
//! first is still in flight, both go out; whichever completes last wins at
//! the storage layer and the change feed brings every client back in line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::RoomBackend;
use crate::error::SyncError;
use crate::room::RoomId;

/// Write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub issued: u64,
    pub failed: u64,
}

/// Issues content updates for rooms.
#[derive(Clone)]
pub struct RemoteWriter {
    backend: Arc<dyn RoomBackend>,
    issued: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl RemoteWriter {
    pub fn new(backend: Arc<dyn RoomBackend>) -> Self {
        Self {
            backend,
            issued: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Write `content` as the room's new value.
    pub async fn write(&self, room_id: RoomId, content: &str) -> Result<(), SyncError> {
        self.issued.fetch_add(1, Ordering::Relaxed);
        log::debug!("Writing {} bytes to room {room_id}", content.len());

        match self.backend.update_room_content(room_id, content).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Write to room {room_id} failed: {e}");
                Err(SyncError::WriteFailed(e))
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            issued: self.issued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
