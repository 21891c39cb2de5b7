//! The external room service the sync engine talks to.
//!
//! A backend offers three things: row CRUD on rooms, a per-room change
//! feed, and a per-room presence registry. The engine only ever sees it
//! through `Arc<dyn RoomBackend>`, so tests can inject
//! [`MemoryBackend`](crate::memory::MemoryBackend) and production code can
//! inject [`RemoteBackend`](crate::client::RemoteBackend).

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::room::{MemberId, Room, RoomCode, RoomId};

/// One event on a room's feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent {
    /// The persisted content changed (from any client, including this one).
    ContentChanged { content: Option<String> },
    /// Full membership of the room's presence set.
    PresenceSync { members: Vec<MemberId> },
}

impl FeedEvent {
    pub fn content(content: impl Into<String>) -> Self {
        FeedEvent::ContentChanged {
            content: Some(content.into()),
        }
    }

    pub fn presence(members: impl IntoIterator<Item = MemberId>) -> Self {
        FeedEvent::PresenceSync {
            members: members.into_iter().collect(),
        }
    }

    /// Number of distinct members in a presence event.
    pub fn member_count(&self) -> Option<usize> {
        match self {
            FeedEvent::PresenceSync { members } => {
                Some(members.iter().collect::<BTreeSet<_>>().len())
            }
            FeedEvent::ContentChanged { .. } => None,
        }
    }
}

/// Live stream of feed events. Ends when the subscription is gone.
pub type FeedStream = BoxStream<'static, FeedEvent>;

/// Row CRUD + change feed + presence registry.
#[async_trait]
pub trait RoomBackend: Send + Sync + 'static {
    /// Resolve a room code. `BackendError::NotFound` if no room has it.
    async fn lookup_room_by_code(&self, code: &RoomCode) -> Result<Room, BackendError>;

    /// Create an empty room under `code`.
    async fn create_room(&self, code: &RoomCode) -> Result<Room, BackendError>;

    /// Overwrite the room's content.
    async fn update_room_content(&self, id: RoomId, content: &str) -> Result<(), BackendError>;

    /// Open the change feed for a room.
    ///
    /// The stream starts with the room's current presence snapshot.
    async fn subscribe(&self, id: RoomId) -> Result<FeedStream, BackendError>;

    /// Add `member` to the room's presence set.
    async fn track(&self, id: RoomId, member: MemberId) -> Result<(), BackendError>;

    /// Remove `member` from the room's presence set. Unknown members are ignored.
    async fn untrack(&self, id: RoomId, member: MemberId) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_count_is_distinct() {
        let a = MemberId::new();
        let b = MemberId::new();
        let event = FeedEvent::presence([a, b, a]);
        assert_eq!(event.member_count(), Some(2));
    }

    #[test]
    fn test_content_event_has_no_member_count() {
        assert_eq!(FeedEvent::content("x").member_count(), None);
    }
}
