//! Client-side view of one open room.
//!
//! [`RoomState`] is a plain data holder. It does no locking of its own; the
//! controller owns it and serialises every mutation. What the UI sees is a
//! [`RoomView`] snapshot taken after each mutation.

use serde::{Deserialize, Serialize};

use crate::room::{RoomCode, RoomId};

/// Whether local content is known to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Content matches the last value seen on the change feed
    #[default]
    Idle,
    /// A local edit has not yet come back from the backend
    PendingWrite,
    /// The last write was rejected; local content is ahead of the backend
    Error,
}

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Unattached,
    Loading,
    Active,
    Closed,
}

/// Authoritative client-local state of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomState {
    room_id: RoomId,
    content: String,
    participant_count: usize,
    sync_status: SyncStatus,
}

impl RoomState {
    /// Create state for a room from its persisted content.
    ///
    /// The initial load goes through the same path as a remote update.
    pub fn new(room_id: RoomId, content: Option<String>) -> Self {
        let mut state = Self {
            room_id,
            content: String::new(),
            participant_count: 0,
            sync_status: SyncStatus::Idle,
        };
        state.apply_remote_update(content);
        state
    }

    /// Optimistically apply text the user just typed.
    pub fn apply_local_edit(&mut self, text: impl Into<String>) {
        self.content = text.into();
        self.sync_status = SyncStatus::PendingWrite;
    }

    /// Overwrite content with the value from the change feed.
    ///
    /// Applies unconditionally, even over a pending local edit.
    pub fn apply_remote_update(&mut self, text: Option<String>) {
        self.content = text.unwrap_or_default();
        self.sync_status = SyncStatus::Idle;
    }

    /// Replace the participant count with the latest presence snapshot.
    pub fn apply_presence_snapshot(&mut self, count: usize) {
        self.participant_count = count;
    }

    /// Record a rejected write. Content is left as typed.
    pub fn mark_write_failed(&mut self) {
        self.sync_status = SyncStatus::Error;
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn participant_count(&self) -> usize {
        self.participant_count
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }
}

/// Snapshot of everything the UI renders.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoomView {
    pub phase: Phase,
    pub room_id: Option<RoomId>,
    pub room_code: Option<RoomCode>,
    pub content: String,
    pub participant_count: usize,
    pub sync_status: SyncStatus,
    /// Whether the change feed is currently delivering events
    pub live: bool,
}

impl RoomView {
    /// View with no room attached, in the given phase.
    pub fn detached(phase: Phase) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }

    /// View of an open room.
    pub fn of(state: &RoomState, code: &RoomCode, phase: Phase, live: bool) -> Self {
        Self {
            phase,
            room_id: Some(state.room_id()),
            room_code: Some(code.clone()),
            content: state.content().to_string(),
            participant_count: state.participant_count(),
            sync_status: state.sync_status(),
            live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(content: &str) -> RoomState {
        RoomState::new(RoomId::new(), Some(content.to_string()))
    }

    #[test]
    fn test_initial_load_is_idle() {
        let s = state("hello");
        assert_eq!(s.content(), "hello");
        assert_eq!(s.sync_status(), SyncStatus::Idle);
        assert_eq!(s.participant_count(), 0);
    }

    #[test]
    fn test_null_initial_content_is_empty() {
        let s = RoomState::new(RoomId::new(), None);
        assert_eq!(s.content(), "");
    }

    #[test]
    fn test_local_edit_marks_pending() {
        let mut s = state("hello");
        s.apply_local_edit("hello world");
        assert_eq!(s.content(), "hello world");
        assert_eq!(s.sync_status(), SyncStatus::PendingWrite);
    }

    #[test]
    fn test_remote_update_overwrites_pending_edit() {
        let mut s = state("hello");
        s.apply_local_edit("hello world");
        s.apply_remote_update(Some("hello there".into()));
        assert_eq!(s.content(), "hello there");
        assert_eq!(s.sync_status(), SyncStatus::Idle);
    }

    #[test]
    fn test_remote_update_clears_error() {
        let mut s = state("a");
        s.apply_local_edit("ab");
        s.mark_write_failed();
        assert_eq!(s.sync_status(), SyncStatus::Error);
        assert_eq!(s.content(), "ab");

        s.apply_remote_update(None);
        assert_eq!(s.content(), "");
        assert_eq!(s.sync_status(), SyncStatus::Idle);
    }

    #[test]
    fn test_presence_snapshot_overwrites() {
        let mut s = state("");
        s.apply_presence_snapshot(3);
        s.apply_presence_snapshot(1);
        assert_eq!(s.participant_count(), 1);
    }

    #[test]
    fn test_view_reflects_state() {
        let mut s = state("x");
        s.apply_presence_snapshot(2);
        let code = RoomCode::parse("AB12CD").unwrap();
        let view = RoomView::of(&s, &code, Phase::Active, true);
        assert_eq!(view.room_id, Some(s.room_id()));
        assert_eq!(view.room_code, Some(code));
        assert_eq!(view.content, "x");
        assert_eq!(view.participant_count, 2);
        assert!(view.live);

        let detached = RoomView::detached(Phase::Closed);
        assert_eq!(detached.phase, Phase::Closed);
        assert!(detached.room_id.is_none());
        assert!(detached.content.is_empty());
    }
}
