//! One live feed per open room.
//!
//! A [`ChangeSubscription`] owns a single backend feed and this client's
//! presence entry. Inbound events are split between two listeners that
//! know nothing of each other:
//!
//! ```text
//!                       ┌──► ContentListener  ──► on_content(Option<String>)
//! backend feed ──reader─┤
//!                       └──► PresenceListener ──► on_presence(count)
//! ```
//!
//! Lifecycle: `open` subscribes first and tracks second, so this client's
//! own arrival shows up in the presence count it receives. `close` stops the
//! reader and untracks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::backend::{FeedEvent, RoomBackend};
use crate::error::SyncError;
use crate::room::{MemberId, RoomId};

/// Receives the new content of the room.
pub type ContentFn = Arc<dyn Fn(Option<String>) + Send + Sync>;
/// Receives the number of distinct members present.
pub type PresenceFn = Arc<dyn Fn(usize) + Send + Sync>;
/// Called once if the feed ends while the subscription is still open.
pub type EndedFn = Box<dyn FnOnce() + Send>;

/// Content-change half of a subscription.
///
/// There is no origin filtering: a client receives the echo of its own
/// writes like anyone else's.
pub struct ContentListener {
    on_content: ContentFn,
    received: AtomicU64,
}

impl ContentListener {
    pub fn new(on_content: ContentFn) -> Self {
        Self {
            on_content,
            received: AtomicU64::new(0),
        }
    }

    /// Handle `event` if it is a content change. Returns whether it was.
    pub fn handle(&self, event: &FeedEvent) -> bool {
        match event {
            FeedEvent::ContentChanged { content } => {
                self.received.fetch_add(1, Ordering::Relaxed);
                (self.on_content)(content.clone());
                true
            }
            FeedEvent::PresenceSync { .. } => false,
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Presence half of a subscription.
pub struct PresenceListener {
    on_presence: PresenceFn,
}

impl PresenceListener {
    pub fn new(on_presence: PresenceFn) -> Self {
        Self { on_presence }
    }

    /// Handle `event` if it is a presence sync. Returns whether it was.
    pub fn handle(&self, event: &FeedEvent) -> bool {
        match event.member_count() {
            Some(count) => {
                (self.on_presence)(count);
                true
            }
            None => false,
        }
    }
}

/// Callbacks wired into a subscription.
pub struct SubscriptionHandlers {
    pub on_content: ContentFn,
    pub on_presence: PresenceFn,
    pub on_ended: Option<EndedFn>,
}

/// Live feed + presence registration for one room.
pub struct ChangeSubscription {
    backend: Arc<dyn RoomBackend>,
    room_id: RoomId,
    member_id: MemberId,
    reader: Option<JoinHandle<()>>,
}

impl ChangeSubscription {
    /// Subscribe to the room's feed, then track `member_id` in its presence set.
    ///
    /// No handle exists if either step fails.
    pub async fn open(
        backend: Arc<dyn RoomBackend>,
        room_id: RoomId,
        member_id: MemberId,
        handlers: SubscriptionHandlers,
    ) -> Result<Self, SyncError> {
        let mut feed = backend
            .subscribe(room_id)
            .await
            .map_err(SyncError::SubscriptionFailed)?;

        let content = ContentListener::new(handlers.on_content);
        let presence = PresenceListener::new(handlers.on_presence);
        let on_ended = handlers.on_ended;

        let reader = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                if !content.handle(&event) {
                    presence.handle(&event);
                }
            }
            log::info!("Feed for room {room_id} ended");
            if let Some(on_ended) = on_ended {
                on_ended();
            }
        });

        if let Err(e) = backend.track(room_id, member_id).await {
            reader.abort();
            log::warn!("Failed to track presence in room {room_id}: {e}");
            return Err(SyncError::SubscriptionFailed(e));
        }

        log::debug!("Subscribed to room {room_id} as {member_id}");
        Ok(Self {
            backend,
            room_id,
            member_id,
            reader: Some(reader),
        })
    }

    /// Stop the reader and untrack. Closing twice is a no-op.
    pub async fn close(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        reader.abort();

        if let Err(e) = self.backend.untrack(self.room_id, self.member_id).await {
            log::warn!("Failed to untrack from room {}: {e}", self.room_id);
        }
        log::debug!("Closed subscription to room {}", self.room_id);
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        reader.abort();

        // Best effort: untrack in the background if a runtime is still around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let (room_id, member_id) = (self.room_id, self.member_id);
            handle.spawn(async move {
                let _ = backend.untrack(room_id, member_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FeedStream;
    use crate::error::BackendError;
    use crate::memory::MemoryBackend;
    use crate::room::{Room, RoomCode};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        contents: Mutex<Vec<Option<String>>>,
        counts: Mutex<Vec<usize>>,
        ended: Mutex<u32>,
    }

    fn handlers(recorded: &Arc<Recorded>) -> SubscriptionHandlers {
        let (c, p, e) = (recorded.clone(), recorded.clone(), recorded.clone());
        SubscriptionHandlers {
            on_content: Arc::new(move |text: Option<String>| c.contents.lock().push(text)),
            on_presence: Arc::new(move |count: usize| p.counts.lock().push(count)),
            on_ended: Some(Box::new(move || *e.ended.lock() += 1)),
        }
    }

    async fn setup() -> (Arc<MemoryBackend>, RoomId) {
        let backend = Arc::new(MemoryBackend::new());
        let room = backend
            .create_room(&RoomCode::parse("AB12CD").unwrap())
            .await
            .unwrap();
        (backend, room.id)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_open_tracks_member() {
        let (backend, room_id) = setup().await;
        let recorded = Arc::new(Recorded::default());

        let sub = ChangeSubscription::open(backend.clone(), room_id, MemberId::new(), handlers(&recorded))
            .await
            .unwrap();
        settle().await;

        assert!(!sub.is_closed());
        assert_eq!(backend.member_count(room_id).await, 1);
        // Initial snapshot (empty), then our own arrival.
        assert_eq!(*recorded.counts.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_listeners_split_events() {
        let (backend, room_id) = setup().await;
        let recorded = Arc::new(Recorded::default());
        let _sub = ChangeSubscription::open(backend.clone(), room_id, MemberId::new(), handlers(&recorded))
            .await
            .unwrap();

        backend.update_room_content(room_id, "one").await.unwrap();
        backend.update_room_content(room_id, "two").await.unwrap();
        settle().await;

        assert_eq!(
            *recorded.contents.lock(),
            vec![Some("one".to_string()), Some("two".to_string())]
        );
        assert_eq!(recorded.counts.lock().last(), Some(&1));
    }

    #[tokio::test]
    async fn test_close_untracks_and_is_idempotent() {
        let (backend, room_id) = setup().await;
        let recorded = Arc::new(Recorded::default());
        let mut sub = ChangeSubscription::open(backend.clone(), room_id, MemberId::new(), handlers(&recorded))
            .await
            .unwrap();

        sub.close().await;
        assert!(sub.is_closed());
        assert_eq!(backend.member_count(room_id).await, 0);
        sub.close().await;

        backend.update_room_content(room_id, "after close").await.unwrap();
        settle().await;
        assert!(recorded.contents.lock().is_empty());
        // A deliberate close is not an ended feed.
        assert_eq!(*recorded.ended.lock(), 0);
    }

    #[tokio::test]
    async fn test_drop_untracks_in_background() {
        let (backend, room_id) = setup().await;
        let recorded = Arc::new(Recorded::default());
        let sub = ChangeSubscription::open(backend.clone(), room_id, MemberId::new(), handlers(&recorded))
            .await
            .unwrap();
        assert_eq!(backend.member_count(room_id).await, 1);

        drop(sub);
        settle().await;
        assert_eq!(backend.member_count(room_id).await, 0);
    }

    #[tokio::test]
    async fn test_open_fails_when_subscribe_rejected() {
        let (backend, room_id) = setup().await;
        backend.reject_subscriptions(true);
        let recorded = Arc::new(Recorded::default());

        let result =
            ChangeSubscription::open(backend.clone(), room_id, MemberId::new(), handlers(&recorded)).await;
        assert!(matches!(result, Err(SyncError::SubscriptionFailed(_))));
        assert_eq!(backend.member_count(room_id).await, 0);
    }

    /// Memory backend whose feeds deliver one final write and then end.
    struct FiniteFeedBackend(MemoryBackend);

    #[async_trait::async_trait]
    impl RoomBackend for FiniteFeedBackend {
        async fn lookup_room_by_code(&self, code: &RoomCode) -> Result<Room, BackendError> {
            self.0.lookup_room_by_code(code).await
        }

        async fn create_room(&self, code: &RoomCode) -> Result<Room, BackendError> {
            self.0.create_room(code).await
        }

        async fn update_room_content(&self, id: RoomId, content: &str) -> Result<(), BackendError> {
            self.0.update_room_content(id, content).await
        }

        async fn subscribe(&self, _id: RoomId) -> Result<FeedStream, BackendError> {
            Ok(futures_util::stream::iter([FeedEvent::content("last")]).boxed())
        }

        async fn track(&self, id: RoomId, member: MemberId) -> Result<(), BackendError> {
            self.0.track(id, member).await
        }

        async fn untrack(&self, id: RoomId, member: MemberId) -> Result<(), BackendError> {
            self.0.untrack(id, member).await
        }
    }

    #[tokio::test]
    async fn test_ended_feed_reports_once() {
        let (memory, room_id) = setup().await;
        let memory = Arc::try_unwrap(memory).ok().unwrap();
        let backend = Arc::new(FiniteFeedBackend(memory));
        let recorded = Arc::new(Recorded::default());

        let mut sub = ChangeSubscription::open(backend.clone(), room_id, MemberId::new(), handlers(&recorded))
            .await
            .unwrap();
        settle().await;

        assert_eq!(*recorded.contents.lock(), vec![Some("last".to_string())]);
        assert_eq!(*recorded.ended.lock(), 1);
        assert_eq!(backend.0.member_count(room_id).await, 1);

        sub.close().await;
        assert_eq!(*recorded.ended.lock(), 1);
        assert_eq!(backend.0.member_count(room_id).await, 0);
    }

    #[test]
    fn test_content_listener_ignores_presence() {
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let listener = ContentListener::new(Arc::new(move |_: Option<String>| *counter.lock() += 1));

        assert!(!listener.handle(&FeedEvent::presence([MemberId::new()])));
        assert!(listener.handle(&FeedEvent::content("x")));
        assert_eq!(*hits.lock(), 1);
        assert_eq!(listener.received(), 1);
    }

    #[test]
    fn test_presence_listener_counts_distinct() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let listener = PresenceListener::new(Arc::new(move |n: usize| *sink.lock() = Some(n)));
        let member = MemberId::new();

        assert!(!listener.handle(&FeedEvent::content("x")));
        assert!(listener.handle(&FeedEvent::presence([member, member, MemberId::new()])));
        assert_eq!(*seen.lock(), Some(2));
    }
}
