//! In-process room backend: rooms table, per-room change feed, presence.
//!
//! ```text
//!   update_room_content ──► rooms table ──► RoomFeed (broadcast) ──► subscriber 1
//!                                                 │               └──► subscriber 2
//!   track / untrack ──────► presence set ─────────┘  PresenceSync
//! ```
//!
//! Each room gets its own [`RoomFeed`] so events never cross rooms. Feeds
//! are tokio broadcast channels: every subscriber has an independent
//! receiver buffering up to `capacity` events, and a lagging subscriber
//! drops the oldest events rather than blocking publishers.
//!
//! Content changes are published while the table lock is held, so feed
//! order per room always matches the order writes were applied. A feed is
//! dropped once it has neither members nor streams, checked on `untrack`
//! and whenever a stream is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use crate::backend::{FeedEvent, FeedStream, RoomBackend};
use crate::error::{BackendError, StoreError};
use crate::room::{MemberId, Room, RoomCode, RoomId};
use crate::storage::RoomStore;

/// Default number of events buffered per subscriber.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// What a member announced when it started tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceMeta {
    /// Seconds since epoch at `track` time
    pub online_at: u64,
}

impl PresenceMeta {
    fn now() -> Self {
        Self {
            online_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Counters for one room feed.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub events_published: u64,
    pub active_members: usize,
    pub subscribers: usize,
}

/// Change feed and presence set for a single room.
pub struct RoomFeed {
    sender: broadcast::Sender<FeedEvent>,
    members: RwLock<BTreeMap<MemberId, PresenceMeta>>,
    capacity: usize,
    events_published: AtomicU64,
}

impl RoomFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(BTreeMap::new()),
            capacity,
            events_published: AtomicU64::new(0),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns how many subscribers it reached.
    pub fn publish(&self, event: FeedEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(event).unwrap_or(0)
    }

    /// Open a stream that starts with the current presence snapshot.
    pub async fn stream(&self) -> FeedStream {
        // Subscribe before snapshotting so no presence change can fall between.
        let rx = self.sender.subscribe();
        let initial = self.presence_snapshot().await;
        feed_stream(initial, FeedReceiver { rx, _release: None })
    }

    /// Add a member and publish the new membership.
    ///
    /// Returns `true` if the member was not already present.
    pub async fn track(&self, member: MemberId) -> bool {
        let (added, snapshot) = {
            let mut members = self.members.write().await;
            let added = members.insert(member, PresenceMeta::now()).is_none();
            (added, FeedEvent::presence(members.keys().copied()))
        };
        self.publish(snapshot);
        added
    }

    /// Remove a member and publish the new membership.
    ///
    /// Returns `true` if the member was present.
    pub async fn untrack(&self, member: &MemberId) -> bool {
        let snapshot = {
            let mut members = self.members.write().await;
            if members.remove(member).is_none() {
                return false;
            }
            FeedEvent::presence(members.keys().copied())
        };
        self.publish(snapshot);
        true
    }

    /// Current membership as a feed event.
    pub async fn presence_snapshot(&self) -> FeedEvent {
        FeedEvent::presence(self.members.read().await.keys().copied())
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn presence(&self, member: &MemberId) -> Option<PresenceMeta> {
        self.members.read().await.get(member).copied()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> FeedStats {
        FeedStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            active_members: self.member_count().await,
            subscribers: self.subscriber_count(),
        }
    }
}

/// Broadcast receiver plus the hook that releases its feed.
///
/// Fields drop in order, so the receiver is gone before the release runs.
struct FeedReceiver {
    rx: broadcast::Receiver<FeedEvent>,
    _release: Option<FeedRelease>,
}

/// Removes an idle feed from its registry once a stream is dropped.
struct FeedRelease {
    registry: Weak<FeedRegistry>,
    room_id: RoomId,
}

impl Drop for FeedRelease {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let room_id = self.room_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if registry.remove_if_idle(&room_id).await {
                    log::debug!("Released idle feed for room {room_id}");
                }
            });
        }
    }
}

/// Adapt a broadcast receiver into a feed stream.
fn feed_stream(initial: FeedEvent, receiver: FeedReceiver) -> FeedStream {
    let live = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.rx.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Feed subscriber lagged by {n} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    stream::once(async move { initial }).chain(live).boxed()
}

/// Maps room ids to their feeds.
///
/// Receivers and presence entries are only added while the map's write lock
/// is held, so [`FeedRegistry::remove_if_idle`] never drops a feed someone is
/// joining.
pub struct FeedRegistry {
    feeds: RwLock<HashMap<RoomId, Arc<RoomFeed>>>,
    default_capacity: usize,
}

impl FeedRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    fn entry(&self, feeds: &mut HashMap<RoomId, Arc<RoomFeed>>, room_id: RoomId) -> Arc<RoomFeed> {
        feeds
            .entry(room_id)
            .or_insert_with(|| Arc::new(RoomFeed::new(self.default_capacity)))
            .clone()
    }

    /// Open a stream on the room's feed, creating the feed if needed.
    ///
    /// Dropping the stream removes the feed once it is idle.
    pub async fn subscribe(self: &Arc<Self>, room_id: RoomId) -> FeedStream {
        let (feed, rx) = {
            let mut feeds = self.feeds.write().await;
            let feed = self.entry(&mut feeds, room_id);
            let rx = feed.sender.subscribe();
            (feed, rx)
        };
        let initial = feed.presence_snapshot().await;
        let release = FeedRelease {
            registry: Arc::downgrade(self),
            room_id,
        };
        feed_stream(
            initial,
            FeedReceiver {
                rx,
                _release: Some(release),
            },
        )
    }

    /// Track a member in the room's presence set, creating the feed if needed.
    pub async fn track(&self, room_id: RoomId, member: MemberId) -> bool {
        let mut feeds = self.feeds.write().await;
        self.entry(&mut feeds, room_id).track(member).await
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<RoomFeed>> {
        self.feeds.read().await.get(room_id).cloned()
    }

    /// Drop a feed nobody listens to or is present in.
    pub async fn remove_if_idle(&self, room_id: &RoomId) -> bool {
        let mut feeds = self.feeds.write().await;
        if let Some(feed) = feeds.get(room_id) {
            if feed.subscriber_count() == 0 && feed.member_count().await == 0 {
                feeds.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn feed_count(&self) -> usize {
        self.feeds.read().await.len()
    }
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, Room>,
    codes: HashMap<RoomCode, RoomId>,
}

impl Tables {
    fn insert(&mut self, room: Room) {
        self.codes.insert(room.room_code.clone(), room.id);
        self.rooms.insert(room.id, room);
    }
}

/// Backend statistics.
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub rooms: usize,
    pub active_feeds: usize,
    pub writes: u64,
    pub rejected_writes: u64,
}

/// In-process [`RoomBackend`], optionally persisted to a [`RoomStore`].
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    feeds: Arc<FeedRegistry>,
    store: Option<Arc<RoomStore>>,
    reject_writes: AtomicBool,
    reject_subscriptions: AtomicBool,
    writes: AtomicU64,
    rejected_writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            feeds: Arc::new(FeedRegistry::new(feed_capacity)),
            store: None,
            reject_writes: AtomicBool::new(false),
            reject_subscriptions: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
        }
    }

    /// Back the tables with a persistent store, loading every stored room.
    pub fn with_store(store: Arc<RoomStore>, feed_capacity: usize) -> Result<Self, StoreError> {
        let mut tables = Tables::default();
        for room in store.load_rooms()? {
            tables.insert(room);
        }
        log::info!("Recovered {} rooms from storage", tables.rooms.len());

        let mut backend = Self::with_capacity(feed_capacity);
        backend.tables = RwLock::new(tables);
        backend.store = Some(store);
        Ok(backend)
    }

    /// Make every content update fail with `BackendError::Rejected`.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Make every subscribe fail with `BackendError::Rejected`.
    pub fn reject_subscriptions(&self, reject: bool) {
        self.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Current membership size of a room's presence set.
    pub async fn member_count(&self, room_id: RoomId) -> usize {
        match self.feeds.get(&room_id).await {
            Some(feed) => feed.member_count().await,
            None => 0,
        }
    }

    /// Content of a room as currently stored.
    pub async fn content_of(&self, room_id: RoomId) -> Option<String> {
        self.tables
            .read()
            .await
            .rooms
            .get(&room_id)
            .and_then(|room| room.content.clone())
    }

    pub async fn stats(&self) -> BackendStats {
        BackendStats {
            rooms: self.tables.read().await.rooms.len(),
            active_feeds: self.feeds.feed_count().await,
            writes: self.writes.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> Option<&Arc<RoomStore>> {
        self.store.as_ref()
    }

    async fn require_room(&self, id: RoomId) -> Result<(), BackendError> {
        if self.tables.read().await.rooms.contains_key(&id) {
            Ok(())
        } else {
            Err(BackendError::NotFound)
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomBackend for MemoryBackend {
    async fn lookup_room_by_code(&self, code: &RoomCode) -> Result<Room, BackendError> {
        let tables = self.tables.read().await;
        tables
            .codes
            .get(code)
            .and_then(|id| tables.rooms.get(id))
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn create_room(&self, code: &RoomCode) -> Result<Room, BackendError> {
        let mut tables = self.tables.write().await;
        if tables.codes.contains_key(code) {
            return Err(BackendError::Conflict(code.clone()));
        }

        let room = Room::new(code.clone());
        if let Some(store) = &self.store {
            store.save_room(&room)?;
        }
        tables.insert(room.clone());
        log::info!("Created room {} ({})", room.room_code, room.id);
        Ok(room)
    }

    async fn update_room_content(&self, id: RoomId, content: &str) -> Result<(), BackendError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            self.rejected_writes.fetch_add(1, Ordering::Relaxed);
            return Err(BackendError::Rejected("writes are disabled".into()));
        }

        let mut tables = self.tables.write().await;
        let room = tables.rooms.get_mut(&id).ok_or(BackendError::NotFound)?;

        let mut updated = room.clone();
        updated.content = Some(content.to_string());
        if let Some(store) = &self.store {
            store.save_room(&updated)?;
        }
        *room = updated;
        self.writes.fetch_add(1, Ordering::Relaxed);

        if let Some(feed) = self.feeds.get(&id).await {
            let reached = feed.publish(FeedEvent::content(content));
            log::trace!("Content change for room {id} reached {reached} subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, id: RoomId) -> Result<FeedStream, BackendError> {
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected("subscriptions are disabled".into()));
        }
        self.require_room(id).await?;

        Ok(self.feeds.subscribe(id).await)
    }

    async fn track(&self, id: RoomId, member: MemberId) -> Result<(), BackendError> {
        self.require_room(id).await?;

        if self.feeds.track(id, member).await {
            log::info!("Presence: {member} joined room {id}");
        }
        Ok(())
    }

    async fn untrack(&self, id: RoomId, member: MemberId) -> Result<(), BackendError> {
        if let Some(feed) = self.feeds.get(&id).await {
            if feed.untrack(&member).await {
                log::info!("Presence: {member} left room {id}");
            }
            self.feeds.remove_if_idle(&id).await;
        }
        Ok(())
    }
}
