//! The room synchronization state machine.
//!
//! ```text
//!             enter_room                 lookup ok
//! Unattached ───────────► Loading ───────────────────► Active
//!                            │ lookup failed             │ leave_room
//!                            ▼                           ▼
//!                          Closed ◄──────────────────────┘
//!                            │ enter_room
//!                            └──────────► Loading
//! ```
//!
//! While a room is active the controller owns three things: the room's
//! [`RoomState`], a [`DebounceScheduler`] feeding the [`RemoteWriter`], and a
//! [`ChangeSubscription`]. Timer fires, write completions and feed events all
//! run on their own tasks and reach the state through a shared cell that
//! serialises mutations and publishes a fresh [`RoomView`] after each one.
//! Once the cell is closed it ignores everything, so stragglers from a room
//! that was left cannot touch the next one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::backend::RoomBackend;
use crate::config::SyncConfig;
use crate::debounce::DebounceScheduler;
use crate::error::SyncError;
use crate::room::{MemberId, Room, RoomCode, RoomId};
use crate::state::{Phase, RoomState, RoomView};
use crate::subscription::{ChangeSubscription, SubscriptionHandlers};
use crate::writer::{RemoteWriter, WriterStats};

/// User-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    RoomCreated { code: RoomCode },
    RoomNotFound { code: RoomCode },
    LookupFailed { code: RoomCode, reason: String },
    CreateFailed { reason: String },
    WriteFailed { reason: String },
    SubscriptionFailed { reason: String },
    FeedEnded,
}

impl fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncNotice::RoomCreated { code } => write!(f, "Room created! Share code: {code}"),
            SyncNotice::RoomNotFound { code } => write!(f, "Room {code} not found"),
            SyncNotice::LookupFailed { code, reason } => {
                write!(f, "Could not open room {code}: {reason}")
            }
            SyncNotice::CreateFailed { .. } => f.write_str("Failed to create room"),
            SyncNotice::WriteFailed { .. } => f.write_str("Failed to update content"),
            SyncNotice::SubscriptionFailed { .. } => f.write_str("Live updates unavailable"),
            SyncNotice::FeedEnded => f.write_str("Live updates stopped"),
        }
    }
}

/// Shared cell around the state of the open room.
struct LiveRoom {
    code: RoomCode,
    state: Mutex<RoomState>,
    live: AtomicBool,
    feed_ended: AtomicBool,
    closed: AtomicBool,
    view_tx: Arc<watch::Sender<RoomView>>,
}

impl LiveRoom {
    fn new(code: RoomCode, state: RoomState, view_tx: Arc<watch::Sender<RoomView>>) -> Self {
        Self {
            code,
            state: Mutex::new(state),
            live: AtomicBool::new(false),
            feed_ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            view_tx,
        }
    }

    fn room_id(&self) -> RoomId {
        self.state.lock().room_id()
    }

    /// Apply `f` and publish the result. Returns `false` once closed.
    fn mutate(&self, f: impl FnOnce(&mut RoomState)) -> bool {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        f(&mut state);
        self.publish(&state);
        true
    }

    /// Mark the feed as delivering. Has no effect once the feed has ended.
    fn mark_live(&self) {
        let state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) || self.feed_ended.load(Ordering::SeqCst) {
            return;
        }
        self.live.store(true, Ordering::SeqCst);
        self.publish(&state);
    }

    /// Record that the feed ended. Returns `true` the first time, while open.
    fn end_feed(&self) -> bool {
        let state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) || self.feed_ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.live.store(false, Ordering::SeqCst);
        self.publish(&state);
        true
    }

    fn publish(&self, state: &RoomState) {
        self.view_tx.send_replace(RoomView::of(
            state,
            &self.code,
            Phase::Active,
            self.live.load(Ordering::SeqCst),
        ));
    }

    fn close(&self) {
        let _state = self.state.lock();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Drives one client's view of at most one room.
pub struct SyncController {
    backend: Arc<dyn RoomBackend>,
    config: SyncConfig,
    member_id: MemberId,
    writer: RemoteWriter,
    phase: Phase,
    room: Option<Arc<LiveRoom>>,
    debounce: Option<DebounceScheduler<String>>,
    subscription: Option<ChangeSubscription>,
    view_tx: Arc<watch::Sender<RoomView>>,
    notice_tx: mpsc::UnboundedSender<SyncNotice>,
    notice_rx: Option<mpsc::UnboundedReceiver<SyncNotice>>,
}

impl SyncController {
    pub fn new(backend: Arc<dyn RoomBackend>, config: SyncConfig) -> Self {
        let (view_tx, _) = watch::channel(RoomView::default());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            writer: RemoteWriter::new(backend.clone()),
            backend,
            config,
            member_id: MemberId::new(),
            phase: Phase::Unattached,
            room: None,
            debounce: None,
            subscription: None,
            view_tx: Arc::new(view_tx),
            notice_tx,
            notice_rx: Some(notice_rx),
        }
    }

    /// Open the room named by user input.
    ///
    /// Any room already open is left first. On failure the controller ends
    /// up `Closed` and the caller should send the user back to room entry.
    pub async fn enter_room(&mut self, input: &str) -> Result<RoomView, SyncError> {
        let code = RoomCode::parse(input).ok_or(SyncError::EmptyRoomCode)?;

        if self.room.is_some() {
            self.leave_room().await;
        }

        self.phase = Phase::Loading;
        self.view_tx.send_replace(RoomView {
            room_code: Some(code.clone()),
            ..RoomView::detached(Phase::Loading)
        });
        log::info!("Entering room {code}");

        let room = match self.backend.lookup_room_by_code(&code).await {
            Ok(room) => room,
            Err(e) => {
                self.phase = Phase::Closed;
                self.view_tx.send_replace(RoomView::detached(Phase::Closed));
                let notice = if e.is_not_found() {
                    SyncNotice::RoomNotFound { code: code.clone() }
                } else {
                    SyncNotice::LookupFailed {
                        code: code.clone(),
                        reason: e.to_string(),
                    }
                };
                log::warn!("Lookup of room {code} failed: {e}");
                self.notify(notice);
                return Err(SyncError::LookupFailed { code, source: e });
            }
        };

        let room_id = room.id;
        let live = Arc::new(LiveRoom::new(
            code,
            RoomState::new(room_id, room.content),
            self.view_tx.clone(),
        ));
        self.phase = Phase::Active;
        live.mutate(|_| {});

        self.debounce = Some(self.write_scheduler(&live));
        self.room = Some(live.clone());

        match ChangeSubscription::open(
            self.backend.clone(),
            room_id,
            self.member_id,
            self.subscription_handlers(&live),
        )
        .await
        {
            Ok(subscription) => {
                live.mark_live();
                self.subscription = Some(subscription);
            }
            Err(e) => {
                log::warn!("Room {room_id} opened without live updates: {e}");
                self.notify(SyncNotice::SubscriptionFailed {
                    reason: e.to_string(),
                });
            }
        }

        Ok(self.view())
    }

    /// Apply text the user typed and schedule it for writing.
    pub fn on_user_edited(&mut self, text: impl Into<String>) -> Result<(), SyncError> {
        let (Phase::Active, Some(room), Some(debounce)) =
            (self.phase, self.room.as_ref(), self.debounce.as_mut())
        else {
            return Err(SyncError::NotActive);
        };

        let text = text.into();
        room.mutate(|state| state.apply_local_edit(text.clone()));
        debounce.schedule(text, self.config.debounce_delay);
        Ok(())
    }

    /// Cancel any pending write, close the subscription and drop the room.
    ///
    /// A write that already fired is not cancelled.
    pub async fn leave_room(&mut self) {
        if let Some(mut debounce) = self.debounce.take() {
            if debounce.cancel() {
                log::debug!("Dropped pending write on leave");
            }
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close().await;
        }
        if let Some(room) = self.room.take() {
            room.close();
            log::info!("Left room {}", room.code);
        }

        if self.phase != Phase::Unattached {
            self.phase = Phase::Closed;
            self.view_tx.send_replace(RoomView::detached(Phase::Closed));
        }
    }

    /// Create a room under a freshly generated code.
    pub async fn create_room(&mut self) -> Result<Room, SyncError> {
        let code = RoomCode::generate();
        match self.backend.create_room(&code).await {
            Ok(room) => {
                log::info!("Created room {code}");
                self.notify(SyncNotice::RoomCreated { code });
                Ok(room)
            }
            Err(e) => {
                log::warn!("Failed to create room {code}: {e}");
                self.notify(SyncNotice::CreateFailed {
                    reason: e.to_string(),
                });
                Err(SyncError::CreateFailed(e))
            }
        }
    }

    /// Current view snapshot.
    pub fn view(&self) -> RoomView {
        self.view_tx.borrow().clone()
    }

    /// Receiver that sees every published view.
    pub fn watch(&self) -> watch::Receiver<RoomView> {
        self.view_tx.subscribe()
    }

    /// Take the notice receiver (can only be called once).
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<SyncNotice>> {
        self.notice_rx.take()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notice_tx.send(notice);
    }

    fn write_scheduler(&self, live: &Arc<LiveRoom>) -> DebounceScheduler<String> {
        let room = live.clone();
        let writer = self.writer.clone();
        let notices = self.notice_tx.clone();

        DebounceScheduler::new(move |text: String| {
            let room = room.clone();
            let writer = writer.clone();
            let notices = notices.clone();
            async move {
                if let Err(e) = writer.write(room.room_id(), &text).await {
                    if room.mutate(RoomState::mark_write_failed) {
                        let _ = notices.send(SyncNotice::WriteFailed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        })
    }

    fn subscription_handlers(&self, live: &Arc<LiveRoom>) -> SubscriptionHandlers {
        let content_room = live.clone();
        let presence_room = live.clone();
        let ended_room = live.clone();
        let notices = self.notice_tx.clone();

        SubscriptionHandlers {
            on_content: Arc::new(move |text: Option<String>| {
                content_room.mutate(|state| state.apply_remote_update(text));
            }),
            on_presence: Arc::new(move |count: usize| {
                presence_room.mutate(|state| state.apply_presence_snapshot(count));
            }),
            on_ended: Some(Box::new(move || {
                if ended_room.end_feed() {
                    let _ = notices.send(SyncNotice::FeedEnded);
                }
            })),
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        if let Some(room) = self.room.take() {
            room.close();
        }
    }
}
