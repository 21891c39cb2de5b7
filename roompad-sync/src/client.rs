//! WebSocket [`RoomBackend`] talking to a [`SyncServer`](crate::server::SyncServer).
//!
//! Provides:
//! - Request/response correlation by id, with a per-request timeout
//! - Feed routing: server-pushed events fan out to every local stream of a room
//! - Unsubscribe when the last local stream of a room is dropped
//!
//! There is no reconnect. When the connection drops, pending requests fail
//! with a transport error and every open feed stream ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::backend::{FeedEvent, FeedStream, RoomBackend};
use crate::config::ClientConfig;
use crate::error::{BackendError, ProtocolError};
use crate::protocol::{ClientFrame, Request, Response, ServerFrame};
use crate::room::{MemberId, Room, RoomCode, RoomId};

/// One local consumer of a room's feed.
struct Route {
    id: u64,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

/// State shared between the backend handle and its connection tasks.
struct Shared {
    outgoing: mpsc::Sender<Message>,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    routes: Mutex<HashMap<RoomId, Vec<Route>>>,
    next_route: AtomicU64,
    pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    connected: AtomicBool,
}

impl Shared {
    /// Queue a frame without waiting for room in the queue.
    fn send(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing
            .try_send(Message::Binary(bytes.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => ProtocolError::QueueFull,
                TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
            })
    }

    /// Register a pending request and queue its frame.
    fn enqueue(&self, request: Request) -> Result<(u64, oneshot::Receiver<Response>), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let bytes = ClientFrame::Request { id, request }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        // `send` checks `connected` again: `disconnect` clears it before clearing `pending`.
        if let Err(e) = self.send(bytes) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    /// Queue a request nobody waits for.
    fn fire_and_forget(&self, request: Request) {
        if let Err(e) = self.enqueue(request) {
            log::debug!("Dropped request: {e}");
        }
    }

    fn route(&self, room_id: RoomId, event: FeedEvent) {
        let mut routes = self.routes.lock();
        if let Some(room_routes) = routes.get_mut(&room_id) {
            room_routes.retain(|route| route.sender.send(event.clone()).is_ok());
        } else {
            log::trace!("Feed event for unrouted room {room_id}");
        }
    }

    /// Fail everything that is still waiting on the connection.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().clear();
        self.routes.lock().clear();
        self.pongs.lock().clear();
    }
}

/// Removes a route when its stream is dropped, unsubscribing the last one.
struct RouteGuard {
    shared: Arc<Shared>,
    room_id: RoomId,
    route_id: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        let mut routes = self.shared.routes.lock();
        let Some(room_routes) = routes.get_mut(&self.room_id) else {
            return;
        };
        room_routes.retain(|route| route.id != self.route_id);
        if room_routes.is_empty() {
            routes.remove(&self.room_id);
            // Queued under the routes lock so it cannot overtake a later subscribe.
            self.shared.fire_and_forget(Request::Unsubscribe(self.room_id));
        }
    }
}

/// Remote room backend over one WebSocket connection.
pub struct RemoteBackend {
    shared: Arc<Shared>,
    config: ClientConfig,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteBackend {
    /// Connect to the server at `config.url`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {}: {e}", config.url);
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(config.outgoing_capacity.max(1));
        let shared = Arc::new(Shared {
            outgoing: out_tx,
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            next_route: AtomicU64::new(0),
            pongs: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
        });

        // Writer task: forward outgoing queue to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: resolve responses, route feed frames
        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Response { id, response }) => {
                            let waiter = reader_shared.pending.lock().remove(&id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => log::debug!("Response {id} arrived after its request gave up"),
                            }
                        }
                        Ok(ServerFrame::Feed { room_id, event }) => {
                            reader_shared.route(room_id, event);
                        }
                        Ok(ServerFrame::Pong) => {
                            if let Some(tx) = reader_shared.pongs.lock().pop_front() {
                                let _ = tx.send(());
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            log::info!("Connection to sync server lost");
            reader_shared.disconnect();
        });

        log::info!("Connected to sync server at {}", config.url);
        Ok(Self {
            shared,
            config,
            reader,
            writer,
        })
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Round-trip a ping frame.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.shared.pongs.lock().push_back(tx);

        let bytes = ClientFrame::Ping.encode()?;
        if let Err(e) = self.shared.send(bytes) {
            self.shared.pongs.lock().pop_back();
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Response>,
    ) -> Result<Response, ProtocolError> {
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                log::warn!("Request {id} timed out");
                Err(ProtocolError::Timeout)
            }
        }
    }

    async fn request(&self, request: Request) -> Result<(u64, Response), ProtocolError> {
        let (id, rx) = self.shared.enqueue(request)?;
        Ok((id, self.wait(id, rx).await?))
    }

    async fn expect_room(&self, request: Request) -> Result<Room, BackendError> {
        match self.request(request).await? {
            (_, Response::Room(room)) => Ok(room),
            (_, Response::Failed(e)) => Err(e.into()),
            (id, Response::Ok) => Err(ProtocolError::UnexpectedResponse(id).into()),
        }
    }

    async fn expect_ok(&self, request: Request) -> Result<(), BackendError> {
        match self.request(request).await? {
            (_, Response::Ok) => Ok(()),
            (_, Response::Failed(e)) => Err(e.into()),
            (id, Response::Room(_)) => Err(ProtocolError::UnexpectedResponse(id).into()),
        }
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.disconnect();
    }
}

#[async_trait]
impl RoomBackend for RemoteBackend {
    async fn lookup_room_by_code(&self, code: &RoomCode) -> Result<Room, BackendError> {
        self.expect_room(Request::Lookup(code.clone())).await
    }

    async fn create_room(&self, code: &RoomCode) -> Result<Room, BackendError> {
        self.expect_room(Request::Create(code.clone())).await
    }

    async fn update_room_content(&self, id: RoomId, content: &str) -> Result<(), BackendError> {
        self.expect_ok(Request::Update {
            room_id: id,
            content: content.to_string(),
        })
        .await
    }

    async fn subscribe(&self, id: RoomId) -> Result<FeedStream, BackendError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let route_id = self.shared.next_route.fetch_add(1, Ordering::Relaxed);

        // Route before the request goes out so no pushed event is missed.
        let enqueued = {
            let mut routes = self.shared.routes.lock();
            routes.entry(id).or_default().push(Route {
                id: route_id,
                sender,
            });
            self.shared.enqueue(Request::Subscribe(id))
        };
        let guard = RouteGuard {
            shared: self.shared.clone(),
            room_id: id,
            route_id,
        };
        let (request_id, rx) = enqueued?;

        match self.wait(request_id, rx).await? {
            Response::Ok => {}
            Response::Failed(e) => return Err(e.into()),
            Response::Room(_) => {
                return Err(ProtocolError::UnexpectedResponse(request_id).into());
            }
        }

        log::debug!("Subscribed to room {id}");
        let feed = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            receiver.recv().await.map(|event| (event, (receiver, guard)))
        });
        Ok(feed.boxed())
    }

    async fn track(&self, id: RoomId, member: MemberId) -> Result<(), BackendError> {
        self.expect_ok(Request::Track { room_id: id, member }).await
    }

    async fn untrack(&self, id: RoomId, member: MemberId) -> Result<(), BackendError> {
        self.expect_ok(Request::Untrack { room_id: id, member }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is never listening on a test host.
        let result = RemoteBackend::connect(ClientConfig::new("ws://127.0.0.1:1")).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    fn shared_with_queue(capacity: usize) -> (Arc<Shared>, mpsc::Receiver<Message>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            outgoing: out_tx,
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            next_route: AtomicU64::new(0),
            pongs: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
        });
        (shared, out_rx)
    }

    #[test]
    fn test_enqueue_fails_fast_after_disconnect() {
        let (shared, mut out_rx) = shared_with_queue(8);
        shared.disconnect();

        let result = shared.enqueue(Request::Untrack {
            room_id: RoomId::new(),
            member: MemberId::new(),
        });
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
        assert!(shared.pending.lock().is_empty());
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn test_full_outgoing_queue_rejects_request() {
        let (shared, mut out_rx) = shared_with_queue(1);

        assert!(shared.enqueue(Request::Subscribe(RoomId::new())).is_ok());
        let result = shared.enqueue(Request::Subscribe(RoomId::new()));
        assert!(matches!(result, Err(ProtocolError::QueueFull)));
        assert_eq!(shared.pending.lock().len(), 1);

        assert!(out_rx.try_recv().is_ok());
        assert!(shared.enqueue(Request::Subscribe(RoomId::new())).is_ok());
    }

    #[test]
    fn test_route_guard_unsubscribes_last_route() {
        let (shared, mut out_rx) = shared_with_queue(8);
        let room_id = RoomId::new();

        let mut guards = Vec::new();
        for route_id in 0..2 {
            let (sender, _receiver) = mpsc::unbounded_channel();
            shared
                .routes
                .lock()
                .entry(room_id)
                .or_default()
                .push(Route { id: route_id, sender });
            guards.push(RouteGuard {
                shared: shared.clone(),
                room_id,
                route_id,
            });
        }

        drop(guards.pop());
        assert!(out_rx.try_recv().is_err(), "One route is still open");

        drop(guards.pop());
        let Message::Binary(bytes) = out_rx.try_recv().unwrap() else {
            panic!("Expected a binary frame");
        };
        match ClientFrame::decode(&bytes).unwrap() {
            ClientFrame::Request { request, .. } => {
                assert_eq!(request, Request::Unsubscribe(room_id));
            }
            other => panic!("Expected Unsubscribe, got {other:?}"),
        }
        assert!(shared.routes.lock().is_empty());
    }
}
