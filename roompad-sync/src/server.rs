//! WebSocket server exposing a [`MemoryBackend`] to remote clients.
//!
//! Architecture:
//! ```text
//! Client A ──┐                  ┌── rooms table ── RoomStore (RocksDB, optional)
//!             ├── connection ───┤
//! Client B ──┘    task          └── RoomFeed (per room) ── feed forwarders
//!                  │                                          │
//!                  ▼                                          ▼
//!           request / response                       ServerFrame::Feed
//! ```
//!
//! Each connection is served by one task that handles its requests in
//! arrival order, plus one writer task draining the outgoing queue and one
//! forwarder task per subscribed room. Presence entries a connection tracked
//! are untracked when it closes, so a client that vanishes does not linger
//! in anyone's participant count.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::backend::RoomBackend;
use crate::config::ServerConfig;
use crate::error::{BackendError, StoreError, WireError};
use crate::memory::MemoryBackend;
use crate::protocol::{ClientFrame, Request, Response, ServerFrame};
use crate::room::{MemberId, RoomId};
use crate::storage::{RoomStore, StoreConfig};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes: u64,
}

/// Per-connection bookkeeping released on close.
#[derive(Default)]
struct Connection {
    forwarders: HashMap<RoomId, JoinHandle<()>>,
    tracked: HashSet<(RoomId, MemberId)>,
}

impl Connection {
    fn unsubscribe(&mut self, room_id: &RoomId) -> bool {
        match self.forwarders.remove(room_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    backend: Arc<MemoryBackend>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let backend = match &config.storage_path {
            Some(path) => {
                let store = RoomStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                MemoryBackend::with_store(Arc::new(store), config.feed_capacity)?
            }
            None => MemoryBackend::with_capacity(config.feed_capacity),
        };
        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Serve an existing backend.
    pub fn with_backend(config: ServerConfig, backend: Arc<MemoryBackend>) -> Self {
        Self {
            config,
            backend,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let backend = self.backend.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, backend, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        backend: Arc<MemoryBackend>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: forward outgoing queue to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut connection = Connection::default();

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    stats.write().await.total_bytes += data.len() as u64;

                    let frame = match ClientFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Failed to decode frame from {addr}: {e}");
                            continue;
                        }
                    };

                    match frame {
                        ClientFrame::Request { id, request } => {
                            log::debug!("Request {id} ({}) from {addr}", request.kind());
                            let response =
                                Self::handle_request(&backend, &mut connection, &out_tx, request)
                                    .await;

                            {
                                let mut s = stats.write().await;
                                s.total_requests += 1;
                                if matches!(response, Response::Failed(_)) {
                                    s.failed_requests += 1;
                                }
                            }

                            send_frame(&out_tx, &ServerFrame::Response { id, response });
                        }
                        ClientFrame::Ping => {
                            send_frame(&out_tx, &ServerFrame::Pong);
                        }
                    }
                }

                Ok(Message::Ping(data)) => {
                    let _ = out_tx.send(Message::Pong(data));
                }

                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }

                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }

                _ => {}
            }
        }

        // Cleanup: stop forwarding and drop this connection's presence
        for (_, handle) in connection.forwarders.drain() {
            handle.abort();
        }
        for (room_id, member) in connection.tracked.drain() {
            if let Err(e) = backend.untrack(room_id, member).await {
                log::warn!("Failed to untrack {member} from room {room_id}: {e}");
            }
        }
        // The writer exits once the last sender is gone.
        drop(out_tx);
        drop(writer);

        stats.write().await.active_connections -= 1;
        log::info!("Connection from {addr} cleaned up");
        Ok(())
    }

    async fn handle_request(
        backend: &Arc<MemoryBackend>,
        connection: &mut Connection,
        out_tx: &mpsc::UnboundedSender<Message>,
        request: Request,
    ) -> Response {
        let result: Result<Response, BackendError> = match request {
            Request::Lookup(code) => backend.lookup_room_by_code(&code).await.map(Response::Room),
            Request::Create(code) => backend.create_room(&code).await.map(Response::Room),
            Request::Update { room_id, content } => backend
                .update_room_content(room_id, &content)
                .await
                .map(|()| Response::Ok),
            Request::Subscribe(room_id) => match backend.subscribe(room_id).await {
                Ok(mut feed) => {
                    let out_tx = out_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = feed.next().await {
                            let frame = ServerFrame::Feed { room_id, event };
                            if !send_frame(&out_tx, &frame) {
                                break;
                            }
                        }
                    });
                    if let Some(previous) = connection.forwarders.insert(room_id, forwarder) {
                        previous.abort();
                    }
                    Ok(Response::Ok)
                }
                Err(e) => Err(e),
            },
            Request::Unsubscribe(room_id) => {
                connection.unsubscribe(&room_id);
                Ok(Response::Ok)
            }
            Request::Track { room_id, member } => {
                backend.track(room_id, member).await.map(|()| {
                    connection.tracked.insert((room_id, member));
                    Response::Ok
                })
            }
            Request::Untrack { room_id, member } => {
                connection.tracked.remove(&(room_id, member));
                backend.untrack(room_id, member).await.map(|()| Response::Ok)
            }
        };

        result.unwrap_or_else(|e| {
            log::debug!("Request failed: {e}");
            Response::Failed(WireError::from(&e))
        })
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The backend this server exposes.
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

/// Queue a frame for the writer task. Returns `false` once the connection is gone.
fn send_frame(out_tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) -> bool {
    match frame.encode() {
        Ok(bytes) => out_tx.send(Message::Binary(bytes.into())).is_ok(),
        Err(e) => {
            log::error!("Failed to encode server frame: {e}");
            true
        }
    }
}
