//! Reference collaboration server with room-based image routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (image_id) ── participants ── lock table
//! Client B ──┘          │                               │
//!                       │ fan-out (origin-tagged)       │ released when
//!                       ▼                               │ the holder's
//!            Client A, Client B, …                      ▼ socket closes
//!                       │
//!                       └── AnnotationStore (optional fold-in)
//! ```
//!
//! Each image room maintains the participant roster, the authoritative
//! annotation set, and the per-annotation lock table. Annotation and
//! presence frames are relayed to everyone in the room except their
//! sender; lock acquire/query frames are answered directly to the
//! requesting connection. Locks held by a connection are released when
//! the server observes its socket close, followed by a presence-leave
//! broadcast — the client never has to clean up after itself.
//!
//! The handshake requires a `token` query parameter when configured;
//! token validation beyond presence is the identity provider's concern.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use visus_scene::{Annotation, ChangeKind};

use crate::protocol::{LockReply, MessageKind, ParticipantInfo, WireMessage};
use crate::storage::AnnotationStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,
    /// Address the HTTP health responder binds to, if any.
    pub health_addr: Option<String>,
    /// Reject handshakes without a `token` query parameter.
    pub require_token: bool,
    /// Maximum participants per image room.
    pub max_participants_per_room: usize,
    /// Fan-out channel capacity per room.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            health_addr: None,
            require_token: true,
            max_participants_per_room: 32,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// A held lock in a room's lock table.
struct LockHolder {
    connection: Uuid,
    #[allow(dead_code)]
    acquired_at: Instant,
}

/// One image room: roster, annotation fold, locks, fan-out.
struct Room {
    /// Origin-tagged frames; forwarders skip their own origin.
    fanout: broadcast::Sender<(Uuid, Arc<Vec<u8>>)>,
    /// connection id → participant identity.
    participants: HashMap<Uuid, ParticipantInfo>,
    /// annotation id → holder. At most one holder per annotation.
    locks: HashMap<Uuid, LockHolder>,
    /// Authoritative annotation set, folded from relayed events.
    annotations: HashMap<Uuid, Annotation>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(capacity);
        Self {
            fanout,
            participants: HashMap::new(),
            locks: HashMap::new(),
            annotations: HashMap::new(),
        }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<Uuid, Room>>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<dyn AnnotationStore>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Attach a persistence collaborator: annotation events are folded
    /// into the store so `load` calls and late joiners see saved state.
    pub fn with_store(mut self, store: Arc<dyn AnnotationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Run the accept loop. Call from an async runtime; runs until the
    /// listener errors.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(health_addr) = &self.config.health_addr {
            spawn_health_responder(health_addr.clone()).await?;
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let store = self.store.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats, config, store).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

/// Minimal HTTP responder for the reachability preflight. Answers 200
/// to anything; the probe only cares that the endpoint is alive.
async fn spawn_health_responder(addr: String) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(&addr).await?;
    log::info!("health responder listening on {addr}");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    Ok(())
}

/// Pull a query parameter out of a request URI.
fn query_param(request: &Request, name: &str) -> Option<String> {
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    })
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RwLock<HashMap<Uuid, Room>>>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
    store: Option<Arc<dyn AnnotationStore>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let require_token = config.require_token;
    let callback = move |request: &Request, response: Response| {
        if require_token {
            match query_param(request, "token") {
                Some(token) if !token.is_empty() => {}
                _ => {
                    log::warn!("rejecting unauthenticated handshake from {addr}");
                    let mut reject = ErrorResponse::new(Some("missing bearer token".into()));
                    *reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
                    return Err(reject);
                }
            }
        }
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("websocket established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Per-connection state, learned from the frames it sends.
    let mut origin: Option<Uuid> = None;
    let mut image_id: Option<Uuid> = None;
    let mut fanout_rx: Option<broadcast::Receiver<(Uuid, Arc<Vec<u8>>)>> = None;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let msg = match WireMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };
                        stats.write().await.total_messages += 1;
                        origin = Some(msg.origin);

                        match msg.kind {
                            MessageKind::PresenceJoin => {
                                let info = match msg.participant() {
                                    Ok(info) => info,
                                    Err(e) => {
                                        log::warn!("malformed join from {addr}: {e}");
                                        continue;
                                    }
                                };

                                // A connection sits in one room at a time;
                                // joining another image detaches it first.
                                if let Some(previous) = image_id.take() {
                                    if previous != msg.image_id {
                                        detach(&rooms, previous, msg.origin).await;
                                        fanout_rx = None;
                                    }
                                }

                                let mut rooms_w = rooms.write().await;
                                let is_new_room = !rooms_w.contains_key(&msg.image_id);
                                let room = rooms_w
                                    .entry(msg.image_id)
                                    .or_insert_with(|| Room::new(config.broadcast_capacity));

                                if room.participants.len() >= config.max_participants_per_room {
                                    log::warn!("room {} full, turning away {addr}", msg.image_id);
                                    drop(rooms_w);
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    break;
                                }

                                // Seed a fresh room from persistence.
                                if is_new_room {
                                    if let Some(ref store) = store {
                                        let image = msg.image_id;
                                        if let Ok(saved) = store.load_annotations(image).await {
                                            room.annotations =
                                                saved.into_iter().map(|a| (a.id, a)).collect();
                                        }
                                    }
                                }

                                log::info!(
                                    "{} ({}) joined image {}",
                                    info.name, info.user_id, msg.image_id
                                );
                                room.participants.insert(msg.origin, info);
                                image_id = Some(msg.image_id);
                                fanout_rx = Some(room.fanout.subscribe());
                                let _ = room.fanout.send((msg.origin, Arc::new(bytes)));

                                let room_count = rooms_w.len();
                                drop(rooms_w);
                                stats.write().await.active_rooms = room_count;
                            }

                            MessageKind::PresenceLeave => {
                                if let Some(image) = image_id.take() {
                                    let mut rooms_w = rooms.write().await;
                                    if let Some(room) = rooms_w.get_mut(&image) {
                                        room.participants.remove(&msg.origin);
                                        room.locks.retain(|_, holder| holder.connection != msg.origin);
                                        let _ = room.fanout.send((msg.origin, Arc::new(bytes)));
                                    }
                                }
                                fanout_rx = None;
                            }

                            MessageKind::AnnotationAdd
                            | MessageKind::AnnotationModify
                            | MessageKind::AnnotationDelete => {
                                let Some(image) = image_id else { continue };
                                let change = match msg.change() {
                                    Ok(change) => change,
                                    Err(e) => {
                                        log::warn!("malformed annotation event from {addr}: {e}");
                                        continue;
                                    }
                                };

                                // Fold into the authoritative set, relay,
                                // then persist outside the room lock.
                                let snapshot = {
                                    let mut rooms_w = rooms.write().await;
                                    let Some(room) = rooms_w.get_mut(&image) else { continue };
                                    match change.kind {
                                        ChangeKind::Add | ChangeKind::Modify => {
                                            room.annotations
                                                .insert(change.annotation.id, change.annotation.clone());
                                        }
                                        ChangeKind::Delete => {
                                            room.annotations.remove(&change.annotation.id);
                                        }
                                    }
                                    let _ = room.fanout.send((msg.origin, Arc::new(bytes)));
                                    store.as_ref().map(|_| {
                                        room.annotations.values().cloned().collect::<Vec<_>>()
                                    })
                                };
                                if let (Some(store), Some(snapshot)) = (&store, snapshot) {
                                    if let Err(e) = store.save_annotations(image, &snapshot).await {
                                        log::error!("failed to persist image {image}: {e}");
                                    }
                                }
                            }

                            MessageKind::Cursor => {
                                if let Some(image) = image_id {
                                    let rooms_r = rooms.read().await;
                                    if let Some(room) = rooms_r.get(&image) {
                                        let _ = room.fanout.send((msg.origin, Arc::new(bytes)));
                                    }
                                }
                            }

                            MessageKind::LockAcquire => {
                                let Some(image) = image_id else { continue };
                                let request = match msg.lock_request() {
                                    Ok(request) => request,
                                    Err(e) => {
                                        log::warn!("malformed lock acquire from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let granted = {
                                    let mut rooms_w = rooms.write().await;
                                    let Some(room) = rooms_w.get_mut(&image) else { continue };
                                    match room.locks.get(&request.annotation_id) {
                                        None => {
                                            room.locks.insert(request.annotation_id, LockHolder {
                                                connection: msg.origin,
                                                acquired_at: Instant::now(),
                                            });
                                            true
                                        }
                                        // Re-acquire by the current holder succeeds.
                                        Some(holder) => holder.connection == msg.origin,
                                    }
                                };
                                let reply = LockReply {
                                    request_id: request.request_id,
                                    annotation_id: request.annotation_id,
                                    granted,
                                    locked: true,
                                };
                                let frame = WireMessage::lock_reply(Uuid::nil(), image, &reply);
                                if let Ok(encoded) = frame.encode() {
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }

                            MessageKind::LockRelease => {
                                let Some(image) = image_id else { continue };
                                if let Ok(request) = msg.lock_request() {
                                    let mut rooms_w = rooms.write().await;
                                    if let Some(room) = rooms_w.get_mut(&image) {
                                        // Releasing someone else's lock is a no-op.
                                        if room
                                            .locks
                                            .get(&request.annotation_id)
                                            .is_some_and(|h| h.connection == msg.origin)
                                        {
                                            room.locks.remove(&request.annotation_id);
                                        }
                                    }
                                }
                            }

                            MessageKind::LockQuery => {
                                let Some(image) = image_id else { continue };
                                let Ok(request) = msg.lock_request() else { continue };
                                let locked = {
                                    let rooms_r = rooms.read().await;
                                    rooms_r
                                        .get(&image)
                                        .map(|room| room.locks.contains_key(&request.annotation_id))
                                        .unwrap_or(false)
                                };
                                let reply = LockReply {
                                    request_id: request.request_id,
                                    annotation_id: request.annotation_id,
                                    granted: false,
                                    locked,
                                };
                                let frame = WireMessage::lock_reply(Uuid::nil(), image, &reply);
                                if let Ok(encoded) = frame.encode() {
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }

                            MessageKind::Ping => {
                                let pong = WireMessage::pong(Uuid::nil());
                                if let Ok(encoded) = pong.encode() {
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }

                            MessageKind::LockReply | MessageKind::Pong => {
                                log::debug!("ignoring client-sent {:?}", msg.kind);
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::warn!("websocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            relayed = async {
                match fanout_rx {
                    Some(ref mut rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match relayed {
                    Ok((sender, data)) => {
                        // Don't echo frames back to their sender.
                        if Some(sender) == origin {
                            continue;
                        }
                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("{addr} lagged by {n} relayed frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Socket gone: release this connection's locks and broadcast its
    // departure so the room observes the disconnect.
    if let (Some(origin), Some(image)) = (origin, image_id) {
        detach(&rooms, image, origin).await;
    }
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms.read().await.len();
    }

    Ok(())
}

/// Remove a connection from a room: drop its roster entry, release
/// every lock it holds, broadcast presence-leave on its behalf, and
/// drop the room once empty.
async fn detach(rooms: &Arc<RwLock<HashMap<Uuid, Room>>>, image: Uuid, origin: Uuid) {
    let mut rooms_w = rooms.write().await;
    let Some(room) = rooms_w.get_mut(&image) else {
        return;
    };

    let released_before = room.locks.len();
    room.locks.retain(|_, holder| holder.connection != origin);
    let released = released_before - room.locks.len();
    if released > 0 {
        log::info!("released {released} locks held by departed connection {origin}");
    }

    if let Some(info) = room.participants.remove(&origin) {
        let leave = WireMessage::presence_leave(origin, image, info.user_id);
        if let Ok(encoded) = leave.encode() {
            let _ = room.fanout.send((origin, Arc::new(encoded)));
        }
        log::info!("{} ({}) left image {image}", info.name, info.user_id);
    }

    if room.participants.is_empty() && room.locks.is_empty() {
        rooms_w.remove(&image);
    }
}
