//! Connection manager: the sole owner of the collaboration socket.
//!
//! One `ConnectionManager` owns one bidirectional WebSocket per client
//! process. Connecting is a three-step ladder:
//!
//! ```text
//! connect()
//!    │ 1. preflight: bounded-timeout health probe, primary then backup
//!    │      both fail ──► Unavailable (terminal until next connect())
//!    │ 2. bearer token from the injected TokenProvider
//!    │      none ──► Error event, Failed — no socket is opened
//!    ▼ 3. socket dial with the token attached, raced against a timeout
//! Connected ── socket error/close ──► Reconnecting (backoff, fresh
//!    │                                token per attempt)
//!    │                                   attempts exhausted ──► Failed
//!    └─ disconnect() ──► Idle           refused ──► Unavailable
//! ```
//!
//! A connection refusal (the server is not running) short-circuits the
//! backoff loop straight into `Unavailable`; retrying cannot succeed.
//!
//! Other components never touch the socket: they observe lifecycle
//! events through [`ConnectionManager::subscribe_events`] and decoded
//! frames through [`ConnectionManager::subscribe_inbound`], and send
//! through [`ConnectionManager::send`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::protocol::WireMessage;

/// Capacity of the outgoing writer queue and the inbound fan-out.
const CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    /// No endpoint is reachable; terminal until a fresh `connect()`.
    Unavailable,
    /// Reconnect attempts exhausted or auth failed; terminal until a
    /// fresh `connect()`.
    Failed,
}

/// Lifecycle events, observable by any number of subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established,
    Closed,
    Error(String),
    Unavailable,
    Failed,
}

/// A collaboration server endpoint: the socket URL plus the HTTP URL
/// its reachability probe answers on.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub ws_url: String,
    pub health_url: String,
}

impl Endpoint {
    pub fn new(ws_url: impl Into<String>, health_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            health_url: health_url.into(),
        }
    }
}

/// Tunable parameters for the exponential-backoff reconnect strategy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Factor by which the delay grows after each failed attempt.
    pub growth: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Attempt cap; exceeding it is terminal failure.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            growth: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Next backoff delay, clamped to the policy maximum.
pub fn next_delay(current: Duration, policy: &ReconnectPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.growth) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Connection manager configuration. All collaborators are injected;
/// there is no ambient global state.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub primary: Endpoint,
    pub backup: Option<Endpoint>,
    pub preflight_timeout: Duration,
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings on a live socket.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(primary: Endpoint) -> Self {
        Self {
            primary,
            backup: None,
            preflight_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_backup(mut self, backup: Endpoint) -> Self {
        self.backup = Some(backup);
        self
    }
}

/// Supplies a short-lived bearer credential on demand.
///
/// Absence of a token is a hard precondition failure: the manager
/// reports it and stops without opening a socket.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, TokenError>;
}

/// The identity collaborator could not produce a token.
#[derive(Debug, Clone)]
pub struct TokenError(pub String);

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token unavailable: {}", self.0)
    }
}

impl std::error::Error for TokenError {}

/// Token provider backed by a fixed credential.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}

/// Connection-layer errors.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// Preflight failed on every known endpoint.
    Unavailable,
    /// The server actively refused the socket.
    Refused,
    /// The identity collaborator produced no token.
    Auth(String),
    /// The socket dial exceeded the connect timeout.
    Timeout,
    /// Transport-level failure.
    Socket(String),
    /// No socket is open.
    NotConnected,
    /// The reconnect attempt cap was exceeded.
    AttemptsExhausted(u32),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "No collaboration endpoint is reachable"),
            Self::Refused => write!(f, "Connection refused by the server"),
            Self::Auth(e) => write!(f, "Authentication failed: {e}"),
            Self::Timeout => write!(f, "Connection attempt timed out"),
            Self::Socket(e) => write!(f, "Socket error: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::AttemptsExhausted(n) => write!(f, "Gave up after {n} reconnect attempts"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Owns the collaboration socket and its lifecycle.
///
/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct ConnectionManager {
    connection_id: Uuid,
    config: Arc<ConnectionConfig>,
    tokens: Arc<dyn TokenProvider>,
    http: reqwest::Client,
    state: Arc<RwLock<ConnectionState>>,
    /// The endpoint the last successful preflight chose.
    active: Arc<RwLock<Option<Endpoint>>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<WireMessage>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: broadcast::Sender<WireMessage>,
    /// Reconnect attempt counter, scoped to this instance's lifecycle.
    attempts: Arc<RwLock<u32>>,
    /// Socket generation; bumped by disconnect() and each new socket so
    /// stale reader tasks do not trigger reconnects.
    generation: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            connection_id: Uuid::new_v4(),
            config: Arc::new(config),
            tokens,
            http: reqwest::Client::new(),
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            active: Arc::new(RwLock::new(None)),
            outgoing: Arc::new(RwLock::new(None)),
            events,
            inbound,
            attempts: Arc::new(RwLock::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// This client's connection id, used as the origin of every frame
    /// it sends.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Subscribe to connection lifecycle events.
    ///
    /// Independent of any sync-channel subscriber; every higher-level
    /// component sharing the socket can hold its own receiver. Dropping
    /// the receiver unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to decoded inbound frames.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<WireMessage> {
        self.inbound.subscribe()
    }

    /// Establish the connection: preflight, authenticate, dial.
    ///
    /// No-op when already `Connected` or `Connecting`. A dial timeout or
    /// transient error enters the backoff loop; the result reflects the
    /// final outcome.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }

        let Some(endpoint) = self.preflight().await else {
            self.set_state(ConnectionState::Unavailable).await;
            self.emit(ConnectionEvent::Unavailable);
            return Err(ConnectionError::Unavailable);
        };
        *self.active.write().await = Some(endpoint.clone());

        let token = match self.tokens.bearer_token().await {
            Ok(token) => token,
            Err(e) => return Err(self.fail_auth(e).await),
        };

        match self.open_socket(&endpoint, &token).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::Refused) => {
                self.set_state(ConnectionState::Unavailable).await;
                self.emit(ConnectionEvent::Unavailable);
                Err(ConnectionError::Refused)
            }
            Err(e) => {
                log::warn!("initial dial failed ({e}), entering backoff");
                self.reconnect_loop(&endpoint).await
            }
        }
    }

    /// Close the socket and clear connection state. Idempotent.
    pub async fn disconnect(&self) {
        // Orphan any live reader task so it does not schedule a reconnect.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let had_socket = self.outgoing.write().await.take().is_some();
        *self.attempts.write().await = 0;
        *self.active.write().await = None;
        let was_connected = {
            let mut state = self.state.write().await;
            let was = *state == ConnectionState::Connected;
            *state = ConnectionState::Idle;
            was
        };
        if had_socket && was_connected {
            self.emit(ConnectionEvent::Closed);
        }
    }

    /// Queue a message for transmission.
    ///
    /// A single client's messages leave the wire in send order: they
    /// all funnel through one writer task.
    pub async fn send(&self, msg: WireMessage) -> Result<(), ConnectionError> {
        let guard = self.outgoing.read().await;
        let Some(tx) = guard.as_ref() else {
            return Err(ConnectionError::NotConnected);
        };
        tx.send(msg).await.map_err(|_| ConnectionError::NotConnected)
    }

    /// Probe the primary endpoint, then the backup. Returns the first
    /// endpoint that answers its health URL within the preflight timeout.
    async fn preflight(&self) -> Option<Endpoint> {
        if self.probe(&self.config.primary).await {
            return Some(self.config.primary.clone());
        }
        if let Some(backup) = &self.config.backup {
            log::info!("primary endpoint unreachable, trying backup");
            if self.probe(backup).await {
                return Some(backup.clone());
            }
        }
        None
    }

    async fn probe(&self, endpoint: &Endpoint) -> bool {
        let request = self.http.get(&endpoint.health_url).send();
        match tokio::time::timeout(self.config.preflight_timeout, request).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                log::warn!("health probe {} failed: {e}", endpoint.health_url);
                false
            }
            Err(_) => {
                log::warn!("health probe {} timed out", endpoint.health_url);
                false
            }
        }
    }

    /// Dial the socket and, on success, start the writer/reader tasks.
    async fn open_socket(&self, endpoint: &Endpoint, token: &str) -> Result<(), ConnectionError> {
        let url = format!(
            "{}?token={token}&connection={}",
            endpoint.ws_url, self.connection_id
        );

        let dialed = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(&url),
        )
        .await;

        let ws_stream = match dialed {
            Err(_) => return Err(ConnectionError::Timeout),
            Ok(Err(e)) if is_refused(&e) => return Err(ConnectionError::Refused),
            Ok(Err(e)) => return Err(ConnectionError::Socket(e.to_string())),
            Ok(Ok((ws_stream, _response))) => ws_stream,
        };

        let (mut writer, mut reader) = ws_stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer task: drain the outgoing queue onto the socket, then
        // send a close frame when the queue owner goes away.
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(CHANNEL_CAPACITY);

        // Heartbeat: periodic pings keep intermediaries from timing the
        // socket out and surface a dead peer through the write path.
        // Holds only a weak sender so it cannot keep the queue alive
        // past disconnect().
        let heartbeat = self.config.heartbeat_interval;
        let ping_origin = self.connection_id;
        let weak_tx = out_tx.downgrade();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat).await;
                let Some(tx) = weak_tx.upgrade() else { break };
                if tx.send(WireMessage::ping(ping_origin)).await.is_err() {
                    break; // socket gone
                }
            }
        });

        *self.outgoing.write().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match msg.encode() {
                    Ok(bytes) => {
                        if writer.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("dropping unencodable frame: {e}"),
                }
            }
            let _ = writer.send(Message::Close(None)).await;
        });

        // Reader task: decode frames onto the inbound fan-out; on socket
        // loss, hand off to the reconnect loop unless superseded.
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(msg) => {
                                let _ = manager.inbound.send(msg);
                            }
                            Err(e) => log::warn!("undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if manager.generation.load(Ordering::SeqCst) != generation {
                return; // disconnect() or a newer socket took over
            }
            manager.outgoing.write().await.take();
            manager.emit(ConnectionEvent::Closed);
            let Some(endpoint) = manager.active.read().await.clone() else {
                return;
            };
            log::info!("socket lost, reconnecting");
            manager.spawn_reconnect(endpoint);
        });

        *self.attempts.write().await = 0;
        self.set_state(ConnectionState::Connected).await;
        self.emit(ConnectionEvent::Established);
        Ok(())
    }

    /// Backoff loop: sleep, refresh the token, redial; delay grows per
    /// attempt. Refusal and token absence are terminal; exceeding the
    /// attempt cap reports `Failed`.
    async fn reconnect_loop(&self, endpoint: &Endpoint) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Reconnecting).await;
        let policy = &self.config.reconnect;
        let mut delay = policy.base_delay;

        loop {
            let attempt = {
                let mut attempts = self.attempts.write().await;
                *attempts += 1;
                *attempts
            };
            if attempt > policy.max_attempts {
                self.set_state(ConnectionState::Failed).await;
                self.emit(ConnectionEvent::Failed);
                return Err(ConnectionError::AttemptsExhausted(policy.max_attempts));
            }
            log::info!(
                "reconnect attempt {attempt}/{} after {}ms",
                policy.max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;

            // Short-lived credential: refresh on every attempt.
            let token = match self.tokens.bearer_token().await {
                Ok(token) => token,
                Err(e) => return Err(self.fail_auth(e).await),
            };

            match self.open_socket(endpoint, &token).await {
                Ok(()) => return Ok(()),
                Err(ConnectionError::Refused) => {
                    self.set_state(ConnectionState::Unavailable).await;
                    self.emit(ConnectionEvent::Unavailable);
                    return Err(ConnectionError::Refused);
                }
                Err(e) => {
                    log::warn!("reconnect attempt {attempt} failed: {e}");
                    delay = next_delay(delay, policy);
                }
            }
        }
    }

    /// Run the reconnect loop on its own task. Boxed so the reader task
    /// that schedules it does not embed the loop's future type.
    fn spawn_reconnect(&self, endpoint: Endpoint) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reconnect: futures_util::future::BoxFuture<'_, Result<(), ConnectionError>> =
                Box::pin(manager.reconnect_loop(&endpoint));
            if let Err(e) = reconnect.await {
                log::warn!("reconnect abandoned: {e}");
            }
        });
    }

    async fn fail_auth(&self, e: TokenError) -> ConnectionError {
        self.set_state(ConnectionState::Failed).await;
        self.emit(ConnectionEvent::Error(e.to_string()));
        ConnectionError::Auth(e.to_string())
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

fn is_refused(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused)
}
