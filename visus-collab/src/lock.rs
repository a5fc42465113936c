//! Per-annotation exclusive locks.
//!
//! Two participants editing the same annotation would converge to
//! whichever modify frame lands last, silently discarding the other's
//! edit. The lock service turns that race into turn-taking: before a
//! modify or delete of a pre-existing annotation may commit, the editor
//! must hold the lock. Creation of new objects needs no lock.
//!
//! Locks are advisory at the protocol level — the server's lock table
//! is the source of truth. Acquire and query are request/reply over the
//! shared socket, correlated by a request id; release is fire-and-
//! forget. The client never auto-releases on disconnect; the server
//! releases a holder's locks when it observes the socket close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, Mutex};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::protocol::{LockReply, LockRequest, MessageKind, WireMessage};

/// How long to wait for the server's reply to an acquire/query.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time lock state. Stale the moment it returns — callers must
/// still attempt `acquire` before committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
}

/// Lock-layer errors. All recoverable: the caller decides whether to
/// retry or block the edit.
#[derive(Debug, Clone)]
pub enum LockError {
    /// The request could not be sent.
    Transport(String),
    /// The server did not answer within the reply window.
    Timeout,
    /// The connection went away while waiting for the reply.
    Closed,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Lock request failed: {e}"),
            Self::Timeout => write!(f, "Lock request timed out"),
            Self::Closed => write!(f, "Connection closed while waiting for lock reply"),
        }
    }
}

impl std::error::Error for LockError {}

/// Client side of the per-annotation lock protocol.
pub struct LockService {
    manager: ConnectionManager,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<LockReply>>>>,
    reply_timeout: Duration,
}

impl LockService {
    pub fn new(manager: ConnectionManager) -> Self {
        let service = Self {
            manager,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reply_timeout: REPLY_TIMEOUT,
        };
        service.spawn_listener();
        service
    }

    /// Attempt to take the exclusive lock on an annotation.
    ///
    /// `Ok(false)` means another participant holds it; the UI should
    /// block the edit rather than allow one that would be invisibly
    /// discarded. Re-acquiring a lock this client already holds
    /// succeeds.
    pub async fn acquire(&self, image_id: Uuid, annotation_id: Uuid) -> Result<bool, LockError> {
        let reply = self
            .request(image_id, annotation_id, MessageKind::LockAcquire)
            .await?;
        Ok(reply.granted)
    }

    /// Release a lock this client holds. Releasing a lock not held by
    /// this client is a no-op on the server, not an error.
    pub async fn release(&self, image_id: Uuid, annotation_id: Uuid) -> Result<(), LockError> {
        let request = LockRequest {
            request_id: Uuid::new_v4(),
            annotation_id,
        };
        let msg = WireMessage::lock_release(self.manager.connection_id(), image_id, &request);
        self.manager
            .send(msg)
            .await
            .map_err(|e| LockError::Transport(e.to_string()))
    }

    /// Point-in-time lock query. Advisory only.
    pub async fn status(&self, image_id: Uuid, annotation_id: Uuid) -> Result<LockStatus, LockError> {
        let reply = self
            .request(image_id, annotation_id, MessageKind::LockQuery)
            .await?;
        Ok(LockStatus {
            locked: reply.locked,
        })
    }

    async fn request(
        &self,
        image_id: Uuid,
        annotation_id: Uuid,
        kind: MessageKind,
    ) -> Result<LockReply, LockError> {
        let request = LockRequest {
            request_id: Uuid::new_v4(),
            annotation_id,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request.request_id, reply_tx);

        let origin = self.manager.connection_id();
        let msg = match kind {
            MessageKind::LockAcquire => WireMessage::lock_acquire(origin, image_id, &request),
            _ => WireMessage::lock_query(origin, image_id, &request),
        };
        if let Err(e) = self.manager.send(msg).await {
            self.pending.lock().await.remove(&request.request_id);
            return Err(LockError::Transport(e.to_string()));
        }

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LockError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request.request_id);
                Err(LockError::Timeout)
            }
        }
    }

    /// Resolve inbound lock replies to their awaiting requests.
    fn spawn_listener(&self) {
        let mut inbound = self.manager.subscribe_inbound();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            loop {
                let msg = match inbound.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("lock listener lagged by {n} frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if msg.kind != MessageKind::LockReply {
                    continue;
                }
                match msg.lock_outcome() {
                    Ok(reply) => {
                        if let Some(waiter) = pending.lock().await.remove(&reply.request_id) {
                            let _ = waiter.send(reply);
                        }
                    }
                    Err(e) => log::warn!("malformed lock reply: {e}"),
                }
            }
        });
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}
