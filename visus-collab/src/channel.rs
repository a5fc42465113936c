//! Synchronization channel: typed pub/sub over the shared connection.
//!
//! A thin layer over [`ConnectionManager`] that scopes traffic to image
//! sessions. Joining an image subscribes this client to its annotation
//! and presence topics and announces presence; leaving reverses both.
//!
//! Subscriptions are tokio broadcast receivers: dropping the receiver
//! is the unsubscribe. Inbound frames whose origin is this client's own
//! connection id are filtered out before fan-out (loop prevention), as
//! are frames for images this client has not joined.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use visus_scene::{Annotation, ChangeKind, Point, RemoteChange};

use crate::connection::{ConnectionError, ConnectionManager};
use crate::presence::{CursorThrottle, PresenceEvent};
use crate::protocol::{CursorUpdate, MessageKind, ParticipantInfo, WireMessage};

/// Fan-out capacity for typed event subscribers.
const EVENT_CAPACITY: usize = 256;

/// An inbound annotation event from another participant.
#[derive(Debug, Clone)]
pub struct AnnotationEvent {
    pub image_id: Uuid,
    pub change: RemoteChange,
}

/// Typed pub/sub over one shared socket.
pub struct SyncChannel {
    manager: ConnectionManager,
    me: ParticipantInfo,
    joined: Arc<RwLock<HashSet<Uuid>>>,
    annotations: broadcast::Sender<AnnotationEvent>,
    presence: broadcast::Sender<PresenceEvent>,
    cursor_throttle: Arc<Mutex<CursorThrottle>>,
}

impl SyncChannel {
    /// Create the channel and start routing inbound frames.
    pub fn new(manager: ConnectionManager, me: ParticipantInfo) -> Self {
        let (annotations, _) = broadcast::channel(EVENT_CAPACITY);
        let (presence, _) = broadcast::channel(EVENT_CAPACITY);
        let channel = Self {
            manager,
            me,
            joined: Arc::new(RwLock::new(HashSet::new())),
            annotations,
            presence,
            cursor_throttle: Arc::new(Mutex::new(CursorThrottle::default())),
        };
        channel.spawn_router();
        channel
    }

    /// Join an image session: subscribe both topics and announce
    /// presence. Idempotent — joining an already-joined image is a
    /// no-op.
    pub async fn join(&self, image_id: Uuid) -> Result<(), ConnectionError> {
        {
            let mut joined = self.joined.write().await;
            if !joined.insert(image_id) {
                return Ok(());
            }
        }
        let msg = WireMessage::presence_join(self.manager.connection_id(), image_id, &self.me);
        if let Err(e) = self.manager.send(msg).await {
            // Send failed: stay un-joined so a later join re-announces.
            self.joined.write().await.remove(&image_id);
            return Err(e);
        }
        log::debug!("joined image session {image_id}");
        Ok(())
    }

    /// Leave an image session: announce departure and unsubscribe.
    pub async fn leave(&self, image_id: Uuid) -> Result<(), ConnectionError> {
        if !self.joined.write().await.remove(&image_id) {
            return Ok(());
        }
        let msg = WireMessage::presence_leave(
            self.manager.connection_id(),
            image_id,
            self.me.user_id,
        );
        self.manager.send(msg).await
    }

    pub async fn is_joined(&self, image_id: Uuid) -> bool {
        self.joined.read().await.contains(&image_id)
    }

    /// Publish an annotation change. Delivery is at-most-once; this
    /// client's own emissions preserve send order (one socket), with no
    /// ordering guarantee across participants.
    pub async fn emit_annotation(
        &self,
        image_id: Uuid,
        kind: ChangeKind,
        annotation: &Annotation,
    ) -> Result<(), ConnectionError> {
        let msg = WireMessage::annotation(self.manager.connection_id(), image_id, kind, annotation);
        self.manager.send(msg).await
    }

    /// Broadcast a cursor position, best-effort.
    ///
    /// Lossy by design: updates are throttled to ~30/s and transport
    /// errors are swallowed — this is advisory UI, not state.
    pub async fn emit_cursor(&self, image_id: Uuid, position: Point) {
        if !self.cursor_throttle.lock().await.allow() {
            return;
        }
        let update = CursorUpdate {
            user_id: self.me.user_id,
            position,
        };
        let msg = WireMessage::cursor(self.manager.connection_id(), image_id, &update);
        if let Err(e) = self.manager.send(msg).await {
            log::trace!("cursor broadcast dropped: {e}");
        }
    }

    /// Subscribe to inbound annotation events. Dropping the receiver
    /// unsubscribes.
    pub fn annotation_events(&self) -> broadcast::Receiver<AnnotationEvent> {
        self.annotations.subscribe()
    }

    /// Subscribe to inbound presence events.
    pub fn presence_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    pub fn me(&self) -> &ParticipantInfo {
        &self.me
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Route inbound frames into the typed topic channels.
    fn spawn_router(&self) {
        let mut inbound = self.manager.subscribe_inbound();
        let own_id = self.manager.connection_id();
        let joined = self.joined.clone();
        let annotations = self.annotations.clone();
        let presence = self.presence.clone();

        tokio::spawn(async move {
            loop {
                let msg = match inbound.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("sync channel lagged by {n} frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                // Loop prevention: ignore our own echo.
                if msg.origin == own_id {
                    continue;
                }
                if !joined.read().await.contains(&msg.image_id) {
                    continue;
                }

                match msg.kind {
                    MessageKind::AnnotationAdd
                    | MessageKind::AnnotationModify
                    | MessageKind::AnnotationDelete => match msg.change() {
                        Ok(change) => {
                            let _ = annotations.send(AnnotationEvent {
                                image_id: msg.image_id,
                                change,
                            });
                        }
                        Err(e) => log::warn!("malformed annotation event: {e}"),
                    },
                    MessageKind::PresenceJoin => match msg.participant() {
                        Ok(participant) => {
                            let _ = presence.send(PresenceEvent::Joined {
                                image_id: msg.image_id,
                                participant,
                            });
                        }
                        Err(e) => log::warn!("malformed presence join: {e}"),
                    },
                    MessageKind::PresenceLeave => match msg.leaving_user() {
                        Ok(user_id) => {
                            let _ = presence.send(PresenceEvent::Left {
                                image_id: msg.image_id,
                                user_id,
                            });
                        }
                        Err(e) => log::warn!("malformed presence leave: {e}"),
                    },
                    MessageKind::Cursor => {
                        if let Ok(update) = msg.cursor_update() {
                            let _ = presence.send(PresenceEvent::Cursor {
                                image_id: msg.image_id,
                                user_id: update.user_id,
                                position: update.position,
                            });
                        }
                    }
                    // Lock traffic is the LockService's concern.
                    _ => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, Endpoint, StaticTokenProvider};

    fn offline_channel() -> SyncChannel {
        let manager = ConnectionManager::new(
            ConnectionConfig::new(Endpoint::new("ws://127.0.0.1:1", "http://127.0.0.1:1/health")),
            Arc::new(StaticTokenProvider::new("tok")),
        );
        SyncChannel::new(manager, ParticipantInfo::new("Tester"))
    }

    #[tokio::test]
    async fn test_join_without_connection_stays_unjoined() {
        let channel = offline_channel();
        let image = Uuid::new_v4();
        assert!(channel.join(image).await.is_err());
        assert!(!channel.is_joined(image).await);
    }

    #[tokio::test]
    async fn test_leave_unjoined_image_is_noop() {
        let channel = offline_channel();
        assert!(channel.leave(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cursor_emission_is_best_effort() {
        let channel = offline_channel();
        // Not connected — must not error.
        channel.emit_cursor(Uuid::new_v4(), Point::new(1.0, 2.0)).await;
    }
}
