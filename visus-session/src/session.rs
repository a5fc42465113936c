//! The collaboration facade.
//!
//! `CollabSession` composes the scene engine, the sync channel, the
//! lock service, and the persistence collaborator into the session
//! lifecycle the UI consumes: join an image, annotate, undo, save,
//! leave. It is the single owner of the scene, so a local commit
//! (mutate scene → push snapshot → emit) always runs as one unit —
//! remote events are only applied between operations, via [`pump`].
//!
//! [`pump`]: CollabSession::pump
//!
//! Edit gating: modifying or deleting a pre-existing annotation first
//! acquires its exclusive lock; a denial surfaces as a lock-held notice
//! and the edit is blocked rather than invisibly discarded. Creating a
//! new annotation needs no lock.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use visus_collab::{
    AnnotationEvent, AnnotationStore, ConnectionError, ConnectionEvent, ConnectionManager,
    ConnectionState, LockService, ParticipantInfo, PresenceEvent, PresenceRoster, StoreError,
    SyncChannel,
};
use visus_scene::{
    Annotation, AnnotationShape, BaseImage, ChangeKind, Point, RenderError, SceneEngine, Tool,
    Viewport,
};

use crate::notice::{Notice, NoticeQueue};

/// Session-level errors the caller can act on. Everything else is
/// surfaced through the notice queue.
#[derive(Debug)]
pub enum SessionError {
    Render(RenderError),
    Connection(ConnectionError),
    Store(StoreError),
    /// An operation that needs a joined image session was called
    /// without one.
    NotJoined,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Render(e) => write!(f, "{e}"),
            SessionError::Connection(e) => write!(f, "{e}"),
            SessionError::Store(e) => write!(f, "{e}"),
            SessionError::NotJoined => write!(f, "No image session is joined"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RenderError> for SessionError {
    fn from(e: RenderError) -> Self {
        SessionError::Render(e)
    }
}

impl From<ConnectionError> for SessionError {
    fn from(e: ConnectionError) -> Self {
        SessionError::Connection(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

/// One participant's collaboration session.
pub struct CollabSession {
    engine: SceneEngine,
    channel: SyncChannel,
    locks: LockService,
    store: Arc<dyn AnnotationStore>,
    manager: ConnectionManager,
    image_id: Option<Uuid>,
    roster: PresenceRoster,
    notices: NoticeQueue,
    annotation_rx: broadcast::Receiver<AnnotationEvent>,
    presence_rx: broadcast::Receiver<PresenceEvent>,
    connection_rx: broadcast::Receiver<ConnectionEvent>,
}

impl CollabSession {
    pub fn new(
        manager: ConnectionManager,
        me: ParticipantInfo,
        store: Arc<dyn AnnotationStore>,
    ) -> Self {
        let engine = SceneEngine::new(me.user_id);
        let channel = SyncChannel::new(manager.clone(), me);
        let locks = LockService::new(manager.clone());
        let annotation_rx = channel.annotation_events();
        let presence_rx = channel.presence_events();
        let connection_rx = manager.subscribe_events();
        Self {
            engine,
            channel,
            locks,
            store,
            manager,
            image_id: None,
            roster: PresenceRoster::new(),
            notices: NoticeQueue::default(),
            annotation_rx,
            presence_rx,
            connection_rx,
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Establish the collaboration connection. Safe to call again after
    /// a terminal `Unavailable`/`Failed` state — this is the explicit
    /// user-initiated reconnect.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.manager.connect().await?;
        Ok(())
    }

    /// Join the collaboration session for one image.
    ///
    /// Initializes the scene on the viewport, loads the persisted
    /// annotation set as the undo baseline, and announces presence.
    pub async fn join(&mut self, base: BaseImage, viewport: Viewport) -> Result<(), SessionError> {
        self.engine.initialize(base, viewport)?;

        let saved = match self.store.load_annotations(base.id).await {
            Ok(saved) => saved,
            Err(e) => {
                self.notices.push(Notice::LoadFailed {
                    detail: e.to_string(),
                });
                return Err(e.into());
            }
        };
        if !saved.is_empty() {
            log::info!("loaded {} saved annotations for image {}", saved.len(), base.id);
        }
        self.engine.hydrate(saved);

        if let Err(e) = self.channel.join(base.id).await {
            self.notices.push(Notice::SyncFailed {
                detail: e.to_string(),
            });
            return Err(e.into());
        }
        self.image_id = Some(base.id);
        Ok(())
    }

    /// Leave the current image session and release scene resources.
    pub async fn leave(&mut self) {
        if let Some(image) = self.image_id.take() {
            if let Err(e) = self.channel.leave(image).await {
                log::warn!("presence leave not delivered: {e}");
            }
        }
        self.roster.clear();
        self.engine.dispose();
    }

    /// Disconnect the shared socket. The session can `connect` and
    /// `join` again afterwards.
    pub async fn disconnect(&mut self) {
        self.manager.disconnect().await;
    }

    // ── Local editing operations ────────────────────────────────────

    pub fn set_tool(&mut self, tool: Tool) {
        self.engine.set_active_tool(tool);
    }

    /// Pointer-down on the canvas. Commits (marker, second measure
    /// point) are emitted to the room.
    pub async fn pointer_down(&mut self, at: Point) {
        if let Some(committed) = self.engine.pointer_down(at) {
            self.emit(ChangeKind::Add, &committed).await;
        }
    }

    pub async fn pointer_move(&mut self, at: Point) {
        self.engine.pointer_move(at);
        let cursor = self.engine.view().map(|view| view.screen_to_image(at));
        if let (Some(image), Some(position)) = (self.image_id, cursor) {
            self.channel.emit_cursor(image, position).await;
        }
    }

    /// Pointer-up. Commits an in-progress drawing.
    pub async fn pointer_up(&mut self, at: Point) {
        if let Some(committed) = self.engine.pointer_up(at) {
            self.emit(ChangeKind::Add, &committed).await;
        }
    }

    /// Confirm the pending text note.
    pub async fn commit_text(&mut self, text: &str) {
        if let Some(committed) = self.engine.commit_text(text) {
            self.emit(ChangeKind::Add, &committed).await;
        }
    }

    pub fn cancel_text(&mut self) {
        self.engine.cancel_text();
    }

    /// Undo the last local commit. Local-only — no network event.
    pub fn undo(&mut self) -> bool {
        self.engine.undo()
    }

    /// Redo the last undone commit. Local-only.
    pub fn redo(&mut self) -> bool {
        self.engine.redo()
    }

    /// Replace the shape of an existing annotation, gated on its lock.
    ///
    /// Returns `true` when the edit committed. A lock denial pushes a
    /// lock-held notice and leaves the scene untouched.
    pub async fn modify_annotation(&mut self, id: Uuid, shape: AnnotationShape) -> bool {
        let Some(image) = self.image_id else {
            return false;
        };
        match self.locks.acquire(image, id).await {
            Ok(true) => {}
            Ok(false) => {
                self.notices.push(Notice::LockHeld { annotation_id: id });
                return false;
            }
            Err(e) => {
                self.notices.push(Notice::LockFailed {
                    detail: e.to_string(),
                });
                return false;
            }
        }

        let committed = self.engine.modify(id, shape);
        if let Some(updated) = committed {
            self.emit(ChangeKind::Modify, &updated).await;
        }
        if let Err(e) = self.locks.release(image, id).await {
            self.notices.push(Notice::LockFailed {
                detail: e.to_string(),
            });
        }
        true
    }

    /// Delete every selected annotation this client can lock.
    ///
    /// Annotations whose lock another participant holds stay in the
    /// scene, each with its own lock-held notice.
    pub async fn delete_selected(&mut self) -> Vec<Uuid> {
        let Some(image) = self.image_id else {
            return Vec::new();
        };
        let selected: Vec<Uuid> = self.engine.selection().iter().copied().collect();
        if selected.is_empty() {
            return Vec::new();
        }

        let mut deletable = Vec::new();
        for id in selected {
            match self.locks.acquire(image, id).await {
                Ok(true) => deletable.push(id),
                Ok(false) => self.notices.push(Notice::LockHeld { annotation_id: id }),
                Err(e) => self.notices.push(Notice::LockFailed {
                    detail: e.to_string(),
                }),
            }
        }

        // Narrow the selection to the locked subset, then commit the
        // removal as one snapshot.
        self.engine.clear_selection();
        let doomed: Vec<Annotation> = deletable
            .iter()
            .filter_map(|id| self.engine.annotation(*id).cloned())
            .collect();
        for annotation in &doomed {
            self.engine.extend_selection(annotation.id);
        }
        let removed = self.engine.delete_selected();

        for annotation in &doomed {
            if removed.contains(&annotation.id) {
                self.emit(ChangeKind::Delete, annotation).await;
            }
        }
        for id in &removed {
            if let Err(e) = self.locks.release(image, *id).await {
                log::warn!("lock release for deleted {id} failed: {e}");
            }
        }
        removed
    }

    /// Persist the current annotation set. Failures surface as a
    /// save-failed notice with a retry affordance — call `save` again.
    pub async fn save(&mut self) -> Result<(), SessionError> {
        let Some(image) = self.image_id else {
            return Err(SessionError::NotJoined);
        };
        if let Err(e) = self
            .store
            .save_annotations(image, self.engine.annotations())
            .await
        {
            self.notices.push(Notice::SaveFailed {
                detail: e.to_string(),
            });
            return Err(e.into());
        }
        log::debug!("saved {} annotations for image {image}", self.engine.annotations().len());
        Ok(())
    }

    // ── Remote application ──────────────────────────────────────────

    /// Apply everything that arrived since the last call: remote
    /// annotation events, presence changes, connection lifecycle.
    ///
    /// Called by the UI between input events (never mid-commit), which
    /// keeps local commit units atomic with respect to remote
    /// application.
    pub fn pump(&mut self) {
        loop {
            match self.annotation_rx.try_recv() {
                Ok(event) => {
                    if Some(event.image_id) == self.image_id {
                        self.engine.apply_remote(&event.change);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("dropped {n} remote annotation events");
                }
                Err(_) => break,
            }
        }

        loop {
            match self.presence_rx.try_recv() {
                Ok(event) => {
                    if Some(event.image_id()) == self.image_id {
                        self.roster.apply(&event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("dropped {n} presence events");
                }
                Err(_) => break,
            }
        }

        loop {
            match self.connection_rx.try_recv() {
                Ok(event) => match event {
                    ConnectionEvent::Established => {}
                    ConnectionEvent::Closed => self.notices.push(Notice::ConnectionLost),
                    ConnectionEvent::Unavailable => {
                        self.notices.push(Notice::ConnectionUnavailable)
                    }
                    ConnectionEvent::Failed => self.notices.push(Notice::ConnectionFailed),
                    ConnectionEvent::Error(detail) => {
                        self.notices.push(Notice::ConnectionError { detail })
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("dropped {n} connection events");
                }
                Err(_) => break,
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn scene(&self) -> &SceneEngine {
        &self.engine
    }

    pub fn scene_mut(&mut self) -> &mut SceneEngine {
        &mut self.engine
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn image_id(&self) -> Option<Uuid> {
        self.image_id
    }

    pub fn me(&self) -> &ParticipantInfo {
        self.channel.me()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.manager.state().await
    }

    /// Take all pending notices, oldest first.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain()
    }

    async fn emit(&mut self, kind: ChangeKind, annotation: &Annotation) {
        let Some(image) = self.image_id else {
            return;
        };
        if let Err(e) = self.channel.emit_annotation(image, kind, annotation).await {
            self.notices.push(Notice::SyncFailed {
                detail: e.to_string(),
            });
        }
    }
}
