//! The annotation scene engine.
//!
//! `SceneEngine` is the local, authoritative-for-this-client model of all
//! annotations overlaid on one image. It owns tool-driven creation,
//! selection, linear undo/redo via whole-scene snapshots, and the
//! application of remote events received from other participants.
//!
//! Commit discipline: every locally committed mutation (tool commit,
//! delete-selected) pushes exactly one snapshot and hands the affected
//! annotations back to the caller for network emission. Remote events
//! mutate the scene directly — no snapshot, no re-emission — so remote
//! changes never enter the local undo timeline.
//!
//! Per-tool capture lifecycle: `Idle → Capturing → Committed | Cancelled
//! → Idle`. Marker commits in a single pointer event; Measure and Draw
//! pass through `Capturing` across several; Text holds `Capturing` until
//! the scoped text entry is confirmed or cancelled. Switching tools
//! cancels any capture in progress without committing or emitting.

use std::collections::HashSet;

use uuid::Uuid;

use crate::annotation::{Annotation, AnnotationShape, ChangeKind, RemoteChange, Stroke};
use crate::geometry::Point;
use crate::history::{Snapshot, SnapshotHistory};
use crate::view::{BaseImage, RenderError, ViewTransform, Viewport};

/// Hit-test tolerance for selection, in image pixels.
const HIT_TOLERANCE: f32 = 8.0;

/// The active tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tool {
    /// No creation tool; pointer-down selects.
    #[default]
    None,
    /// Pointer-driven pan/zoom instead of object creation.
    Pan,
    Marker,
    Measure,
    Draw,
    Text,
}

/// In-progress capture state for the active tool.
#[derive(Debug, Clone, PartialEq)]
enum Capture {
    Idle,
    /// Measure: first point placed, waiting for the second.
    MeasureFrom(Point),
    /// Draw: accumulating freehand path points until pointer-up.
    DrawPath(Vec<Point>),
    /// Text: position chosen, waiting for the text entry to resolve.
    TextAt(Point),
    /// Pan: last pointer position in screen coordinates.
    Panning(Point),
}

/// The local annotation scene for one image.
pub struct SceneEngine {
    author_id: Uuid,
    base: Option<BaseImage>,
    view: Option<ViewTransform>,
    annotations: Vec<Annotation>,
    selection: HashSet<Uuid>,
    tool: Tool,
    capture: Capture,
    history: SnapshotHistory,
    stroke: Stroke,
    disposed: bool,
}

impl SceneEngine {
    pub fn new(author_id: Uuid) -> Self {
        Self {
            author_id,
            base: None,
            view: None,
            annotations: Vec::new(),
            selection: HashSet::new(),
            tool: Tool::None,
            capture: Capture::Idle,
            history: SnapshotHistory::new(),
            stroke: Stroke::default(),
            disposed: false,
        }
    }

    /// Load the background image and fit it to the viewport.
    ///
    /// Fails when the image dimensions are unusable or the viewport has
    /// no area; callers retry only after fixing the precondition. A
    /// successful initialize resets the scene and seeds the history with
    /// a snapshot of the empty scene.
    pub fn initialize(&mut self, base: BaseImage, viewport: Viewport) -> Result<(), RenderError> {
        let view = ViewTransform::fit(&base, viewport)?;
        self.base = Some(base);
        self.view = Some(view);
        self.annotations.clear();
        self.selection.clear();
        self.capture = Capture::Idle;
        self.history.clear();
        self.push_snapshot();
        self.disposed = false;
        log::debug!("scene initialized for image {}", base.id);
        Ok(())
    }

    /// Switch the active tool.
    ///
    /// Discards any in-progress capture without committing or emitting;
    /// existing objects are unaffected.
    pub fn set_active_tool(&mut self, tool: Tool) {
        if self.capture != Capture::Idle {
            log::debug!("tool switch cancelled in-progress {:?} capture", self.tool);
        }
        self.capture = Capture::Idle;
        self.tool = tool;
    }

    pub fn active_tool(&self) -> Tool {
        self.tool
    }

    /// Handle pointer-down on the canvas.
    ///
    /// Returns the committed annotation when the event completes a
    /// creation (Marker immediately, Measure on its second point), for
    /// the caller to emit on the network.
    pub fn pointer_down(&mut self, screen: Point) -> Option<Annotation> {
        let view = self.view?;
        let at = view.screen_to_image(screen);

        match self.tool {
            Tool::None => {
                self.select_at(screen);
                None
            }
            Tool::Pan => {
                self.capture = Capture::Panning(screen);
                None
            }
            Tool::Marker => self.commit(AnnotationShape::Marker { at }),
            Tool::Measure => match self.capture {
                Capture::MeasureFrom(start) => {
                    self.capture = Capture::Idle;
                    let distance = start.distance_to(&at);
                    self.commit(AnnotationShape::Measurement {
                        start,
                        end: at,
                        distance,
                    })
                }
                _ => {
                    self.capture = Capture::MeasureFrom(at);
                    None
                }
            },
            Tool::Draw => {
                self.capture = Capture::DrawPath(vec![at]);
                None
            }
            Tool::Text => {
                self.capture = Capture::TextAt(at);
                None
            }
        }
    }

    /// Handle pointer movement.
    pub fn pointer_move(&mut self, screen: Point) {
        match &mut self.capture {
            Capture::DrawPath(points) => {
                if let Some(view) = self.view {
                    points.push(view.screen_to_image(screen));
                }
            }
            Capture::Panning(last) => {
                let (dx, dy) = (screen.x - last.x, screen.y - last.y);
                *last = screen;
                if let Some(view) = self.view.as_mut() {
                    view.pan(dx, dy);
                }
            }
            _ => {}
        }
    }

    /// Handle pointer-up. Commits an in-progress drawing as one object.
    pub fn pointer_up(&mut self, screen: Point) -> Option<Annotation> {
        match std::mem::replace(&mut self.capture, Capture::Idle) {
            Capture::DrawPath(mut points) => {
                if let Some(view) = self.view {
                    points.push(view.screen_to_image(screen));
                }
                let stroke = self.stroke;
                self.commit(AnnotationShape::Drawing { points, stroke })
            }
            Capture::Panning(_) => None,
            other => {
                // Measure/Text captures span pointer events; keep them.
                self.capture = other;
                None
            }
        }
    }

    /// Whether a text entry is pending confirmation.
    pub fn text_pending(&self) -> bool {
        matches!(self.capture, Capture::TextAt(_))
    }

    /// Confirm the pending text entry. Empty text discards the capture.
    pub fn commit_text(&mut self, text: &str) -> Option<Annotation> {
        match std::mem::replace(&mut self.capture, Capture::Idle) {
            Capture::TextAt(at) if !text.trim().is_empty() => self.commit(AnnotationShape::Note {
                at,
                text: text.to_owned(),
            }),
            Capture::TextAt(_) => None,
            other => {
                self.capture = other;
                None
            }
        }
    }

    /// Cancel the pending text entry without committing.
    pub fn cancel_text(&mut self) {
        if matches!(self.capture, Capture::TextAt(_)) {
            self.capture = Capture::Idle;
        }
    }

    /// Zoom toward a screen point (Pan tool scroll gesture).
    pub fn zoom_at(&mut self, screen: Point, factor: f32) {
        if let Some(view) = self.view.as_mut() {
            view.zoom_at(screen, factor);
        }
    }

    /// Step the scene back one snapshot. No-op at the start boundary.
    /// Local-only; never broadcast.
    pub fn undo(&mut self) -> bool {
        let Some(snapshot) = self.history.undo() else {
            return false;
        };
        match snapshot.restore() {
            Ok(annotations) => {
                self.annotations = annotations;
                self.retain_valid_selection();
                true
            }
            Err(e) => {
                log::error!("undo snapshot failed to restore: {e}");
                false
            }
        }
    }

    /// Step the scene forward one snapshot. No-op at the end boundary.
    pub fn redo(&mut self) -> bool {
        let Some(snapshot) = self.history.redo() else {
            return false;
        };
        match snapshot.restore() {
            Ok(annotations) => {
                self.annotations = annotations;
                self.retain_valid_selection();
                true
            }
            Err(e) => {
                log::error!("redo snapshot failed to restore: {e}");
                false
            }
        }
    }

    /// Remove all currently selected annotations.
    ///
    /// Pushes one snapshot for the whole removal and returns the removed
    /// ids for network emission. No-op when nothing is selected.
    pub fn delete_selected(&mut self) -> Vec<Uuid> {
        if self.selection.is_empty() {
            return Vec::new();
        }
        let selected = std::mem::take(&mut self.selection);
        let before = self.annotations.len();
        self.annotations.retain(|a| !selected.contains(&a.id));
        let removed: Vec<Uuid> = selected.into_iter().collect();
        if self.annotations.len() != before {
            self.push_snapshot();
        }
        removed
    }

    /// Select the topmost annotation under a screen point, if any.
    ///
    /// Replaces the current selection. Returns the hit id.
    pub fn select_at(&mut self, screen: Point) -> Option<Uuid> {
        let view = self.view?;
        let at = view.screen_to_image(screen);
        let tolerance = HIT_TOLERANCE;
        let hit = self
            .annotations
            .iter()
            .rev()
            .find(|a| a.shape.hit(&at, tolerance))
            .map(|a| a.id);
        self.selection.clear();
        if let Some(id) = hit {
            self.selection.insert(id);
        }
        hit
    }

    /// Add an annotation to the selection set.
    pub fn extend_selection(&mut self, id: Uuid) {
        if self.annotations.iter().any(|a| a.id == id) {
            self.selection.insert(id);
        }
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn selection(&self) -> &HashSet<Uuid> {
        &self.selection
    }

    /// Replace the shape of an existing annotation.
    ///
    /// A local committed mutation: pushes a snapshot and returns the
    /// updated annotation for network emission. Callers gate this on a
    /// successful lock acquire — the engine itself does not know about
    /// locks. Returns `None` when the id is not in the scene.
    pub fn modify(&mut self, id: Uuid, shape: AnnotationShape) -> Option<Annotation> {
        let annotation = self.annotations.iter_mut().find(|a| a.id == id)?;
        annotation.shape = shape;
        let updated = annotation.clone();
        self.push_snapshot();
        Some(updated)
    }

    /// Apply an annotation change from a remote participant.
    ///
    /// Never pushes a snapshot and never re-emits. Add is idempotent on
    /// a duplicate id; Modify and Delete silently ignore a missing id —
    /// the target may have been deleted locally in the interim, which is
    /// an expected race, not an error.
    pub fn apply_remote(&mut self, change: &RemoteChange) {
        match change.kind {
            ChangeKind::Add => {
                if !self.annotations.iter().any(|a| a.id == change.annotation.id) {
                    self.annotations.push(change.annotation.clone());
                }
            }
            ChangeKind::Modify => {
                if let Some(existing) = self
                    .annotations
                    .iter_mut()
                    .find(|a| a.id == change.annotation.id)
                {
                    *existing = change.annotation.clone();
                }
            }
            ChangeKind::Delete => {
                let id = change.annotation.id;
                self.annotations.retain(|a| a.id != id);
                self.selection.remove(&id);
            }
        }
    }

    /// Replace the scene contents with a persisted annotation set.
    ///
    /// Used when joining a session: the loaded set becomes the new undo
    /// baseline, so loaded annotations are not locally undoable.
    pub fn hydrate(&mut self, annotations: Vec<Annotation>) {
        self.annotations = annotations;
        self.selection.clear();
        self.history.clear();
        self.push_snapshot();
    }

    /// Release scene resources. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.annotations.clear();
        self.selection.clear();
        self.history.clear();
        self.capture = Capture::Idle;
        self.base = None;
        self.view = None;
        self.disposed = true;
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn annotation(&self, id: Uuid) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.id == id)
    }

    pub fn view(&self) -> Option<&ViewTransform> {
        self.view.as_ref()
    }

    pub fn base_image(&self) -> Option<&BaseImage> {
        self.base.as_ref()
    }

    /// Number of snapshots in the history (initial + one per commit).
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn commit(&mut self, shape: AnnotationShape) -> Option<Annotation> {
        let image_id = self.base?.id;
        let annotation = Annotation::new(image_id, self.author_id, now_ms(), shape);
        self.annotations.push(annotation.clone());
        self.push_snapshot();
        Some(annotation)
    }

    fn push_snapshot(&mut self) {
        match Snapshot::capture(&self.annotations) {
            Ok(snapshot) => self.history.push(snapshot),
            Err(e) => log::error!("scene snapshot failed: {e}"),
        }
    }

    fn retain_valid_selection(&mut self) {
        let ids: HashSet<Uuid> = self.annotations.iter().map(|a| a.id).collect();
        self.selection.retain(|id| ids.contains(id));
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
