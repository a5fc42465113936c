//! Linear undo/redo history of whole-scene snapshots.
//!
//! Each snapshot is a full JSON serialization of every annotation in the
//! scene at one instant. Snapshots form a linear sequence addressed by an
//! integer index; the current index always points at the snapshot that
//! matches the rendered state. Pushing after an undo truncates the redo
//! tail — there is no branching.
//!
//! Whole-scene serialization is deliberate: for the bounded object counts
//! of an annotation overlay it is the simplest representation that keeps
//! the undo/redo round-trip exact. Retention is unbounded; an embedder
//! with very large sessions can cap it at the push site.

use crate::annotation::Annotation;

/// One serialized capture of the full annotation scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot(String);

impl Snapshot {
    /// Serialize the current annotation set.
    pub fn capture(annotations: &[Annotation]) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_string(annotations)?))
    }

    /// Restore the annotation set this snapshot captured.
    pub fn restore(&self) -> Result<Vec<Annotation>, serde_json::Error> {
        serde_json::from_str(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Linear snapshot sequence with a movable cursor.
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    snapshots: Vec<Snapshot>,
    current: usize,
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a snapshot after a committed mutation.
    ///
    /// Discards any redo tail beyond the current index first, so the
    /// sequence stays linear.
    pub fn push(&mut self, snapshot: Snapshot) {
        if !self.snapshots.is_empty() {
            self.snapshots.truncate(self.current + 1);
        }
        self.snapshots.push(snapshot);
        self.current = self.snapshots.len() - 1;
    }

    /// Step back one snapshot. Returns the snapshot to re-render from,
    /// or `None` at the start boundary.
    pub fn undo(&mut self) -> Option<&Snapshot> {
        if self.current == 0 {
            return None;
        }
        self.current -= 1;
        self.snapshots.get(self.current)
    }

    /// Step forward one snapshot. Returns the snapshot to re-render
    /// from, or `None` at the end boundary.
    pub fn redo(&mut self) -> Option<&Snapshot> {
        if self.current + 1 >= self.snapshots.len() {
            return None;
        }
        self.current += 1;
        self.snapshots.get(self.current)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.current = 0;
    }
}
