//! Annotation data model.
//!
//! An [`Annotation`] is a typed graphical object anchored to image
//! coordinates: a point marker, a two-point measurement, a text note, or
//! a freehand drawing. The shape payload is a tagged union so that scene
//! logic and the wire protocol share one explicit model, decoupled from
//! any rendering backend.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Point;

/// Stroke styling for freehand drawings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    /// RGBA color, each channel in [0, 1].
    pub color: [f32; 4],
    /// Stroke width in image pixels.
    pub width: f32,
}

impl Default for Stroke {
    fn default() -> Self {
        Self {
            color: [0.96, 0.26, 0.21, 1.0],
            width: 2.0,
        }
    }
}

/// Kind discriminant for an annotation shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationKind {
    Marker,
    Measurement,
    Note,
    Drawing,
}

/// The kind-specific payload of an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnnotationShape {
    /// A single point of interest.
    Marker { at: Point },
    /// A two-point distance measurement. `distance` is computed in
    /// image-pixel units at creation time and never recomputed.
    Measurement {
        start: Point,
        end: Point,
        distance: f32,
    },
    /// A positioned text note.
    Note { at: Point, text: String },
    /// An ordered freehand path with stroke styling.
    Drawing { points: Vec<Point>, stroke: Stroke },
}

impl AnnotationShape {
    pub fn kind(&self) -> AnnotationKind {
        match self {
            AnnotationShape::Marker { .. } => AnnotationKind::Marker,
            AnnotationShape::Measurement { .. } => AnnotationKind::Measurement,
            AnnotationShape::Note { .. } => AnnotationKind::Note,
            AnnotationShape::Drawing { .. } => AnnotationKind::Drawing,
        }
    }

    /// Hit-test the shape against a point, with a tolerance in image
    /// pixels.
    pub fn hit(&self, point: &Point, tolerance: f32) -> bool {
        match self {
            AnnotationShape::Marker { at } | AnnotationShape::Note { at, .. } => {
                at.distance_to(point) <= tolerance
            }
            AnnotationShape::Measurement { start, end, .. } => {
                point.distance_to_segment(start, end) <= tolerance
            }
            AnnotationShape::Drawing { points, .. } => match points.len() {
                0 => false,
                1 => points[0].distance_to(point) <= tolerance,
                _ => points
                    .windows(2)
                    .any(|w| point.distance_to_segment(&w[0], &w[1]) <= tolerance),
            },
        }
    }
}

/// A single annotation on an image.
///
/// `id` is client-generated at creation time, immutable, and unique
/// within an image session for the lifetime of the annotation; a deleted
/// annotation's id is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub image_id: Uuid,
    pub author_id: Uuid,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub shape: AnnotationShape,
}

impl Annotation {
    /// Mint a new annotation with a fresh id.
    pub fn new(image_id: Uuid, author_id: Uuid, created_at_ms: u64, shape: AnnotationShape) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_id,
            author_id,
            created_at_ms,
            shape,
        }
    }

    pub fn kind(&self) -> AnnotationKind {
        self.shape.kind()
    }
}

/// What a remote peer did to an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// A remote annotation change, ready to be applied to a local scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub annotation: Annotation,
}
