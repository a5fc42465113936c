//! # visus-scene — Annotation scene model for Visus
//!
//! The local annotation layer of the medical-image collaboration viewer:
//! a typed annotation model, viewport fit/pan/zoom math, a linear
//! snapshot history, and the [`SceneEngine`] that ties them together.
//!
//! The crate is deliberately free of any rendering backend; everything a
//! backend needs crosses a plain serde boundary.
//!
//! ## Modules
//!
//! - [`geometry`] — points, rectangles, segment distance
//! - [`annotation`] — the tagged-union annotation model
//! - [`view`] — base image fitting and viewport transforms
//! - [`history`] — whole-scene snapshot undo/redo
//! - [`engine`] — tool dispatch, commits, selection, remote application

pub mod annotation;
pub mod engine;
pub mod geometry;
pub mod history;
pub mod view;

pub use annotation::{Annotation, AnnotationKind, AnnotationShape, ChangeKind, RemoteChange, Stroke};
pub use engine::{SceneEngine, Tool};
pub use geometry::{Point, Rect};
pub use history::{Snapshot, SnapshotHistory};
pub use view::{BaseImage, RenderError, ViewTransform, Viewport};
