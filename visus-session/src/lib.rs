//! # visus-session — Collaboration facade for Visus
//!
//! Ties the annotation scene engine, the synchronization channel, the
//! lock service, and the persistence collaborator into the session
//! lifecycle the viewer chrome consumes: connect, join an image,
//! annotate, undo/redo, save, leave. Network, lock, and persistence
//! failures surface as dismissible [`Notice`]s rather than errors
//! thrown into the rendering loop.

pub mod notice;
pub mod session;

pub use notice::{Notice, NoticeQueue};
pub use session::{CollabSession, SessionError};
