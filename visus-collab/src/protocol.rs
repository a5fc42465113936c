//! Binary wire protocol for annotation synchronization.
//!
//! Every frame on the socket is one bincode-encoded [`WireMessage`]:
//!
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┐
//! │ kind     │ origin    │ image_id  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ variable │
//! └──────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! `origin` is the sending client's connection id and is echoed back
//! unchanged by the server; receivers drop frames whose origin matches
//! their own connection id (loop prevention). The payload encoding
//! varies by kind and is reached through the typed accessors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use visus_scene::{Annotation, ChangeKind, Point, RemoteChange};

/// Message kinds on the sync socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// A new annotation was committed
    AnnotationAdd = 1,
    /// An existing annotation was replaced
    AnnotationModify = 2,
    /// An annotation was removed
    AnnotationDelete = 3,
    /// Participant joined an image session
    PresenceJoin = 4,
    /// Participant left an image session
    PresenceLeave = 5,
    /// Lossy cursor-position broadcast
    Cursor = 6,
    /// Request an exclusive annotation lock
    LockAcquire = 7,
    /// Release a held annotation lock
    LockRelease = 8,
    /// Point-in-time lock status query
    LockQuery = 9,
    /// Server reply to LockAcquire/LockQuery
    LockReply = 10,
    /// Heartbeat ping
    Ping = 11,
    /// Heartbeat pong
    Pong = 12,
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA cursor/selection color, stable per user id.
    pub color: [f32; 4],
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit user id; the color derives from it.
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: color_for(user_id),
        }
    }
}

/// Stable, vivid RGBA color from a user id (hue from the id hash,
/// fixed saturation/lightness).
fn color_for(id: Uuid) -> [f32; 4] {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    [r, g, b, 1.0]
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Cursor position broadcast payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub user_id: Uuid,
    pub position: Point,
}

/// Lock acquire/release/query payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Correlates the server's [`LockReply`] with the awaiting caller.
    pub request_id: Uuid,
    pub annotation_id: Uuid,
}

/// Server reply to a lock acquire or query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockReply {
    pub request_id: Uuid,
    pub annotation_id: Uuid,
    /// Acquire: whether this caller now holds the lock. Query: false.
    pub granted: bool,
    /// Whether any participant holds the lock after this operation.
    pub locked: bool,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    /// Connection id of the sending client.
    pub origin: Uuid,
    pub image_id: Uuid,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Create an annotation add/modify/delete event.
    pub fn annotation(origin: Uuid, image_id: Uuid, kind: ChangeKind, annotation: &Annotation) -> Self {
        let msg_kind = match kind {
            ChangeKind::Add => MessageKind::AnnotationAdd,
            ChangeKind::Modify => MessageKind::AnnotationModify,
            ChangeKind::Delete => MessageKind::AnnotationDelete,
        };
        Self {
            kind: msg_kind,
            origin,
            image_id,
            payload: encode_payload(annotation),
        }
    }

    pub fn presence_join(origin: Uuid, image_id: Uuid, info: &ParticipantInfo) -> Self {
        Self {
            kind: MessageKind::PresenceJoin,
            origin,
            image_id,
            payload: encode_payload(info),
        }
    }

    pub fn presence_leave(origin: Uuid, image_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::PresenceLeave,
            origin,
            image_id,
            payload: encode_payload(&user_id),
        }
    }

    pub fn cursor(origin: Uuid, image_id: Uuid, update: &CursorUpdate) -> Self {
        Self {
            kind: MessageKind::Cursor,
            origin,
            image_id,
            payload: encode_payload(update),
        }
    }

    pub fn lock_acquire(origin: Uuid, image_id: Uuid, request: &LockRequest) -> Self {
        Self {
            kind: MessageKind::LockAcquire,
            origin,
            image_id,
            payload: encode_payload(request),
        }
    }

    pub fn lock_release(origin: Uuid, image_id: Uuid, request: &LockRequest) -> Self {
        Self {
            kind: MessageKind::LockRelease,
            origin,
            image_id,
            payload: encode_payload(request),
        }
    }

    pub fn lock_query(origin: Uuid, image_id: Uuid, request: &LockRequest) -> Self {
        Self {
            kind: MessageKind::LockQuery,
            origin,
            image_id,
            payload: encode_payload(request),
        }
    }

    pub fn lock_reply(origin: Uuid, image_id: Uuid, reply: &LockReply) -> Self {
        Self {
            kind: MessageKind::LockReply,
            origin,
            image_id,
            payload: encode_payload(reply),
        }
    }

    pub fn ping(origin: Uuid) -> Self {
        Self {
            kind: MessageKind::Ping,
            origin,
            image_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    pub fn pong(origin: Uuid) -> Self {
        Self {
            kind: MessageKind::Pong,
            origin,
            image_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an annotation event into a scene-ready change.
    pub fn change(&self) -> Result<RemoteChange, ProtocolError> {
        let kind = match self.kind {
            MessageKind::AnnotationAdd => ChangeKind::Add,
            MessageKind::AnnotationModify => ChangeKind::Modify,
            MessageKind::AnnotationDelete => ChangeKind::Delete,
            _ => return Err(ProtocolError::UnexpectedKind),
        };
        Ok(RemoteChange {
            kind,
            annotation: decode_payload(&self.payload)?,
        })
    }

    /// Parse a presence-join payload.
    pub fn participant(&self) -> Result<ParticipantInfo, ProtocolError> {
        self.expect(MessageKind::PresenceJoin)?;
        decode_payload(&self.payload)
    }

    /// Parse a presence-leave payload.
    pub fn leaving_user(&self) -> Result<Uuid, ProtocolError> {
        self.expect(MessageKind::PresenceLeave)?;
        decode_payload(&self.payload)
    }

    /// Parse a cursor payload.
    pub fn cursor_update(&self) -> Result<CursorUpdate, ProtocolError> {
        self.expect(MessageKind::Cursor)?;
        decode_payload(&self.payload)
    }

    /// Parse a lock acquire/release/query payload.
    pub fn lock_request(&self) -> Result<LockRequest, ProtocolError> {
        match self.kind {
            MessageKind::LockAcquire | MessageKind::LockRelease | MessageKind::LockQuery => {
                decode_payload(&self.payload)
            }
            _ => Err(ProtocolError::UnexpectedKind),
        }
    }

    /// Parse a lock reply payload.
    pub fn lock_outcome(&self) -> Result<LockReply, ProtocolError> {
        self.expect(MessageKind::LockReply)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::UnexpectedKind);
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    UnexpectedKind,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::UnexpectedKind => write!(f, "Unexpected message kind"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use visus_scene::{AnnotationShape, Point};

    fn sample_annotation() -> Annotation {
        Annotation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            42,
            AnnotationShape::Measurement {
                start: Point::new(10.0, 10.0),
                end: Point::new(10.0, 110.0),
                distance: 100.0,
            },
        )
    }

    #[test]
    fn test_annotation_event_roundtrip() {
        let origin = Uuid::new_v4();
        let a = sample_annotation();

        let msg = WireMessage::annotation(origin, a.image_id, ChangeKind::Add, &a);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::AnnotationAdd);
        assert_eq!(decoded.origin, origin);
        assert_eq!(decoded.image_id, a.image_id);
        let change = decoded.change().unwrap();
        assert_eq!(change.kind, ChangeKind::Add);
        assert_eq!(change.annotation, a);
    }

    #[test]
    fn test_change_kind_mapping() {
        let a = sample_annotation();
        let modify = WireMessage::annotation(Uuid::new_v4(), a.image_id, ChangeKind::Modify, &a);
        assert_eq!(modify.kind, MessageKind::AnnotationModify);
        assert_eq!(modify.change().unwrap().kind, ChangeKind::Modify);

        let delete = WireMessage::annotation(Uuid::new_v4(), a.image_id, ChangeKind::Delete, &a);
        assert_eq!(delete.kind, MessageKind::AnnotationDelete);
        assert_eq!(delete.change().unwrap().kind, ChangeKind::Delete);
    }

    #[test]
    fn test_presence_roundtrip() {
        let info = ParticipantInfo::new("Dr. Osei");
        let image = Uuid::new_v4();

        let join = WireMessage::presence_join(Uuid::new_v4(), image, &info);
        let decoded = WireMessage::decode(&join.encode().unwrap()).unwrap();
        assert_eq!(decoded.participant().unwrap(), info);

        let leave = WireMessage::presence_leave(Uuid::new_v4(), image, info.user_id);
        let decoded = WireMessage::decode(&leave.encode().unwrap()).unwrap();
        assert_eq!(decoded.leaving_user().unwrap(), info.user_id);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let update = CursorUpdate {
            user_id: Uuid::new_v4(),
            position: Point::new(88.0, 12.5),
        };
        let msg = WireMessage::cursor(Uuid::new_v4(), Uuid::new_v4(), &update);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.cursor_update().unwrap(), update);
    }

    #[test]
    fn test_lock_roundtrip() {
        let request = LockRequest {
            request_id: Uuid::new_v4(),
            annotation_id: Uuid::new_v4(),
        };
        let msg = WireMessage::lock_acquire(Uuid::new_v4(), Uuid::new_v4(), &request);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.lock_request().unwrap(), request);

        let reply = LockReply {
            request_id: request.request_id,
            annotation_id: request.annotation_id,
            granted: true,
            locked: true,
        };
        let msg = WireMessage::lock_reply(Uuid::nil(), Uuid::new_v4(), &reply);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.lock_outcome().unwrap(), reply);
    }

    #[test]
    fn test_wrong_kind_accessor_errors() {
        let msg = WireMessage::ping(Uuid::new_v4());
        assert!(msg.change().is_err());
        assert!(msg.participant().is_err());
        assert!(msg.cursor_update().is_err());
        assert!(msg.lock_request().is_err());
        assert!(msg.lock_outcome().is_err());
    }

    #[test]
    fn test_decode_garbage_errors() {
        assert!(WireMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_stable_participant_color() {
        let id = Uuid::new_v4();
        let a = ParticipantInfo::with_id(id, "A");
        let b = ParticipantInfo::with_id(id, "B");
        assert_eq!(a.color, b.color);
        for c in a.color {
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn test_ping_pong() {
        let origin = Uuid::new_v4();
        let ping = WireMessage::decode(&WireMessage::ping(origin).encode().unwrap()).unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);
        assert_eq!(ping.image_id, Uuid::nil());
        let pong = WireMessage::decode(&WireMessage::pong(origin).encode().unwrap()).unwrap();
        assert_eq!(pong.kind, MessageKind::Pong);
    }
}
