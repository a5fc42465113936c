//! Presence: who is viewing an image session, and where their cursors
//! are.
//!
//! Presence is advisory UI state, not document state: cursor broadcasts
//! are lossy and unordered, and nothing about annotation ownership is
//! implied by being present.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use visus_scene::Point;

use crate::protocol::ParticipantInfo;

/// A typed presence event routed off the sync channel.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    Joined {
        image_id: Uuid,
        participant: ParticipantInfo,
    },
    Left {
        image_id: Uuid,
        user_id: Uuid,
    },
    Cursor {
        image_id: Uuid,
        user_id: Uuid,
        position: Point,
    },
}

impl PresenceEvent {
    pub fn image_id(&self) -> Uuid {
        match self {
            PresenceEvent::Joined { image_id, .. }
            | PresenceEvent::Left { image_id, .. }
            | PresenceEvent::Cursor { image_id, .. } => *image_id,
        }
    }
}

/// Rate limiter for outgoing cursor broadcasts.
///
/// Cursor moves arrive per pointer event; broadcasting each one floods
/// the room for no visual gain. ~30 updates/s is indistinguishable on
/// the receiving side.
#[derive(Debug)]
pub struct CursorThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Whether a cursor update may be broadcast now. Advances the
    /// window when it returns true.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(33))
    }
}

/// One remote participant tracked locally.
#[derive(Debug, Clone)]
pub struct Participant {
    pub info: ParticipantInfo,
    pub cursor: Option<Point>,
}

/// The set of remote participants in one image session.
///
/// Fed from [`PresenceEvent`]s by the owner; the roster itself does not
/// filter by image — callers route events for their image into it.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    participants: HashMap<Uuid, Participant>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Joined { participant, .. } => {
                self.participants.insert(
                    participant.user_id,
                    Participant {
                        info: participant.clone(),
                        cursor: None,
                    },
                );
            }
            PresenceEvent::Left { user_id, .. } => {
                self.participants.remove(user_id);
            }
            PresenceEvent::Cursor {
                user_id, position, ..
            } => {
                // Cursor for a participant we never saw join: drop it.
                if let Some(participant) = self.participants.get_mut(user_id) {
                    participant.cursor = Some(*position);
                }
            }
        }
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.participants.contains_key(&user_id)
    }

    pub fn cursor_of(&self, user_id: Uuid) -> Option<Point> {
        self.participants.get(&user_id).and_then(|p| p.cursor)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(image_id: Uuid, info: &ParticipantInfo) -> PresenceEvent {
        PresenceEvent::Joined {
            image_id,
            participant: info.clone(),
        }
    }

    #[test]
    fn test_roster_join_leave() {
        let image = Uuid::new_v4();
        let alice = ParticipantInfo::new("Alice");
        let mut roster = PresenceRoster::new();

        roster.apply(&joined(image, &alice));
        assert!(roster.contains(alice.user_id));
        assert_eq!(roster.len(), 1);

        roster.apply(&PresenceEvent::Left {
            image_id: image,
            user_id: alice.user_id,
        });
        assert!(roster.is_empty());
    }

    #[test]
    fn test_roster_cursor_tracking() {
        let image = Uuid::new_v4();
        let alice = ParticipantInfo::new("Alice");
        let mut roster = PresenceRoster::new();
        roster.apply(&joined(image, &alice));

        roster.apply(&PresenceEvent::Cursor {
            image_id: image,
            user_id: alice.user_id,
            position: Point::new(40.0, 60.0),
        });
        assert_eq!(roster.cursor_of(alice.user_id), Some(Point::new(40.0, 60.0)));
    }

    #[test]
    fn test_cursor_for_unknown_user_dropped() {
        let mut roster = PresenceRoster::new();
        roster.apply(&PresenceEvent::Cursor {
            image_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            position: Point::new(1.0, 1.0),
        });
        assert!(roster.is_empty());
    }

    #[test]
    fn test_rejoin_resets_cursor() {
        let image = Uuid::new_v4();
        let alice = ParticipantInfo::new("Alice");
        let mut roster = PresenceRoster::new();
        roster.apply(&joined(image, &alice));
        roster.apply(&PresenceEvent::Cursor {
            image_id: image,
            user_id: alice.user_id,
            position: Point::new(1.0, 1.0),
        });

        roster.apply(&joined(image, &alice));
        assert_eq!(roster.cursor_of(alice.user_id), None);
    }

    #[test]
    fn test_throttle_blocks_rapid_updates() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        assert!(throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn test_throttle_allows_after_interval() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(0));
        assert!(throttle.allow());
        assert!(throttle.allow());
    }
}
