//! User-visible notices.
//!
//! Network, lock, and persistence failures never throw into the caller;
//! they land here as dismissible notices the surrounding chrome renders
//! with a retry affordance where one applies. The queue is bounded —
//! when it overflows, the oldest notice is dropped.

use std::collections::VecDeque;

use uuid::Uuid;

/// A dismissible, user-facing notice.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// No collaboration endpoint is reachable.
    ConnectionUnavailable,
    /// The live connection dropped; automatic reconnection is running.
    ConnectionLost,
    /// Reconnection gave up; an explicit reconnect is required.
    ConnectionFailed,
    /// Connection-layer error (auth, transport).
    ConnectionError { detail: String },
    /// Another participant holds the lock on this annotation.
    LockHeld { annotation_id: Uuid },
    /// The lock service could not answer.
    LockFailed { detail: String },
    /// An emitted change did not reach the server.
    SyncFailed { detail: String },
    /// Saving annotations failed; retry with `save()`.
    SaveFailed { detail: String },
    /// Loading annotations failed; retry by joining again.
    LoadFailed { detail: String },
}

impl Notice {
    /// Whether the UI should offer a retry action for this notice.
    pub fn retryable(&self) -> bool {
        !matches!(self, Notice::LockHeld { .. } | Notice::ConnectionLost)
    }
}

/// Bounded FIFO of pending notices.
#[derive(Debug)]
pub struct NoticeQueue {
    queue: VecDeque<Notice>,
    capacity: usize,
}

impl NoticeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, notice: Notice) {
        if self.queue.len() >= self.capacity {
            let dropped = self.queue.pop_front();
            log::warn!("notice queue full, dropped {dropped:?}");
        }
        self.queue.push_back(notice);
    }

    /// Take every pending notice, oldest first.
    pub fn drain(&mut self) -> Vec<Notice> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for NoticeQueue {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain_in_order() {
        let mut queue = NoticeQueue::new(8);
        queue.push(Notice::ConnectionLost);
        queue.push(Notice::ConnectionFailed);

        let drained = queue.drain();
        assert_eq!(drained, vec![Notice::ConnectionLost, Notice::ConnectionFailed]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = NoticeQueue::new(2);
        queue.push(Notice::ConnectionLost);
        queue.push(Notice::ConnectionFailed);
        queue.push(Notice::ConnectionUnavailable);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![Notice::ConnectionFailed, Notice::ConnectionUnavailable]
        );
    }

    #[test]
    fn test_retry_affordances() {
        assert!(Notice::SaveFailed { detail: "io".into() }.retryable());
        assert!(Notice::ConnectionFailed.retryable());
        assert!(!Notice::LockHeld {
            annotation_id: Uuid::new_v4()
        }
        .retryable());
        assert!(!Notice::ConnectionLost.retryable());
    }
}
