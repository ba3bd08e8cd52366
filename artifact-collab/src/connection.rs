//! Per-connection handle and bounded outbound queue.
//!
//! The outbox is the backpressure point. When it is full:
//! 1. the oldest droppable frame (presence delta) is evicted,
//! 2. a new droppable frame is discarded if nothing droppable is queued,
//! 3. a critical frame that still does not fit closes the connection with
//!    [`CloseReason::SlowConsumer`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::collaborators::UserIdentity;
use crate::protocol::{CloseReason, DeliveryClass, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What [`Outbox::push`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting an older droppable frame.
    QueuedEvicting,
    /// The new (droppable) frame was discarded.
    Dropped,
    /// The connection is closing; nothing was queued.
    Closed,
}

/// Next item for the writer task.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Frame(Frame),
    Close(CloseReason),
}

pub struct Outbox {
    queue: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
    closed: watch::Sender<Option<CloseReason>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        if self.close_reason().is_some() {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(frame);
                PushOutcome::Queued
            } else if let Some(pos) = queue
                .iter()
                .position(|f| f.class == DeliveryClass::Droppable)
            {
                queue.remove(pos);
                queue.push_back(frame);
                PushOutcome::QueuedEvicting
            } else if frame.class == DeliveryClass::Droppable {
                PushOutcome::Dropped
            } else {
                PushOutcome::Closed
            }
        };

        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::QueuedEvicting | PushOutcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {
                log::warn!("Outbound queue full of critical frames, closing slow consumer");
                self.close(CloseReason::SlowConsumer);
                return outcome;
            }
        }
        self.notify.notify_one();
        outcome
    }

    /// Request a close. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let changed = self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if changed {
            self.notify.notify_one();
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    /// Resolves once a close has been requested.
    pub fn subscribe_close(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed.subscribe()
    }

    /// Wait for the next frame.
    ///
    /// Frames queued before a close are still flushed, except for a slow
    /// consumer whose queue is abandoned.
    pub async fn next(&self) -> Outgoing {
        loop {
            let notified = self.notify.notified();
            let reason = self.close_reason();
            if reason != Some(CloseReason::SlowConsumer) {
                if let Some(frame) = self.queue.lock().pop_front() {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    return Outgoing::Frame(frame);
                }
            }
            if let Some(reason) = reason {
                return Outgoing::Close(reason);
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next) used by tests and
    /// in-process consumers.
    pub fn try_next(&self) -> Option<Frame> {
        let frame = self.queue.lock().pop_front();
        if frame.is_some() {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One live socket. Owned by the gateway, referenced by its room.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: UserIdentity,
    pub artifact_id: String,
    pub outbox: Arc<Outbox>,
    protocol_errors: AtomicU32,
}

impl ConnectionHandle {
    pub fn new(identity: UserIdentity, artifact_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            artifact_id: artifact_id.into(),
            outbox: Arc::new(Outbox::new(capacity)),
            protocol_errors: AtomicU32::new(0),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn send(&self, frame: Frame) -> PushOutcome {
        self.outbox.push(frame)
    }

    /// Count one protocol error; returns the running total.
    pub fn record_protocol_error(&self) -> u32 {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn close(&self, reason: CloseReason) {
        self.outbox.close(reason);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("artifact_id", &self.artifact_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kinds, Envelope};
    use serde_json::json;

    fn frame(kind: &str, n: u64) -> Frame {
        Envelope::system(kind, json!({ "n": n })).into_frame()
    }

    fn n_of(frame: &Frame) -> u64 {
        let value: serde_json::Value = serde_json::from_str(&frame.text).unwrap();
        value["data"]["n"].as_u64().unwrap()
    }

    #[test]
    fn test_push_within_capacity() {
        let outbox = Outbox::new(4);
        assert_eq!(outbox.push(frame(kinds::CURSOR_MOVE, 1)), PushOutcome::Queued);
        assert_eq!(outbox.push(frame(kinds::COMMENT_ADDED, 2)), PushOutcome::Queued);
        assert_eq!(outbox.len(), 2);
        assert_eq!(n_of(&outbox.try_next().unwrap()), 1);
        assert_eq!(outbox.sent(), 1);
    }

    #[test]
    fn test_overflow_evicts_oldest_droppable() {
        let outbox = Outbox::new(3);
        outbox.push(frame(kinds::COMMENT_ADDED, 1));
        outbox.push(frame(kinds::CURSOR_MOVE, 2));
        outbox.push(frame(kinds::CURSOR_MOVE, 3));

        assert_eq!(
            outbox.push(frame(kinds::COMMENT_UPDATED, 4)),
            PushOutcome::QueuedEvicting
        );
        let order: Vec<u64> = std::iter::from_fn(|| outbox.try_next()).map(|f| n_of(&f)).collect();
        assert_eq!(order, vec![1, 3, 4]);
        assert_eq!(outbox.dropped(), 1);
        assert!(outbox.close_reason().is_none());
    }

    #[test]
    fn test_overflow_drops_new_droppable_when_all_critical() {
        let outbox = Outbox::new(2);
        outbox.push(frame(kinds::COMMENT_ADDED, 1));
        outbox.push(frame(kinds::COMMENT_ADDED, 2));
        assert_eq!(outbox.push(frame(kinds::CURSOR_MOVE, 3)), PushOutcome::Dropped);
        assert!(outbox.close_reason().is_none());
    }

    #[test]
    fn test_overflow_of_critical_closes_slow_consumer() {
        let outbox = Outbox::new(2);
        outbox.push(frame(kinds::COMMENT_ADDED, 1));
        outbox.push(frame(kinds::COMMENT_ADDED, 2));
        assert_eq!(outbox.push(frame(kinds::COMMENT_ADDED, 3)), PushOutcome::Closed);
        assert_eq!(outbox.close_reason(), Some(CloseReason::SlowConsumer));
        // Once closing, nothing else is accepted.
        assert_eq!(outbox.push(frame(kinds::CURSOR_MOVE, 4)), PushOutcome::Closed);
    }

    #[test]
    fn test_first_close_reason_wins() {
        let outbox = Outbox::new(2);
        outbox.close(CloseReason::HeartbeatTimeout);
        outbox.close(CloseReason::ServerShutdown);
        assert_eq!(outbox.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_next_waits_for_frame() {
        let outbox = Arc::new(Outbox::new(4));
        let writer = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.next().await })
        };
        tokio::task::yield_now().await;
        outbox.push(frame(kinds::USER_JOIN, 7));
        match writer.await.unwrap() {
            Outgoing::Frame(f) => assert_eq!(n_of(&f), 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_next_flushes_then_reports_close() {
        let outbox = Arc::new(Outbox::new(4));
        outbox.push(frame(kinds::ERROR, 1));
        outbox.close(CloseReason::ProtocolViolation);
        assert!(matches!(outbox.next().await, Outgoing::Frame(_)));
        assert!(matches!(
            outbox.next().await,
            Outgoing::Close(CloseReason::ProtocolViolation)
        ));
    }

    #[tokio::test]
    async fn test_slow_consumer_queue_is_abandoned() {
        let outbox = Arc::new(Outbox::new(1));
        outbox.push(frame(kinds::COMMENT_ADDED, 1));
        outbox.push(frame(kinds::COMMENT_ADDED, 2));
        assert!(matches!(
            outbox.next().await,
            Outgoing::Close(CloseReason::SlowConsumer)
        ));
    }

    #[test]
    fn test_protocol_error_counter() {
        let identity = UserIdentity {
            user_id: "u".into(),
            username: "u".into(),
            display_name: "U".into(),
            role: crate::collaborators::Role::Member,
        };
        let handle = ConnectionHandle::new(identity, "art-1", 8);
        assert_eq!(handle.record_protocol_error(), 1);
        assert_eq!(handle.record_protocol_error(), 2);
    }
}
