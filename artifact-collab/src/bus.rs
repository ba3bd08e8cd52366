//! Cross-process room fan-out.
//!
//! The room registry publishes every broadcast to a [`RoomBus`]; each
//! process relays frames it receives from the bus to its own local
//! members. A single-process deployment uses [`LocalBus`], which drops
//! everything.
//!
//! [`BroadcastBus`] models a broker with a tokio broadcast channel shared
//! by several registries in one process (integration tests, embedded
//! multi-node setups). A network broker adapter implements the same trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::ConnectionId;
use crate::protocol::Frame;

/// One room broadcast as carried on the bus.
#[derive(Debug, Clone)]
pub struct BusFrame {
    /// Node id of the publishing registry
    pub origin: Uuid,
    pub room_id: String,
    pub frame: Frame,
    pub exclude: Option<ConnectionId>,
}

/// Abstract "publish to topic" capability.
pub trait RoomBus: Send + Sync {
    fn publish(&self, frame: BusFrame);

    /// Receiver for frames published by any node, if this bus delivers any.
    fn subscribe(&self) -> Option<broadcast::Receiver<Arc<BusFrame>>>;
}

/// No-op bus for single-process deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBus;

impl RoomBus for LocalBus {
    fn publish(&self, _frame: BusFrame) {}

    fn subscribe(&self) -> Option<broadcast::Receiver<Arc<BusFrame>>> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub active_subscribers: usize,
}

/// In-process broker shared by several registries.
pub struct BroadcastBus {
    sender: broadcast::Sender<Arc<BusFrame>>,
    capacity: usize,
    published: AtomicU64,
}

impl BroadcastBus {
    /// `capacity` frames are buffered per subscriber before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            active_subscribers: self.sender.receiver_count(),
        }
    }
}

impl RoomBus for BroadcastBus {
    fn publish(&self, frame: BusFrame) {
        // No subscribers is not an error.
        let _ = self.sender.send(Arc::new(frame));
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Arc<BusFrame>>> {
        Some(self.sender.subscribe())
    }
}

impl<T: RoomBus + ?Sized> RoomBus for Arc<T> {
    fn publish(&self, frame: BusFrame) {
        (**self).publish(frame)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Arc<BusFrame>>> {
        (**self).subscribe()
    }
}
