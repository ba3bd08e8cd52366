//! Notification dispatcher.
//!
//! ```text
//! notify(recipients, event) ──► mpsc ──► worker ──► BinaryHeap (priority, FIFO)
//!                                                    │
//!                              dedupe by event id ◄──┤
//!                         coalesce low priority  ◄──┤
//!                           persist notification ◄──┤
//!                                                    ▼
//!                          one task per channel: send, retry with backoff
//! ```
//!
//! `notify` never blocks and never fails from the caller's point of view.
//! Priority orders processing; nothing is dropped because of it. Each
//! delivery channel runs in its own task so a failing channel never delays
//! or fails another.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::collaborators::DeliveryChannel;
use crate::config::EngineConfig;
use crate::error::{ChannelDeliveryError, CollabError, Result};
use crate::model::{Notification, NotificationKind, Priority};
use crate::protocol::{kinds, now_millis, Envelope};
use crate::room::RoomRegistry;
use crate::storage::DurableStore;

/// Something worth telling a user about.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyEvent {
    /// Re-notifying the same event to the same recipient is a no-op.
    pub event_id: Uuid,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub actor: String,
    pub artifact_id: String,
    pub payload: Value,
}

struct Job {
    recipient: String,
    event: Arc<NotifyEvent>,
    seq: u64,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    /// Highest priority first, then oldest first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.event
            .priority
            .cmp(&other.event.priority)
            .then_with(|| Reverse(self.seq).cmp(&Reverse(other.seq)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CoalesceKey {
    recipient: String,
    actor: String,
    kind: NotificationKind,
    artifact_id: String,
}

/// Outstanding jobs and delivery tasks, for [`Dispatcher::flush`].
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Inner {
    store: Arc<dyn DurableStore>,
    channels: Vec<Arc<dyn DeliveryChannel>>,
    seen: Mutex<HashMap<(String, Uuid), Instant>>,
    coalesced: Mutex<HashMap<CoalesceKey, (Uuid, Instant)>>,
    in_flight: InFlight,
    coalesce_window: Duration,
    attempts: u32,
    backoff: Duration,
    delivered: AtomicU64,
    failed: AtomicU64,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Job>,
    seq: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
}

impl Dispatcher {
    /// Spawns the worker; must be called inside a tokio runtime.
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn DurableStore>,
        channels: Vec<Arc<dyn DeliveryChannel>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            store,
            channels,
            seen: Mutex::new(HashMap::new()),
            coalesced: Mutex::new(HashMap::new()),
            in_flight: InFlight::default(),
            coalesce_window: config.coalesce_window,
            attempts: config.delivery_attempts.max(1),
            backoff: config.delivery_backoff,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(inner.clone(), rx));
        Self {
            inner,
            tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Queue `event` for every recipient. Fire-and-forget.
    pub fn notify(&self, recipients: &[String], event: NotifyEvent) {
        let event = Arc::new(event);
        for recipient in recipients {
            self.inner.in_flight.start();
            let job = Job {
                recipient: recipient.clone(),
                event: event.clone(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            };
            if self.tx.send(job).is_err() {
                self.inner.in_flight.finish();
                log::error!("Notification worker stopped; dropping event {}", event.event_id);
            }
        }
    }

    /// Wait until every queued job and delivery attempt has finished.
    pub async fn flush(&self) {
        loop {
            let mut idle = pin!(self.inner.in_flight.idle.notified());
            idle.as_mut().enable();
            if self.inner.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Mark one notification read. Already-read notifications keep their
    /// original `read_at`. Returns the recipient's unread count.
    pub async fn mark_read(&self, recipient: &str, id: Uuid) -> Result<u64> {
        let store = &self.inner.store;
        let mut notification = store
            .get_notification(recipient, id)
            .await?
            .ok_or_else(|| CollabError::not_found("notification", id))?;
        if !notification.read {
            notification.read = true;
            notification.read_at = Some(now_millis());
            store.update_notification(&notification).await?;
        }
        Ok(store.unread_count(recipient).await?)
    }

    /// Mark everything read; returns how many changed.
    pub async fn mark_all_read(&self, recipient: &str) -> Result<u64> {
        let store = &self.inner.store;
        let now = now_millis();
        let mut changed = 0;
        for mut notification in store.list_notifications(recipient).await? {
            if !notification.read {
                notification.read = true;
                notification.read_at = Some(now);
                store.update_notification(&notification).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub async fn unread_count(&self, recipient: &str) -> Result<u64> {
        Ok(self.inner.store.unread_count(recipient).await?)
    }

    pub async fn list(&self, recipient: &str) -> Result<Vec<Notification>> {
        Ok(self.inner.store.list_notifications(recipient).await?)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Job>) {
    let mut heap: BinaryHeap<Job> = BinaryHeap::new();
    loop {
        if heap.is_empty() {
            match rx.recv().await {
                Some(job) => heap.push(job),
                None => break,
            }
        }
        while let Ok(job) = rx.try_recv() {
            heap.push(job);
        }
        if let Some(job) = heap.pop() {
            process(&inner, job).await;
            inner.in_flight.finish();
        }
    }
    log::debug!("Notification worker stopped");
}

async fn process(inner: &Arc<Inner>, job: Job) {
    let now = Instant::now();
    let event = &job.event;

    {
        let mut seen = inner.seen.lock();
        if seen.contains_key(&(job.recipient.clone(), event.event_id)) {
            log::debug!("Duplicate event {} for {}", event.event_id, job.recipient);
            return;
        }
        if seen.len() > 10_000 {
            let horizon = inner.coalesce_window * 10;
            seen.retain(|_, at| now.saturating_duration_since(*at) < horizon);
        }
        seen.insert((job.recipient.clone(), event.event_id), now);
    }

    if event.priority == Priority::Low && coalesce(inner, &job, now).await {
        return;
    }

    let notification = Notification {
        id: Uuid::new_v4(),
        recipient: job.recipient.clone(),
        kind: event.kind,
        priority: event.priority,
        read: false,
        read_at: None,
        payload: event.payload.clone(),
        actor: event.actor.clone(),
        artifact_id: event.artifact_id.clone(),
        created_at: now_millis(),
        count: 1,
    };
    if let Err(e) = inner.store.insert_notification(&notification).await {
        log::error!("Failed to persist notification for {}: {e}", job.recipient);
        return;
    }
    if event.priority == Priority::Low {
        let window = inner.coalesce_window;
        let mut coalesced = inner.coalesced.lock();
        coalesced.retain(|_, (_, at)| now.saturating_duration_since(*at) < window);
        coalesced.insert(coalesce_key(&job), (notification.id, now));
    }

    let payload = match serde_json::to_value(&notification) {
        Ok(value) => Arc::new(value),
        Err(e) => {
            log::error!("Failed to encode notification {}: {e}", notification.id);
            return;
        }
    };
    for channel in &inner.channels {
        inner.in_flight.start();
        tokio::spawn(deliver(
            inner.clone(),
            channel.clone(),
            job.recipient.clone(),
            payload.clone(),
        ));
    }
}

fn coalesce_key(job: &Job) -> CoalesceKey {
    CoalesceKey {
        recipient: job.recipient.clone(),
        actor: job.event.actor.clone(),
        kind: job.event.kind,
        artifact_id: job.event.artifact_id.clone(),
    }
}

/// Fold a low-priority event into an unread notification from the same
/// actor created within the window. Returns `true` if folded.
async fn coalesce(inner: &Inner, job: &Job, now: Instant) -> bool {
    let key = coalesce_key(job);
    let target = {
        let mut coalesced = inner.coalesced.lock();
        match coalesced.get(&key) {
            Some((id, at)) if now.saturating_duration_since(*at) < inner.coalesce_window => *id,
            Some(_) => {
                coalesced.remove(&key);
                return false;
            }
            None => return false,
        }
    };

    let mut notification = match inner.store.get_notification(&job.recipient, target).await {
        Ok(Some(n)) if !n.read => n,
        Ok(_) => {
            inner.coalesced.lock().remove(&key);
            return false;
        }
        Err(e) => {
            log::warn!("Coalescing lookup failed for {}: {e}", job.recipient);
            return false;
        }
    };
    notification.count += 1;
    if let Value::Object(map) = &mut notification.payload {
        map.insert("count".into(), json!(notification.count));
    }
    match inner.store.update_notification(&notification).await {
        Ok(()) => {
            log::debug!(
                "Coalesced event {} into notification {} (count {})",
                job.event.event_id,
                notification.id,
                notification.count
            );
            true
        }
        Err(e) => {
            log::warn!("Coalescing update failed for {}: {e}", job.recipient);
            false
        }
    }
}

async fn deliver(
    inner: Arc<Inner>,
    channel: Arc<dyn DeliveryChannel>,
    recipient: String,
    payload: Arc<Value>,
) {
    let mut delay = inner.backoff;
    for attempt in 1..=inner.attempts {
        match channel.send(&recipient, &payload).await {
            Ok(()) => {
                inner.delivered.fetch_add(1, Ordering::Relaxed);
                inner.in_flight.finish();
                return;
            }
            Err(e) if attempt < inner.attempts => {
                log::warn!("{e} (attempt {attempt}/{}), retrying in {delay:?}", inner.attempts);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                log::error!("{e}; giving up after {attempt} attempts");
            }
        }
    }
    inner.failed.fetch_add(1, Ordering::Relaxed);
    inner.in_flight.finish();
}

/// Pushes a `notification` envelope to the recipient's live connections on
/// this process. Offline recipients find it in their stored notifications.
pub struct InAppChannel {
    registry: Arc<RoomRegistry>,
}

impl InAppChannel {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn name(&self) -> &str {
        "in_app"
    }

    async fn send(
        &self,
        recipient: &str,
        payload: &Value,
    ) -> std::result::Result<(), ChannelDeliveryError> {
        let frame = Envelope::system(kinds::NOTIFICATION, payload.clone()).into_frame();
        let delivered = self.registry.send_to_user(recipient, &frame);
        log::trace!("In-app notification to {recipient} reached {delivered} connections");
        Ok(())
    }
}
