//! In-process change watcher bus.
//!
//! The store layer publishes post-commit snapshots; consumers subscribe
//! with a filter predicate evaluated at publish time. Each consumer owns an
//! independent bounded mailbox with drop-oldest overflow, so a slow
//! consumer loses old events rather than blocking the publisher. The
//! stream is a hint channel, not a durable log; consumers re-read the
//! store when they resync.

mod store;

pub use store::WatchedStore;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::Notify;

use bellows_core::error::{BellowsError, Result};
use bellows_core::events::{ChangeEvent, EventFilter};

/// Default mailbox capacity per consumer.
const DEFAULT_MAILBOX_CAPACITY: usize = 128;

#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<ChangeEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: ChangeEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

struct Registration {
    filter: EventFilter,
    mailbox: Arc<Mailbox>,
}

/// The watcher bus. One per process.
pub struct Bus {
    consumers: RwLock<HashMap<String, Registration>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            consumers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a consumer under a unique ID.
    ///
    /// Duplicate IDs are rejected; a consumer ID names exactly one owner at
    /// a time.
    pub fn register_consumer(self: &Arc<Self>, id: &str, filter: EventFilter) -> Result<Consumer> {
        let mailbox = Arc::new(Mailbox::new(DEFAULT_MAILBOX_CAPACITY));
        {
            let mut consumers = self.consumers.write().unwrap();
            if consumers.contains_key(id) {
                return Err(BellowsError::Conflict(format!(
                    "consumer {} is already registered",
                    id
                )));
            }
            consumers.insert(
                id.to_string(),
                Registration {
                    filter,
                    mailbox: mailbox.clone(),
                },
            );
        }
        tracing::debug!(consumer = %id, "watcher consumer registered");
        Ok(Consumer {
            id: id.to_string(),
            mailbox,
            bus: Arc::downgrade(self),
        })
    }

    /// Deliver an event to every consumer whose filter accepts it.
    pub fn publish(&self, event: ChangeEvent) {
        let consumers = self.consumers.read().unwrap();
        for registration in consumers.values() {
            if (registration.filter)(&event) {
                registration.mailbox.push(event.clone());
            }
        }
    }

    fn deregister(&self, id: &str) {
        let mut consumers = self.consumers.write().unwrap();
        consumers.remove(id);
    }

    /// Number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap().len()
    }
}

/// One subscription on the bus.
///
/// Dropping the consumer closes it.
#[derive(Debug)]
pub struct Consumer {
    id: String,
    mailbox: Arc<Mailbox>,
    bus: Weak<Bus>,
}

impl Consumer {
    /// Receive the next event, waiting if the mailbox is empty.
    ///
    /// Returns `None` once the consumer is closed and drained.
    pub async fn recv(&self) -> Option<ChangeEvent> {
        loop {
            {
                let mut queue = self.mailbox.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.mailbox.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Events dropped on overflow so far. A non-zero value means the
    /// consumer should resync from the store.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Close the subscription. Idempotent.
    pub fn close(&self) {
        if self.mailbox.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mailbox.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.deregister(&self.id);
        }
        tracing::debug!(consumer = %self.id, "watcher consumer closed");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellows_core::events::{
        with_entity_scale_set_filter, with_everything, EventPayload, OperationType,
    };
    use bellows_core::forge::{EntityKind, ForgeKind};
    use bellows_core::testing::{sample_credentials, sample_entity, sample_scale_set};

    fn scale_set_event(entity: &bellows_core::forge::ForgeEntity, id: i64) -> ChangeEvent {
        ChangeEvent::new(
            OperationType::Create,
            EventPayload::ScaleSet(sample_scale_set(id, entity)),
        )
    }

    #[tokio::test]
    async fn test_filtered_delivery() {
        let bus = Bus::new();
        let creds = sample_credentials(1, ForgeKind::Github);
        let ours = sample_entity(EntityKind::Organization, creds.clone());
        let theirs = sample_entity(EntityKind::Repository, creds);

        let consumer = bus
            .register_consumer("controller", with_entity_scale_set_filter(ours.id))
            .unwrap();

        bus.publish(scale_set_event(&theirs, 1));
        bus.publish(scale_set_event(&ours, 2));

        let event = consumer.recv().await.unwrap();
        match event.payload {
            EventPayload::ScaleSet(s) => assert_eq!(s.id, 2),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let bus = Bus::new();
        let _first = bus.register_consumer("dup", with_everything()).unwrap();
        let err = bus.register_consumer("dup", with_everything()).unwrap_err();
        assert!(matches!(err, BellowsError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_deregisters() {
        let bus = Bus::new();
        let consumer = bus.register_consumer("once", with_everything()).unwrap();
        assert_eq!(bus.consumer_count(), 1);

        consumer.close();
        consumer.close();
        assert_eq!(bus.consumer_count(), 0);
        assert!(consumer.recv().await.is_none());

        // The ID is free again.
        let _again = bus.register_consumer("once", with_everything()).unwrap();
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = Bus::new();
        let creds = sample_credentials(1, ForgeKind::Github);
        let entity = sample_entity(EntityKind::Organization, creds);
        let consumer = bus.register_consumer("slow", with_everything()).unwrap();

        for i in 0..(DEFAULT_MAILBOX_CAPACITY as i64 + 3) {
            bus.publish(scale_set_event(&entity, i));
        }

        assert_eq!(consumer.dropped(), 3);
        // The head of the queue is the oldest survivor.
        let event = consumer.recv().await.unwrap();
        match event.payload {
            EventPayload::ScaleSet(s) => assert_eq!(s.id, 3),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_drains_after_close() {
        let bus = Bus::new();
        let creds = sample_credentials(1, ForgeKind::Github);
        let entity = sample_entity(EntityKind::Organization, creds);
        let consumer = bus.register_consumer("drain", with_everything()).unwrap();

        bus.publish(scale_set_event(&entity, 1));
        consumer.close();

        assert!(consumer.recv().await.is_some());
        assert!(consumer.recv().await.is_none());
    }
}
