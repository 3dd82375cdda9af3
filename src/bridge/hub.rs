//! Subscriber registry and broadcaster.
//!
//! Each subscriber owns a bounded queue. Broadcast never waits on a queue:
//! a full or closed queue gets its subscriber evicted instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, warn};

pub type SubscriberId = u64;

/// Frames are shared between all queues.
pub type Frame = Arc<str>;

#[derive(Clone)]
struct Slot {
    queue: mpsc::Sender<Frame>,
    evicted: Arc<Notify>,
}

/// Receiving end handed to a new subscriber.
pub struct Registration {
    pub id: SubscriberId,
    pub queue: mpsc::Receiver<Frame>,
    /// Signalled when the hub drops this subscriber.
    pub evicted: Arc<Notify>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub evicted: usize,
}

pub struct Hub {
    subscribers: RwLock<HashMap<SubscriberId, Slot>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    queue_size: usize,
}

impl Hub {
    pub fn new(queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (queue, rx) = mpsc::channel(self.queue_size);
        let evicted = Arc::new(Notify::new());
        self.subscribers.write().await.insert(
            id,
            Slot {
                queue,
                evicted: evicted.clone(),
            },
        );
        debug!(subscriber = id, "subscriber registered");
        Registration {
            id,
            queue: rx,
            evicted,
        }
    }

    pub async fn unregister(&self, id: SubscriberId) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!(subscriber = id, "subscriber unregistered");
        }
    }

    /// Queue `frame` for every subscriber. The registry lock is only held to
    /// snapshot the queues and later to remove evicted entries.
    pub async fn broadcast(&self, frame: Frame) -> Delivery {
        let snapshot: Vec<(SubscriberId, Slot)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut delivery = Delivery::default();
        let mut evict = Vec::new();
        for (id, slot) in snapshot {
            match slot.queue.try_send(frame.clone()) {
                Ok(()) => delivery.sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber queue full, evicting");
                    evict.push((id, slot));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push((id, slot)),
            }
        }

        if !evict.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for (id, slot) in evict {
                subscribers.remove(&id);
                slot.evicted.notify_one();
                delivery.evicted += 1;
            }
        }
        delivery
    }

    /// Drop every subscriber and wake each one so it closes.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Slot> = self.subscribers.write().await.drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.evicted.notify_one();
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
