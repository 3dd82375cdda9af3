//! Fans upstream events out to WebSocket subscribers.
//!
//! One task per upstream source feeds the [`Hub`]; one task per subscriber
//! drains its queue into the socket. Shutdown is signalled over a watch
//! channel that every task selects on.

pub mod hub;
pub mod message;
pub mod source;
pub mod subscriber;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Context;
use crate::error::Error;

pub use hub::{Delivery, Hub, SubscriberId};
pub use message::{UpstreamEvent, WireMessage};
pub use source::{BlockFeed, ChannelSource, EventSource, PgNotifications};
pub use subscriber::{ClientFrame, CloseReason, Subscriber, SubscriberState};

pub struct NotificationBridge {
    ctx: Arc<Context>,
    hub: Arc<Hub>,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
    /// Held from sequence stamping through broadcast so frames reach every
    /// queue in `seq` order, whichever source published them.
    publishing: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationBridge {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            hub: Hub::new(ctx.config.subscriber_queue),
            ctx,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            publishing: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register a new subscriber in the Connecting state.
    pub async fn subscribe(&self) -> Subscriber {
        let registration = self.hub.register().await;
        let subscriber = Subscriber::new(
            self.hub.clone(),
            registration,
            self.ctx.config.subscriber_write_timeout,
        );
        if self.is_shut_down() {
            // registered after close_all ran; make sure it is not left behind
            self.hub.unregister(subscriber.id()).await;
        }
        subscriber
    }

    pub async fn subscriber_count(&self) -> usize {
        self.hub.len().await
    }

    /// Stamp the event with the next sequence number and queue it for
    /// every subscriber.
    pub async fn publish(&self, event: UpstreamEvent) -> Delivery {
        let _publishing = self.publishing.lock().await;
        let message = WireMessage::from_event(self.hub.next_seq(), event);
        let frame = match serde_json::to_string(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, seq = message.seq, "dropping unserializable event");
                return Delivery::default();
            }
        };
        let delivery = self.hub.broadcast(frame.into()).await;
        debug!(seq = message.seq, sent = delivery.sent, evicted = delivery.evicted, "event published");
        delivery
    }

    /// Pump `source` into the hub until it ends or the bridge shuts down.
    /// Losing the source shuts the whole bridge down.
    pub fn spawn_source<S>(self: &Arc<Self>, mut source: S)
    where
        S: EventSource + 'static,
    {
        let bridge = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            let name = source.name().to_string();
            info!(source = %name, "event source started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {}

                    next = source.next_event() => match next {
                        Ok(Some(event)) => {
                            bridge.publish(event).await;
                        }
                        Ok(None) => {
                            let e = Error::UpstreamDisconnect(format!("{name} ended"));
                            error!(error = %e, "shutting down bridge");
                            bridge.shutdown().await;
                            break;
                        }
                        Err(e) if e.is_fatal_upstream() => {
                            error!(source = %name, error = %e, "shutting down bridge");
                            bridge.shutdown().await;
                            break;
                        }
                        Err(e) => warn!(source = %name, error = %e, "dropping event"),
                    },
                }
            }
            info!(source = %name, "event source stopped");
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Stop every source and close every subscriber. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let closed = self.hub.close_all().await;
        info!(subscribers = closed, "bridge shut down");
    }

    /// Wait for every source task to finish.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "event source task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn bridge() -> Arc<NotificationBridge> {
        NotificationBridge::new(Context::new(Config::default()))
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bridge = bridge();
        let _sub = bridge.subscribe().await;
        assert_eq!(bridge.subscriber_count().await, 1);

        bridge.shutdown().await;
        bridge.shutdown().await;
        assert!(bridge.is_shut_down());
        assert!(*bridge.shutdown_signal().borrow());
        assert_eq!(bridge.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn sequence_numbers_follow_publish_order() {
        let bridge = bridge();
        let mut sub = bridge.hub().register().await;
        for _ in 0..3 {
            bridge
                .publish(UpstreamEvent::Notification {
                    channel: "blocks_notify".into(),
                    payload: json!({}),
                })
                .await;
        }
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let frame = sub.queue.recv().await.unwrap();
            let msg: WireMessage = serde_json::from_str(&frame).unwrap();
            seqs.push(msg.seq);
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_deliver_in_sequence_order() {
        let bridge = bridge();
        let mut sub = bridge.hub().register().await;

        let mut publishers = Vec::new();
        for source in 0..4 {
            let bridge = bridge.clone();
            publishers.push(tokio::spawn(async move {
                for n in 0..10 {
                    bridge
                        .publish(UpstreamEvent::Notification {
                            channel: format!("source_{source}"),
                            payload: json!({ "n": n }),
                        })
                        .await;
                }
            }));
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        let mut seqs = Vec::new();
        while let Ok(frame) = sub.queue.try_recv() {
            let msg: WireMessage = serde_json::from_str(&frame).unwrap();
            seqs.push(msg.seq);
        }
        assert_eq!(seqs.len(), 40);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn ended_source_shuts_the_bridge_down() {
        let bridge = bridge();
        let (tx, source) = ChannelSource::new(1);
        bridge.spawn_source(source);
        drop(tx);
        bridge.join().await;
        assert!(bridge.is_shut_down());
    }
}
