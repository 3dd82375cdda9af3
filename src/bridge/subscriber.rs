//! One connected subscriber and the task that streams to it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::hub::{Frame, Hub, Registration, SubscriberId};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Subscribed,
    Streaming,
    Closed,
}

impl SubscriberState {
    /// Forward-only: Connecting, Subscribed, Streaming, then Closed from
    /// anywhere. Nothing leaves Closed.
    pub fn can_advance_to(self, next: SubscriberState) -> bool {
        use SubscriberState::*;
        matches!(
            (self, next),
            (Connecting, Subscribed) | (Subscribed, Streaming) | (Connecting | Subscribed | Streaming, Closed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    WriteFailed(String),
    /// A write did not finish within the write timeout.
    Unresponsive,
    /// The hub dropped the subscriber, usually on queue overflow.
    Evicted,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {e}"),
            CloseReason::Unresponsive => write!(f, "write timed out"),
            CloseReason::Evicted => write!(f, "evicted"),
            CloseReason::Shutdown => write!(f, "bridge shutdown"),
        }
    }
}

/// Inbound frames, reduced to what the subscriber loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close,
    Other,
}

pub struct Subscriber {
    id: SubscriberId,
    hub: Arc<Hub>,
    queue: mpsc::Receiver<Frame>,
    evicted: Arc<Notify>,
    state: watch::Sender<SubscriberState>,
    write_timeout: Duration,
}

impl Subscriber {
    pub(crate) fn new(hub: Arc<Hub>, registration: Registration, write_timeout: Duration) -> Self {
        let (state, _) = watch::channel(SubscriberState::Connecting);
        Self {
            id: registration.id,
            hub,
            queue: registration.queue,
            evicted: registration.evicted,
            state,
            write_timeout,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Follow state changes from outside the subscriber task.
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    fn advance(&self, next: SubscriberState) -> bool {
        let current = self.state();
        if !current.can_advance_to(next) {
            return false;
        }
        self.state.send_replace(next);
        debug!(subscriber = self.id, from = ?current, to = ?next, "subscriber state");
        true
    }

    /// The transport handshake finished.
    pub fn handshake_complete(&self) -> bool {
        self.advance(SubscriberState::Subscribed)
    }

    /// Stream queued frames to `sink` until the client goes away, a write
    /// fails or times out, the hub evicts us, or the bridge shuts down.
    /// The subscriber is unregistered before this returns.
    pub async fn run<Si, St>(
        mut self,
        mut sink: Si,
        mut inbound: St,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloseReason
    where
        Si: Sink<String> + Unpin,
        Si::Error: fmt::Display,
        St: Stream<Item = ClientFrame> + Unpin,
    {
        if self.state() == SubscriberState::Connecting {
            self.advance(SubscriberState::Subscribed);
        }
        self.advance(SubscriberState::Streaming);

        let reason = if *shutdown.borrow() {
            CloseReason::Shutdown
        } else {
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break CloseReason::Shutdown;
                        }
                    }

                    _ = self.evicted.notified() => break CloseReason::Evicted,

                    frame = self.queue.recv() => {
                        let Some(frame) = frame else {
                            break CloseReason::Evicted;
                        };
                        match timeout(self.write_timeout, sink.send(frame.to_string())).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break CloseReason::WriteFailed(e.to_string()),
                            Err(_) => {
                                let e = Error::SubscriberUnresponsive(self.id);
                                warn!(error = %e, timeout = ?self.write_timeout, "closing subscriber");
                                break CloseReason::Unresponsive;
                            }
                        }
                    }

                    frame = inbound.next() => match frame {
                        Some(ClientFrame::Close) | None => break CloseReason::ClientClosed,
                        Some(ClientFrame::Text(text)) => {
                            debug!(subscriber = self.id, len = text.len(), "ignoring client text frame");
                        }
                        Some(ClientFrame::Other) => {}
                    },
                }
            }
        };

        self.advance(SubscriberState::Closed);
        self.queue.close();
        self.hub.unregister(self.id).await;
        if reason != CloseReason::Unresponsive {
            let _ = timeout(self.write_timeout, sink.close()).await;
        }
        info!(subscriber = self.id, %reason, "subscriber closed");
        reason
    }
}
