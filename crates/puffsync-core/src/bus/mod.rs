//! Status & event bus
//!
//! In-process publish/subscribe for connection status transitions and
//! reconciled puff events.
//!
//! Every subscriber owns an unbounded FIFO queue, so delivery order per
//! subscriber equals emission order and a slow or vanished subscriber never
//! blocks the publisher or any other subscriber.
//!
//! ```text
//! publish_status ──┬──► [queue] ──► Subscription<ConnectionStatus>
//!                  └──► [queue] ──► Subscription<ConnectionStatus>
//! publish_event  ──────► [queue] ──► Subscription<PuffEvent>
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::trace;

/// Connection status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        })
    }
}

/// A discrete usage event derived from the device counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuffEvent {
    /// Number of puffs this event accounts for (always > 0)
    pub delta: u32,
    /// Raw device counter at emission
    pub total: u32,
    /// When the event was emitted
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl PuffEvent {
    pub(crate) fn new(delta: u32, total: u32) -> Self {
        Self {
            delta,
            total,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    Status,
    Events,
}

struct BusState {
    status: ConnectionStatus,
    next_id: u64,
    status_subscribers: Vec<(u64, mpsc::UnboundedSender<ConnectionStatus>)>,
    event_subscribers: Vec<(u64, mpsc::UnboundedSender<PuffEvent>)>,
}

impl BusState {
    fn remove(&mut self, topic: Topic, id: u64) {
        match topic {
            Topic::Status => self.status_subscribers.retain(|(sid, _)| *sid != id),
            Topic::Events => self.event_subscribers.retain(|(sid, _)| *sid != id),
        }
    }
}

// Nothing panics while holding the lock, but a panicking subscriber
// elsewhere must not wedge the bus.
fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish/subscribe hub owned by a session
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct SessionBus {
    state: Arc<Mutex<BusState>>,
}

impl SessionBus {
    /// Create a bus whose current status is `Disconnected`
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                status: ConnectionStatus::Disconnected,
                next_id: 0,
                status_subscribers: Vec::new(),
                event_subscribers: Vec::new(),
            })),
        }
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Subscribe to status transitions
    ///
    /// The current status is queued as the first delivery, under the same
    /// lock that transitions take, so no transition can slip in between.
    pub fn subscribe_status(&self) -> Subscription<ConnectionStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        // Receiver is alive in this scope
        let _ = tx.send(state.status);
        state.status_subscribers.push((id, tx));
        drop(state);

        Subscription::new(id, Topic::Status, rx, &self.state)
    }

    /// Subscribe to puff events emitted from now on
    pub fn subscribe_events(&self) -> Subscription<PuffEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.event_subscribers.push((id, tx));
        drop(state);

        Subscription::new(id, Topic::Events, rx, &self.state)
    }

    /// Transition to `status` and deliver it to every status subscriber
    ///
    /// Returns `false` (and delivers nothing) when `status` is already current.
    pub fn publish_status(&self, status: ConnectionStatus) -> bool {
        let mut state = lock(&self.state);
        if state.status == status {
            return false;
        }
        trace!(from = %state.status, to = %status, "Status transition");
        state.status = status;
        state
            .status_subscribers
            .retain(|(_, tx)| tx.send(status).is_ok());
        true
    }

    /// Deliver a puff event to every event subscriber
    pub fn publish_event(&self, event: PuffEvent) {
        let mut state = lock(&self.state);
        state
            .event_subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers as `(status, events)`
    pub fn subscriber_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.status_subscribers.len(), state.event_subscribers.len())
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability to end a subscription from anywhere
///
/// Idempotent, and safe to call while the subscriber is in the middle of
/// handling a delivery.
#[derive(Clone)]
pub struct Unsubscribe {
    id: u64,
    topic: Topic,
    bus: Weak<Mutex<BusState>>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            lock(&bus).remove(self.topic, self.id);
        }
    }
}

/// A live subscription to one topic of a [`SessionBus`]
///
/// Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    handle: Unsubscribe,
}

impl<T> Subscription<T> {
    fn new(
        id: u64,
        topic: Topic,
        rx: mpsc::UnboundedReceiver<T>,
        bus: &Arc<Mutex<BusState>>,
    ) -> Self {
        Self {
            rx,
            handle: Unsubscribe {
                id,
                topic,
                bus: Arc::downgrade(bus),
            },
        }
    }

    /// Wait for the next delivery
    ///
    /// Returns `None` once unsubscribed (after draining what was already
    /// delivered) or when the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next delivery if one is queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// A detached capability that ends this subscription
    pub fn unsubscriber(&self) -> Unsubscribe {
        self.handle.clone()
    }

    /// End the subscription
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
